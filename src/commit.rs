//! Commit coordinator
//!
//! Finalizes a session from an explicit ordering of server identifiers. A
//! failed commit request is ambiguous: the service may have applied it before
//! the connection dropped. Before every retry the coordinator asks the service
//! for the session state and only re-sends while the session is still open
//! server-side.

use crate::config::PartPolicy;
use crate::error::{MpuError, MpuResult};
use crate::retry::{RetryBudget, RetryPolicy};
use crate::session::{RemoteStatus, SessionManager};
use crate::transport::wire::{self, CommitRequest, CommitResponse, Operation};
use crate::transport::{exchange, Method, Request, Transport};
use crate::types::{first_duplicate, ObjectReference, Session, SessionState};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub struct CommitCoordinator {
    transport: Arc<dyn Transport>,
    sessions: Arc<SessionManager>,
    retry: RetryPolicy,
    policy: PartPolicy,
}

impl CommitCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        sessions: Arc<SessionManager>,
        retry: RetryPolicy,
        policy: PartPolicy,
    ) -> Self {
        Self {
            transport,
            sessions,
            retry,
            policy,
        }
    }

    /// Commit `ordered_identifiers` as the final object content, in order.
    ///
    /// Malformed orderings are rejected with the session left `Open`. Once the
    /// session has moved to `Committing`, failures leave it there so the
    /// caller can still abort.
    #[instrument(skip_all, fields(session_id = %session.id(), parts = ordered_identifiers.len()))]
    pub async fn commit(
        &self,
        session: &Session,
        ordered_identifiers: &[String],
    ) -> MpuResult<ObjectReference> {
        if ordered_identifiers.is_empty() {
            return Err(MpuError::Validation(
                "commit ordering must list at least one part".to_string(),
            ));
        }
        if let Some(dup) = first_duplicate(ordered_identifiers) {
            return Err(MpuError::Validation(format!(
                "part {} appears more than once in commit ordering",
                dup
            )));
        }

        session
            .transition(SessionState::Open, SessionState::Committing)
            .map_err(|state| MpuError::SessionNotOpen {
                session_id: session.id().to_string(),
                state,
            })?;

        let parts = session
            .resolve_ordering(ordered_identifiers)
            .map_err(|identifier| MpuError::MissingPart {
                session_id: session.id().to_string(),
                identifier,
            })?;
        let sizes: Vec<(u32, u64)> = parts.iter().map(|p| (p.part_number, p.size_bytes)).collect();
        self.policy.check_ordering(&sizes)?;

        self.send_until_resolved(session, ordered_identifiers).await
    }

    async fn send_until_resolved(
        &self,
        session: &Session,
        ordered_identifiers: &[String],
    ) -> MpuResult<ObjectReference> {
        let payload = CommitRequest {
            parts_location: session.parts_location().to_string(),
            ordered_identifiers: ordered_identifiers.to_vec(),
        };
        let mut budget = RetryBudget::new(&self.retry, format!("commit session {}", session.id()));

        loop {
            let state = session.state();
            if state != SessionState::Committing {
                return Err(MpuError::SessionNotOpen {
                    session_id: session.id().to_string(),
                    state,
                });
            }

            let error = match self.send(session, &payload).await {
                Ok(reference) => return Ok(self.finish(session, reference)),
                Err(e) => e,
            };

            let ambiguous =
                error.is_retryable() || error.observed_state() == Some(SessionState::Committed);
            if !ambiguous {
                if error.observed_state() == Some(SessionState::Aborted) {
                    self.mark_aborted_remotely(session);
                }
                return Err(error);
            }

            debug!("commit attempt failed, checking session state: {}", error);
            match self.sessions.status(session).await {
                Ok(RemoteStatus {
                    state: SessionState::Committed,
                    object_reference,
                }) => {
                    let reference = object_reference.unwrap_or_else(|| ObjectReference {
                        path: session.target_path().to_string(),
                        digest: None,
                        size: None,
                    });
                    info!("commit was applied before the failure");
                    return Ok(self.finish(session, reference));
                }
                Ok(RemoteStatus {
                    state: SessionState::Aborted,
                    ..
                }) => {
                    self.mark_aborted_remotely(session);
                    return Err(MpuError::SessionNotOpen {
                        session_id: session.id().to_string(),
                        state: SessionState::Aborted,
                    });
                }
                Ok(_) => {}
                Err(status_error) => {
                    debug!("session state unknown: {}", status_error);
                }
            }

            let delay = budget.on_failure(error)?;
            tokio::time::sleep(delay).await;
        }
    }

    async fn send(&self, session: &Session, payload: &CommitRequest) -> MpuResult<ObjectReference> {
        let request =
            Request::new(Method::Post, wire::commit_path(session.parts_location())).json(payload)?;
        let reply: CommitResponse =
            exchange(self.transport.as_ref(), request, Operation::Commit, Some(session))
                .await?
                .decode()?;
        Ok(reply.object_reference)
    }

    fn finish(&self, session: &Session, reference: ObjectReference) -> ObjectReference {
        if let Err(observed) = session.transition(SessionState::Committing, SessionState::Committed) {
            // A concurrent abort lost the race server-side and records the commit itself
            debug!(state = %observed, "session left committing during commit");
        }
        info!(path = %reference.path, size = ?reference.size, "session committed");
        reference
    }

    fn mark_aborted_remotely(&self, session: &Session) {
        if session
            .transition(SessionState::Committing, SessionState::Aborted)
            .is_ok()
        {
            warn!("session was aborted server-side during commit");
        }
    }
}
