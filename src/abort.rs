//! Abort and cleanup handler

use crate::error::{MpuError, MpuResult};
use crate::retry::{with_retry, RetryPolicy};
use crate::transport::wire::{self, AbortRequest, Operation};
use crate::transport::{exchange, Method, Request, Transport};
use crate::types::{Session, SessionState};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Discards sessions and their staged parts
pub struct AbortHandler {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl AbortHandler {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Abort a session.
    ///
    /// Aborting an aborted session is a no-op. Aborting a committed session
    /// fails with `AlreadyCommitted`. A concurrent abort in progress is awaited
    /// and its outcome shared. If the abort request itself cannot be delivered
    /// the session ends `Failed`.
    #[instrument(skip_all, fields(session_id = %session.id()))]
    pub async fn abort(&self, session: &Session) -> MpuResult<()> {
        let previous = match session.transition_from_any(
            &[SessionState::Open, SessionState::Committing],
            SessionState::Aborting,
        ) {
            Ok(previous) => previous,
            Err(SessionState::Aborting) => {
                debug!("abort already in progress, waiting");
                return settled(session, session.wait_terminal().await);
            }
            Err(observed) => return settled(session, observed),
        };

        debug!(from = %previous, "aborting session");
        let result = with_retry(&self.retry, "abort session", || async {
            let request = Request::new(Method::Post, wire::abort_path(session.parts_location()))
                .json(&AbortRequest {
                    parts_location: session.parts_location().to_string(),
                })?;
            exchange(self.transport.as_ref(), request, Operation::Abort, Some(session)).await?;
            Ok(())
        })
        .await;

        match result {
            Ok(()) => self.finish(session, SessionState::Aborted),
            Err(e) => match e.observed_state() {
                // The service no longer knows the session; its parts are gone
                Some(SessionState::Aborted) => self.finish(session, SessionState::Aborted),
                Some(SessionState::Committed) => {
                    warn!("commit completed before abort reached the service");
                    self.finish(session, SessionState::Committed)
                }
                _ => {
                    warn!("abort failed: {}", e);
                    if let Err(observed) =
                        session.transition(SessionState::Aborting, SessionState::Failed)
                    {
                        debug!(state = %observed, "session left aborting before abort failed");
                    }
                    Err(e.context(format!("abort of session {}", session.id())))
                }
            },
        }
    }

    fn finish(&self, session: &Session, outcome: SessionState) -> MpuResult<()> {
        match session.transition(SessionState::Aborting, outcome) {
            Ok(()) => {
                if outcome == SessionState::Aborted {
                    info!("session aborted");
                }
                settled(session, outcome)
            }
            Err(observed) => settled(session, observed),
        }
    }
}

/// Map a terminal state reached by someone else onto the abort result
fn settled(session: &Session, state: SessionState) -> MpuResult<()> {
    match state {
        SessionState::Aborted => Ok(()),
        SessionState::Committed => Err(MpuError::AlreadyCommitted {
            session_id: session.id().to_string(),
        }),
        state => Err(MpuError::SessionNotOpen {
            session_id: session.id().to_string(),
            state,
        }),
    }
}
