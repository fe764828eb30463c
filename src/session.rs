//! Session manager: opens sessions and queries their server-side state

use crate::error::{MpuError, MpuResult};
use crate::retry::{with_retry, RetryPolicy};
use crate::transport::wire::{self, OpenRequest, OpenResponse, Operation, StatusResponse};
use crate::transport::{exchange, Method, Request, Transport};
use crate::types::{ObjectReference, Session, SessionState};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Server-side view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStatus {
    pub state: SessionState,
    /// Present once the session is committed
    pub object_reference: Option<ObjectReference>,
}

/// Opens multipart sessions
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Open a new session for `target_path` with `durability_level` replicas.
    ///
    /// Path and durability are checked locally first; the service has the
    /// final word on which durability levels it accepts.
    #[instrument(skip(self))]
    pub async fn open_session(&self, target_path: &str, durability_level: u32) -> MpuResult<Session> {
        let account = wire::account_of(target_path)?;
        if durability_level == 0 {
            return Err(MpuError::Validation(
                "durability level must be positive".to_string(),
            ));
        }

        let payload = OpenRequest {
            object_path: target_path.to_string(),
            durability_level,
        };
        let opened: OpenResponse = with_retry(&self.retry, "open session", || async {
            let request = Request::new(Method::Post, wire::uploads_path(account)).json(&payload)?;
            exchange(self.transport.as_ref(), request, Operation::Open, None)
                .await?
                .decode()
        })
        .await?;

        if opened.id.is_empty() || opened.parts_location.is_empty() {
            return Err(MpuError::InvalidResponse(
                "open response is missing id or parts location".to_string(),
            ));
        }

        info!(
            session_id = %opened.id,
            parts_location = %opened.parts_location,
            "opened multipart session for {}",
            target_path
        );
        Ok(Session::new(
            opened.id,
            target_path.to_string(),
            opened.parts_location,
            durability_level,
        ))
    }

    /// Query the server-side state of a session
    #[instrument(skip(self, session), fields(session_id = %session.id()))]
    pub async fn status(&self, session: &Session) -> MpuResult<RemoteStatus> {
        let status: StatusResponse = with_retry(&self.retry, "session status", || async {
            let request = Request::new(Method::Get, wire::state_path(session.parts_location()));
            exchange(self.transport.as_ref(), request, Operation::Status, Some(session))
                .await?
                .decode()
        })
        .await?;

        debug!(remote_state = ?status.state, local_state = %session.state(), "fetched session status");
        Ok(RemoteStatus {
            state: status.state.into(),
            object_reference: status.object_reference,
        })
    }
}
