//! Multipart upload client
//!
//! Wires the session manager, part uploader, commit coordinator and abort
//! handler over one shared transport, and runs whole-object uploads with
//! abort-on-failure and abort-on-cancel.

use crate::abort::AbortHandler;
use crate::commit::CommitCoordinator;
use crate::config::MpuConfig;
use crate::error::{ErrorClass, MpuError, MpuResult};
use crate::session::{RemoteStatus, SessionManager};
use crate::source::{split_file, PartSpec};
use crate::transport::Transport;
use crate::types::{ObjectReference, Part, Session, SessionState};
use crate::upload::PartUploader;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

struct ClientInner {
    config: MpuConfig,
    sessions: Arc<SessionManager>,
    uploader: PartUploader,
    committer: CommitCoordinator,
    aborter: AbortHandler,
}

/// Client for multipart uploads. Cloning shares the concurrency ceiling.
#[derive(Clone)]
pub struct MpuClient {
    inner: Arc<ClientInner>,
}

impl MpuClient {
    /// Create a client over `transport`. The configuration is validated.
    pub fn new(transport: Arc<dyn Transport>, config: MpuConfig) -> MpuResult<Self> {
        config.validate()?;
        let retry = config.retry.to_policy();

        let sessions = Arc::new(SessionManager::new(transport.clone(), retry.clone()));
        let uploader = PartUploader::new(
            transport.clone(),
            retry.clone(),
            config.max_in_flight,
            config.part_timeout(),
            config.policy.clone(),
        );
        let committer = CommitCoordinator::new(
            transport.clone(),
            sessions.clone(),
            retry.clone(),
            config.policy.clone(),
        );
        let aborter = AbortHandler::new(transport, retry);

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                sessions,
                uploader,
                committer,
                aborter,
            }),
        })
    }

    /// Create a client with the default configuration
    pub fn with_defaults(transport: Arc<dyn Transport>) -> MpuResult<Self> {
        Self::new(transport, MpuConfig::default())
    }

    pub fn config(&self) -> &MpuConfig {
        &self.inner.config
    }

    /// Open a session for `target_path`
    pub async fn open_session(&self, target_path: &str, durability_level: u32) -> MpuResult<Session> {
        self.inner
            .sessions
            .open_session(target_path, durability_level)
            .await
    }

    /// Upload one part into an open session
    pub async fn upload_part(&self, session: &Session, spec: &PartSpec) -> MpuResult<Part> {
        self.inner.uploader.upload_part(session, spec).await
    }

    /// Upload several parts concurrently; see [`PartUploader::upload_parts`]
    pub async fn upload_parts(
        &self,
        session: &Session,
        specs: &[PartSpec],
        cancel: &CancellationToken,
    ) -> MpuResult<Vec<Part>> {
        self.inner.uploader.upload_parts(session, specs, cancel).await
    }

    /// Commit the listed server identifiers, in order, as the final object
    pub async fn commit(
        &self,
        session: &Session,
        ordered_identifiers: &[String],
    ) -> MpuResult<ObjectReference> {
        self.inner.committer.commit(session, ordered_identifiers).await
    }

    /// Discard a session and its parts
    pub async fn abort(&self, session: &Session) -> MpuResult<()> {
        self.inner.aborter.abort(session).await
    }

    /// Server-side state of a session
    pub async fn status(&self, session: &Session) -> MpuResult<RemoteStatus> {
        self.inner.sessions.status(session).await
    }

    /// Wait until the session is committed, aborted or failed
    pub async fn wait_terminal(&self, session: &Session) -> SessionState {
        session.wait_terminal().await
    }

    /// Upload a whole object: open, upload every part, commit in ascending
    /// part-number order.
    ///
    /// On cancellation the session is always aborted. On any other failure it
    /// is aborted when `abort_on_failure` is set. The original error is
    /// returned either way.
    #[instrument(skip(self, parts, cancel), fields(parts = parts.len()))]
    pub async fn upload_object(
        &self,
        target_path: &str,
        durability_level: Option<u32>,
        parts: Vec<PartSpec>,
        cancel: &CancellationToken,
    ) -> MpuResult<ObjectReference> {
        if parts.is_empty() {
            return Err(MpuError::Validation(
                "an object needs at least one part".to_string(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(MpuError::Cancelled(format!(
                "upload of {} cancelled before start",
                target_path
            )));
        }

        let durability = durability_level.unwrap_or(self.inner.config.default_durability);
        let session = self.open_session(target_path, durability).await?;

        match self.drive(&session, &parts, cancel).await {
            Ok(reference) => Ok(reference),
            Err(e) => {
                self.clean_up(&session, &e).await;
                Err(e)
            }
        }
    }

    /// Split a local file into `part_size` chunks and upload it as one object
    pub async fn upload_file(
        &self,
        local_path: &Path,
        target_path: &str,
        durability_level: Option<u32>,
        part_size: u64,
        cancel: &CancellationToken,
    ) -> MpuResult<ObjectReference> {
        let parts = split_file(local_path, part_size).await?;
        info!(
            parts = parts.len(),
            "uploading {} to {}",
            local_path.display(),
            target_path
        );
        self.upload_object(target_path, durability_level, parts, cancel)
            .await
    }

    async fn drive(
        &self,
        session: &Session,
        parts: &[PartSpec],
        cancel: &CancellationToken,
    ) -> MpuResult<ObjectReference> {
        let uploaded = self.upload_parts(session, parts, cancel).await?;
        if cancel.is_cancelled() {
            return Err(MpuError::Cancelled(format!(
                "session {} cancelled before commit",
                session.id()
            )));
        }

        let ordering: Vec<String> = uploaded
            .into_iter()
            .map(|part| part.server_identifier)
            .collect();
        self.commit(session, &ordering).await
    }

    async fn clean_up(&self, session: &Session, cause: &MpuError) {
        let cancelled = cause.class() == ErrorClass::Cancelled;
        if !cancelled && !self.inner.config.abort_on_failure {
            warn!(
                session_id = %session.id(),
                "leaving session {} after failure: {}",
                session.state(),
                cause
            );
            return;
        }
        if session.state().is_terminal() {
            return;
        }

        info!(session_id = %session.id(), "aborting session after failure: {}", cause);
        if let Err(abort_error) = self.abort(session).await {
            warn!(
                session_id = %session.id(),
                "abort after failure did not complete: {}",
                abort_error
            );
        }
    }
}

impl std::fmt::Debug for MpuClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpuClient")
            .field("max_in_flight", &self.inner.uploader.max_in_flight())
            .field("config", &self.inner.config)
            .finish()
    }
}
