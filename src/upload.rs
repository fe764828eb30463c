//! Part uploader
//!
//! Transfers part bodies into an open session. A semaphore caps the number of
//! transfers in flight across every caller sharing the uploader; permits are
//! held only while a request is on the wire, never during retry backoff.

use crate::config::PartPolicy;
use crate::error::{ErrorClass, MpuError, MpuResult};
use crate::retry::{RetryBudget, RetryPolicy};
use crate::source::PartSpec;
use crate::transport::wire::{self, Operation, UploadPartResponse};
use crate::transport::{exchange, BodyStream, Method, Request, Transport};
use crate::types::{Part, Session, SessionState};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use pin_project::pin_project;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Running SHA-256 and byte count of a streamed body
#[derive(Default)]
struct BodyDigest {
    hasher: Sha256,
    bytes: u64,
}

/// Stream adapter that hashes and counts every chunk it yields
#[pin_project]
struct DigestStream {
    #[pin]
    inner: BodyStream,
    digest: Arc<Mutex<BodyDigest>>,
}

impl DigestStream {
    fn new(inner: BodyStream) -> (Self, Arc<Mutex<BodyDigest>>) {
        let digest = Arc::new(Mutex::new(BodyDigest::default()));
        let stream = Self {
            inner,
            digest: digest.clone(),
        };
        (stream, digest)
    }
}

impl Stream for DigestStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = futures::ready!(this.inner.poll_next(cx));
        if let Some(Ok(chunk)) = &item {
            let mut digest = this.digest.lock().unwrap_or_else(PoisonError::into_inner);
            digest.hasher.update(chunk);
            digest.bytes += chunk.len() as u64;
        }
        Poll::Ready(item)
    }
}

/// Hex checksum and length of everything the stream yielded
fn finish(digest: &Mutex<BodyDigest>) -> (String, u64) {
    let digest = digest.lock().unwrap_or_else(PoisonError::into_inner);
    (hex::encode(digest.hasher.clone().finalize()), digest.bytes)
}

/// Uploads parts with bounded concurrency, retry and integrity checks
pub struct PartUploader {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    part_timeout: Option<Duration>,
    policy: PartPolicy,
}

impl PartUploader {
    pub fn new(
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        max_in_flight: usize,
        part_timeout: Option<Duration>,
        policy: PartPolicy,
    ) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            transport,
            retry,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            part_timeout,
            policy,
        }
    }

    /// Concurrency ceiling
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Upload one part, retrying transient and integrity failures.
    ///
    /// A successful upload supersedes any earlier part with the same number.
    pub async fn upload_part(&self, session: &Session, spec: &PartSpec) -> MpuResult<Part> {
        self.upload_part_until(session, spec, &CancellationToken::new())
            .await
    }

    /// Upload a batch of parts concurrently, up to the concurrency ceiling.
    ///
    /// The first failure or a cancellation stops new uploads from starting;
    /// transfers already on the wire run to completion. Returns the uploaded
    /// parts sorted by part number.
    #[instrument(skip_all, fields(session_id = %session.id(), parts = specs.len()))]
    pub async fn upload_parts(
        &self,
        session: &Session,
        specs: &[PartSpec],
        cancel: &CancellationToken,
    ) -> MpuResult<Vec<Part>> {
        let mut seen = HashSet::with_capacity(specs.len());
        if let Some(dup) = specs.iter().find(|s| !seen.insert(s.part_number)) {
            return Err(MpuError::Validation(format!(
                "part number {} listed more than once",
                dup.part_number
            )));
        }

        let stop = cancel.child_token();
        let mut outcomes = futures::stream::iter(specs)
            .map(|spec| {
                let stop = &stop;
                async move {
                    let outcome = self.upload_part_until(session, spec, stop).await;
                    if outcome.is_err() {
                        stop.cancel();
                    }
                    outcome
                }
            })
            .buffer_unordered(self.max_in_flight);

        let mut parts = Vec::with_capacity(specs.len());
        let mut first_error = None;
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Ok(part) => parts.push(part),
                Err(e) if e.class() == ErrorClass::Cancelled => {}
                Err(e) => {
                    if first_error.is_none() {
                        warn!("stopping batch after failure: {}", e);
                        first_error = Some(e);
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            info!(uploaded = parts.len(), "part batch cancelled");
            return Err(MpuError::Cancelled(format!(
                "upload of session {} cancelled after {} of {} parts",
                session.id(),
                parts.len(),
                specs.len()
            )));
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn upload_part_until(
        &self,
        session: &Session,
        spec: &PartSpec,
        cancel: &CancellationToken,
    ) -> MpuResult<Part> {
        let number = spec.part_number;
        let context = format!("part {} of session {}", number, session.id());

        self.policy
            .check_part_number(number)
            .map_err(|e| e.context(context.clone()))?;
        if let Some(size) = spec.expected_size {
            self.policy
                .check_part_size(number, size)
                .map_err(|e| e.context(context.clone()))?;
        }
        ensure_open(session).map_err(|e| e.context(context.clone()))?;

        session.mark_pending(number);
        let result = self.retry_upload(session, spec, cancel).await;
        match result {
            Ok(part) => match session.record_part(part.clone()) {
                Ok(superseded) => {
                    if let Some(old) = superseded {
                        debug!(part_number = number, old = %old.server_identifier, "superseded earlier upload");
                    }
                    Ok(part)
                }
                Err(state) => Err(MpuError::SessionClosed {
                    session_id: session.id().to_string(),
                    state,
                }
                .context(context)),
            },
            Err(e) => {
                session.mark_failed(number);
                Err(e.context(context))
            }
        }
    }

    async fn retry_upload(
        &self,
        session: &Session,
        spec: &PartSpec,
        cancel: &CancellationToken,
    ) -> MpuResult<Part> {
        let mut budget = RetryBudget::new(&self.retry, format!("upload part {}", spec.part_number));

        loop {
            if cancel.is_cancelled() {
                return Err(MpuError::Cancelled(format!(
                    "part {} not started",
                    spec.part_number
                )));
            }
            ensure_open(session)?;

            match self.attempt(session, spec, cancel).await {
                Ok(part) => return Ok(part),
                Err(e) if e.class() == ErrorClass::Cancelled => return Err(e),
                Err(e) => {
                    let delay = budget.on_failure(e)?;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(MpuError::Cancelled(format!(
                                "retry of part {} cancelled",
                                spec.part_number
                            )));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One transfer attempt, holding a concurrency permit throughout
    async fn attempt(
        &self,
        session: &Session,
        spec: &PartSpec,
        cancel: &CancellationToken,
    ) -> MpuResult<Part> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(MpuError::Cancelled(format!(
                    "part {} cancelled while waiting for a slot",
                    spec.part_number
                )));
            }
            permit = self.permits.acquire() => permit
                .map_err(|_| MpuError::Cancelled("uploader shut down".to_string()))?,
        };

        match self.part_timeout {
            Some(limit) => tokio::time::timeout(limit, self.transfer(session, spec))
                .await
                .map_err(|_| {
                    MpuError::Transport(format!(
                        "part {} timed out after {:?}",
                        spec.part_number, limit
                    ))
                })?,
            None => self.transfer(session, spec).await,
        }
    }

    async fn transfer(&self, session: &Session, spec: &PartSpec) -> MpuResult<Part> {
        let number = spec.part_number;
        debug!(part_number = number, expected_size = ?spec.expected_size, "uploading part");

        let (body, digest) = DigestStream::new(spec.source.open().await?);
        let request = Request::new(Method::Put, wire::part_path(session.parts_location(), number))
            .stream(Box::pin(body), spec.expected_size);
        let reply: UploadPartResponse = exchange(
            self.transport.as_ref(),
            request,
            Operation::UploadPart(number),
            Some(session),
        )
        .await?
        .decode()?;

        let (checksum, sent) = finish(&digest);
        if let Some(expected) = spec.expected_size {
            if sent != expected {
                return Err(MpuError::SizeMismatch {
                    part_number: number,
                    expected,
                    actual: sent,
                });
            }
        }
        if reply.size_bytes != sent {
            return Err(MpuError::SizeMismatch {
                part_number: number,
                expected: sent,
                actual: reply.size_bytes,
            });
        }
        if !reply.checksum.eq_ignore_ascii_case(&checksum) {
            return Err(MpuError::ChecksumMismatch {
                part_number: number,
                expected: checksum,
                actual: reply.checksum,
            });
        }
        self.policy.check_part_size(number, sent)?;

        debug!(part_number = number, size = sent, id = %reply.server_identifier, "part uploaded");
        Ok(Part::uploaded(number, reply.server_identifier, sent, checksum))
    }
}

fn ensure_open(session: &Session) -> MpuResult<()> {
    match session.state() {
        SessionState::Open => Ok(()),
        state => Err(MpuError::SessionClosed {
            session_id: session.id().to_string(),
            state,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionManager;
    use crate::source::FileSegment;
    use crate::transport::memory::{Fault, MemoryStore, Route};
    use crate::types::UploadStatus;

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    async fn setup(store: MemoryStore, max_in_flight: usize) -> (Arc<MemoryStore>, PartUploader, Session) {
        let store = Arc::new(store);
        let session = SessionManager::new(store.clone(), quick_retry(1))
            .open_session("/acct/stor/obj", 2)
            .await
            .unwrap();
        let uploader = PartUploader::new(
            store.clone(),
            quick_retry(3),
            max_in_flight,
            None,
            PartPolicy::default(),
        );
        (store, uploader, session)
    }

    #[tokio::test]
    async fn test_upload_part_records_ledger() {
        let (_, uploader, session) = setup(MemoryStore::new(), 4).await;

        let part = uploader
            .upload_part(&session, &PartSpec::from_bytes(0, "hello"))
            .await
            .unwrap();
        assert_eq!(part.size_bytes, 5);
        assert_eq!(part.upload_status, UploadStatus::Uploaded);
        assert_eq!(
            part.content_checksum,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(session.identifier_for(0), Some(part.server_identifier));
    }

    #[tokio::test]
    async fn test_checksum_corruption_is_retried() {
        let (store, uploader, session) = setup(MemoryStore::new(), 4).await;
        store.inject(Route::UploadPart, Fault::CorruptChecksum, 1);

        let part = uploader
            .upload_part(&session, &PartSpec::from_bytes(3, "abc"))
            .await
            .unwrap();
        assert_eq!(session.identifier_for(3), Some(part.server_identifier));
        assert_eq!(store.part_count(session.parts_location()), 1);
    }

    #[tokio::test]
    async fn test_size_mismatch_detected() {
        let (_, uploader, session) = setup(MemoryStore::new(), 4).await;
        let spec = PartSpec::from_bytes(0, "abc").with_expected_size(Some(10));

        let err = uploader.upload_part(&session, &spec).await.unwrap_err();
        match err.root_cause() {
            MpuError::ExhaustedRetries { last, .. } => {
                assert!(matches!(**last, MpuError::SizeMismatch { expected: 10, actual: 3, .. }))
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(session.slot_status(0), Some(UploadStatus::Failed));
    }

    #[tokio::test]
    async fn test_unreadable_source_is_not_retried() {
        let (store, uploader, session) = setup(MemoryStore::new(), 4).await;
        let source = Arc::new(FileSegment::new("/nonexistent/orbit-mpu/part.bin", 0, 16));

        let err = uploader
            .upload_part(&session, &PartSpec::new(0, source))
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), MpuError::Io(_)));
        assert_eq!(session.slot_status(0), Some(UploadStatus::Failed));
        // Only the open request reached the service
        assert_eq!(store.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_backs_off_between_attempts() {
        let (store, _, session) = setup(MemoryStore::new(), 4).await;
        let uploader = PartUploader::new(
            store.clone(),
            RetryPolicy::default(),
            4,
            None,
            PartPolicy::default(),
        );
        store.inject(Route::UploadPart, Fault::Disconnect, 2);

        let started = tokio::time::Instant::now();
        uploader
            .upload_part(&session, &PartSpec::from_bytes(0, "late"))
            .await
            .unwrap();
        // 200ms then 400ms of backoff, plus jitter
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(600), "waited {:?}", waited);
        assert!(waited < Duration::from_secs(2), "waited {:?}", waited);
    }

    #[tokio::test]
    async fn test_upload_rejected_once_committing() {
        let (store, uploader, session) = setup(MemoryStore::new(), 4).await;
        session
            .transition(SessionState::Open, SessionState::Committing)
            .unwrap();

        let err = uploader
            .upload_part(&session, &PartSpec::from_bytes(0, "x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            MpuError::SessionClosed { state: SessionState::Committing, .. }
        ));
        assert_eq!(store.part_count(session.parts_location()), 0);
    }

    #[tokio::test]
    async fn test_policy_rejects_oversized_part() {
        let store = Arc::new(MemoryStore::new());
        let session = SessionManager::new(store.clone(), quick_retry(1))
            .open_session("/acct/stor/obj", 2)
            .await
            .unwrap();
        let uploader = PartUploader::new(
            store.clone(),
            quick_retry(3),
            2,
            None,
            PartPolicy {
                max_part_size: Some(4),
                ..Default::default()
            },
        );

        let err = uploader
            .upload_part(&session, &PartSpec::from_bytes(0, "too large"))
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), MpuError::Validation(_)));
        assert_eq!(store.request_count(), 1);
    }

    #[tokio::test]
    async fn test_batch_respects_ceiling() {
        let (store, uploader, session) =
            setup(MemoryStore::new().with_upload_latency(Duration::from_millis(20)), 2).await;
        let specs: Vec<PartSpec> = (0..6).map(|n| PartSpec::from_bytes(n, vec![n as u8; 8])).collect();

        let parts = uploader
            .upload_parts(&session, &specs, &CancellationToken::new())
            .await
            .unwrap();
        let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(store.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_batch_rejects_duplicate_numbers() {
        let (_, uploader, session) = setup(MemoryStore::new(), 2).await;
        let specs = vec![PartSpec::from_bytes(1, "a"), PartSpec::from_bytes(1, "b")];
        let err = uploader
            .upload_parts(&session, &specs, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MpuError::Validation(_)));
    }

    #[tokio::test]
    async fn test_batch_stops_after_fatal_error() {
        let (store, uploader, session) = setup(MemoryStore::new().with_quota(10), 1).await;
        let specs: Vec<PartSpec> = (0..4).map(|n| PartSpec::from_bytes(n, vec![0u8; 8])).collect();

        let err = uploader
            .upload_parts(&session, &specs, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), MpuError::QuotaExceeded(_)));
        // Part 0 fits, part 1 hits the quota, parts 2 and 3 never start
        assert_eq!(store.part_count(session.parts_location()), 1);
    }

    #[tokio::test]
    async fn test_cancelled_batch_starts_nothing() {
        let (store, uploader, session) = setup(MemoryStore::new(), 2).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let specs = vec![PartSpec::from_bytes(0, "a")];
        let err = uploader.upload_parts(&session, &specs, &cancel).await.unwrap_err();
        assert!(matches!(err, MpuError::Cancelled(_)));
        assert_eq!(store.part_count(session.parts_location()), 0);
    }
}
