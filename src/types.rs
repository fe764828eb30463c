//! Session, part and object types shared by every component

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Lifecycle state of a multipart upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    Committing,
    Committed,
    Aborting,
    Aborted,
    Failed,
}

impl SessionState {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Committed | SessionState::Aborted | SessionState::Failed
        )
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionState::Open => 0,
            SessionState::Committing => 1,
            SessionState::Committed => 2,
            SessionState::Aborting => 3,
            SessionState::Aborted => 4,
            SessionState::Failed => 5,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionState::Open,
            1 => SessionState::Committing,
            2 => SessionState::Committed,
            3 => SessionState::Aborting,
            4 => SessionState::Aborted,
            _ => SessionState::Failed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Open => "open",
            SessionState::Committing => "committing",
            SessionState::Committed => "committed",
            SessionState::Aborting => "aborting",
            SessionState::Aborted => "aborted",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Status of the most recent upload attempt for a part slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Failed,
}

/// One uploaded chunk belonging to a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    /// Caller-chosen slot number
    pub part_number: u32,

    /// Opaque token issued by the service; used in commit orderings
    pub server_identifier: String,

    /// Number of bytes stored
    pub size_bytes: u64,

    /// Hex-encoded SHA-256 of the part content
    pub content_checksum: String,

    /// Upload status
    pub upload_status: UploadStatus,
}

impl Part {
    /// Create a part record for a completed upload
    pub fn uploaded(
        part_number: u32,
        server_identifier: String,
        size_bytes: u64,
        content_checksum: String,
    ) -> Self {
        Self {
            part_number,
            server_identifier,
            size_bytes,
            content_checksum,
            upload_status: UploadStatus::Uploaded,
        }
    }
}

/// Reference to a durable object produced by a successful commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// Final object path
    pub path: String,

    /// Content digest, if the service reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Object size in bytes, if the service reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Default)]
struct Slot {
    current: Option<Part>,
    status: Option<UploadStatus>,
}

#[derive(Debug, Default)]
struct PartLedger {
    slots: BTreeMap<u32, Slot>,
}

struct SessionInner {
    id: String,
    target_path: String,
    parts_location: String,
    durability_level: u32,
    state: AtomicU8,
    ledger: Mutex<PartLedger>,
    terminal: Notify,
}

/// Handle to one in-progress multipart upload.
///
/// Cloning is cheap; all clones observe the same state. The `state` field is
/// the only value shared across concurrent part uploads and every transition
/// goes through a compare-and-set.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        target_path: String,
        parts_location: String,
        durability_level: u32,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                target_path,
                parts_location,
                durability_level,
                state: AtomicU8::new(SessionState::Open.as_u8()),
                ledger: Mutex::new(PartLedger::default()),
                terminal: Notify::new(),
            }),
        }
    }

    /// Server-issued session identifier
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Destination object path
    pub fn target_path(&self) -> &str {
        &self.inner.target_path
    }

    /// Server-issued handle under which parts are stored
    pub fn parts_location(&self) -> &str {
        &self.inner.parts_location
    }

    /// Number of replicas requested at creation
    pub fn durability_level(&self) -> u32 {
        self.inner.durability_level
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Compare-and-set `from -> to`. Returns the observed state on failure.
    pub(crate) fn transition(
        &self,
        from: SessionState,
        to: SessionState,
    ) -> Result<(), SessionState> {
        self.inner
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| self.notify_if_terminal(to))
            .map_err(SessionState::from_u8)
    }

    /// Compare-and-set from any of `allowed` into `to`.
    ///
    /// Returns the state that was replaced, or the observed state if it was
    /// not in `allowed`.
    pub(crate) fn transition_from_any(
        &self,
        allowed: &[SessionState],
        to: SessionState,
    ) -> Result<SessionState, SessionState> {
        let mut current = self.state();
        loop {
            if !allowed.contains(&current) {
                return Err(current);
            }
            match self.transition(current, to) {
                Ok(()) => return Ok(current),
                Err(observed) => current = observed,
            }
        }
    }

    fn notify_if_terminal(&self, state: SessionState) {
        if state.is_terminal() {
            self.inner.terminal.notify_waiters();
        }
    }

    /// Wait until the session reaches a terminal state
    pub async fn wait_terminal(&self) -> SessionState {
        loop {
            let notified = self.inner.terminal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.state();
            if state.is_terminal() {
                return state;
            }
            notified.await;
        }
    }

    fn ledger(&self) -> MutexGuard<'_, PartLedger> {
        self.inner
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn mark_pending(&self, part_number: u32) {
        self.ledger().slots.entry(part_number).or_default().status = Some(UploadStatus::Pending);
    }

    pub(crate) fn mark_failed(&self, part_number: u32) {
        self.ledger().slots.entry(part_number).or_default().status = Some(UploadStatus::Failed);
    }

    /// Record a completed upload, superseding any earlier part in the same slot.
    ///
    /// Fails with the observed state once the session has left `Open`.
    pub(crate) fn record_part(&self, part: Part) -> Result<Option<Part>, SessionState> {
        let mut ledger = self.ledger();
        let state = self.state();
        if state != SessionState::Open {
            return Err(state);
        }
        let slot = ledger.slots.entry(part.part_number).or_default();
        slot.status = Some(UploadStatus::Uploaded);
        Ok(slot.current.replace(part))
    }

    /// Currently uploaded parts, ordered by part number
    pub fn parts(&self) -> Vec<Part> {
        self.ledger()
            .slots
            .values()
            .filter_map(|slot| slot.current.clone())
            .collect()
    }

    /// Server identifier of the latest successful upload for a slot
    pub fn identifier_for(&self, part_number: u32) -> Option<String> {
        self.ledger()
            .slots
            .get(&part_number)
            .and_then(|slot| slot.current.as_ref())
            .map(|part| part.server_identifier.clone())
    }

    /// Status of the most recent upload attempt for a slot
    pub fn slot_status(&self, part_number: u32) -> Option<UploadStatus> {
        self.ledger()
            .slots
            .get(&part_number)
            .and_then(|slot| slot.status)
    }

    /// Resolve a commit ordering against the ledger.
    ///
    /// Returns the first identifier that is not a current uploaded part.
    pub(crate) fn resolve_ordering(&self, identifiers: &[String]) -> Result<Vec<Part>, String> {
        let ledger = self.ledger();
        let current: Vec<&Part> = ledger
            .slots
            .values()
            .filter_map(|slot| slot.current.as_ref())
            .collect();

        identifiers
            .iter()
            .map(|id| {
                current
                    .iter()
                    .find(|part| &part.server_identifier == id)
                    .map(|part| (*part).clone())
                    .ok_or_else(|| id.clone())
            })
            .collect()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("target_path", &self.inner.target_path)
            .field("parts_location", &self.inner.parts_location)
            .field("durability_level", &self.inner.durability_level)
            .field("state", &self.state())
            .finish()
    }
}

/// Find the first duplicate in a commit ordering
pub(crate) fn first_duplicate(identifiers: &[String]) -> Option<&str> {
    let mut seen = HashSet::with_capacity(identifiers.len());
    identifiers
        .iter()
        .find(|id| !seen.insert(id.as_str()))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "mpu-1".to_string(),
            "/acct/stor/obj".to_string(),
            "/acct/uploads/mpu-1".to_string(),
            2,
        )
    }

    fn part(number: u32, id: &str) -> Part {
        Part::uploaded(number, id.to_string(), 4, "c".to_string())
    }

    #[test]
    fn test_new_session_is_open() {
        let s = session();
        assert_eq!(s.state(), SessionState::Open);
        assert_eq!(s.durability_level(), 2);
        assert!(s.parts().is_empty());
    }

    #[test]
    fn test_transition_cas() {
        let s = session();
        assert!(s.transition(SessionState::Open, SessionState::Committing).is_ok());
        assert_eq!(
            s.transition(SessionState::Open, SessionState::Aborting),
            Err(SessionState::Committing)
        );
        assert_eq!(s.state(), SessionState::Committing);
    }

    #[test]
    fn test_transition_from_any() {
        let s = session();
        s.transition(SessionState::Open, SessionState::Committing).unwrap();
        let replaced = s
            .transition_from_any(
                &[SessionState::Open, SessionState::Committing],
                SessionState::Aborting,
            )
            .unwrap();
        assert_eq!(replaced, SessionState::Committing);
        assert_eq!(s.state(), SessionState::Aborting);
    }

    #[test]
    fn test_record_part_supersedes() {
        let s = session();
        assert_eq!(s.record_part(part(1, "a")).unwrap(), None);
        let old = s.record_part(part(1, "b")).unwrap();
        assert_eq!(old.map(|p| p.server_identifier), Some("a".to_string()));
        assert_eq!(s.identifier_for(1), Some("b".to_string()));
        assert_eq!(s.parts().len(), 1);
    }

    #[test]
    fn test_record_part_rejected_after_commit_starts() {
        let s = session();
        s.transition(SessionState::Open, SessionState::Committing).unwrap();
        assert_eq!(
            s.record_part(part(0, "a")),
            Err(SessionState::Committing)
        );
    }

    #[test]
    fn test_resolve_ordering() {
        let s = session();
        s.record_part(part(2, "x2")).unwrap();
        s.record_part(part(0, "x0")).unwrap();
        s.record_part(part(1, "x1")).unwrap();

        let ordered = s
            .resolve_ordering(&["x0".to_string(), "x1".to_string(), "x2".to_string()])
            .unwrap();
        let numbers: Vec<u32> = ordered.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);

        s.record_part(part(1, "x1-new")).unwrap();
        assert_eq!(
            s.resolve_ordering(&["x1".to_string()]),
            Err("x1".to_string())
        );
    }

    #[test]
    fn test_slot_status_tracks_latest_attempt() {
        let s = session();
        s.mark_pending(3);
        assert_eq!(s.slot_status(3), Some(UploadStatus::Pending));
        s.record_part(part(3, "p3")).unwrap();
        assert_eq!(s.slot_status(3), Some(UploadStatus::Uploaded));
        s.mark_failed(3);
        assert_eq!(s.slot_status(3), Some(UploadStatus::Failed));
        // A failed re-upload keeps the previous content
        assert_eq!(s.identifier_for(3), Some("p3".to_string()));
    }

    #[test]
    fn test_first_duplicate() {
        let ids = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(first_duplicate(&ids), Some("a"));
        assert_eq!(first_duplicate(&ids[..2]), None);
    }

    #[tokio::test]
    async fn test_wait_terminal() {
        let s = session();
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.wait_terminal().await })
        };
        tokio::task::yield_now().await;
        s.transition(SessionState::Open, SessionState::Aborting).unwrap();
        s.transition(SessionState::Aborting, SessionState::Aborted).unwrap();
        assert_eq!(waiter.await.unwrap(), SessionState::Aborted);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Committing.to_string(), "committing");
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Aborting.is_terminal());
    }
}
