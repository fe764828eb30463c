//! Wire payloads, routes and service error mapping
//!
//! Routes follow the object store's multipart layout:
//!
//! | Operation | Request |
//! |---|---|
//! | open   | `POST /{account}/uploads` |
//! | upload | `PUT {partsLocation}/{partNumber}` |
//! | commit | `POST {partsLocation}/commit` |
//! | abort  | `POST {partsLocation}/abort` |
//! | status | `GET {partsLocation}/state` |

use super::Response;
use crate::error::{MpuError, MpuResult};
use crate::types::{ObjectReference, SessionState};
use serde::{Deserialize, Serialize};

/// Body of an open request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRequest {
    pub object_path: String,
    pub durability_level: u32,
}

/// Body of an open response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenResponse {
    pub id: String,
    #[serde(alias = "partsDirectory")]
    pub parts_location: String,
}

/// Body of an upload-part response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPartResponse {
    #[serde(alias = "part")]
    pub server_identifier: String,
    #[serde(alias = "size")]
    pub size_bytes: u64,
    pub checksum: String,
}

/// Body of a commit request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub parts_location: String,
    #[serde(alias = "parts")]
    pub ordered_identifiers: Vec<String>,
}

/// Body of a commit response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResponse {
    pub object_reference: ObjectReference,
}

/// Body of an abort request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub parts_location: String,
}

/// Server-side view of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteState {
    Open,
    Committed,
    Aborted,
}

impl From<RemoteState> for SessionState {
    fn from(state: RemoteState) -> Self {
        match state {
            RemoteState::Open => SessionState::Open,
            RemoteState::Committed => SessionState::Committed,
            RemoteState::Aborted => SessionState::Aborted,
        }
    }
}

/// Body of a status response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub state: RemoteState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_reference: Option<ObjectReference>,
}

/// Error body returned by the service on non-2xx responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceError {
    pub code: String,
    pub message: String,
    /// Session state at the time of the failure, for state conflicts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RemoteState>,
}

impl ServiceError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            state: None,
        }
    }

    pub fn with_state(mut self, state: RemoteState) -> Self {
        self.state = Some(state);
        self
    }
}

/// Service error codes understood by the client
pub mod codes {
    pub const INVALID_PATH: &str = "InvalidPath";
    pub const INVALID_ARGUMENT: &str = "InvalidArgument";
    pub const INVALID_DURABILITY: &str = "InvalidDurabilityLevel";
    pub const AUTHORIZATION_REQUIRED: &str = "AuthorizationRequired";
    pub const INVALID_CREDENTIALS: &str = "InvalidCredentials";
    pub const NO_SUCH_UPLOAD: &str = "NoSuchUpload";
    pub const INVALID_PART: &str = "InvalidPart";
    pub const INVALID_UPLOAD_STATE: &str = "InvalidUploadState";
    pub const ALREADY_COMMITTED: &str = "AlreadyCommitted";
    pub const CHECKSUM_MISMATCH: &str = "ChecksumMismatch";
    pub const QUOTA_EXCEEDED: &str = "QuotaExceeded";
    pub const SERVICE_UNAVAILABLE: &str = "ServiceUnavailable";
    pub const RESOURCE_NOT_FOUND: &str = "ResourceNotFound";
}

/// Which operation a failed response belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Open,
    UploadPart(u32),
    Commit,
    Abort,
    Status,
}

/// Validate a logical object path such as `/account/stor/dir/object`
pub fn validate_object_path(path: &str) -> MpuResult<()> {
    if path.is_empty() {
        return Err(MpuError::InvalidPath("path is empty".to_string()));
    }
    if !path.starts_with('/') {
        return Err(MpuError::InvalidPath(format!("{} is not absolute", path)));
    }
    if path.ends_with('/') {
        return Err(MpuError::InvalidPath(format!(
            "{} names a directory, not an object",
            path
        )));
    }

    let segments: Vec<&str> = path[1..].split('/').collect();
    if segments.len() < 2 {
        return Err(MpuError::InvalidPath(format!(
            "{} must include an account and an object name",
            path
        )));
    }
    if let Some(bad) = segments
        .iter()
        .find(|s| s.is_empty() || **s == "." || **s == ".." || s.contains('\0'))
    {
        return Err(MpuError::InvalidPath(format!(
            "{} contains invalid segment {:?}",
            path, bad
        )));
    }
    Ok(())
}

/// Account that owns an object path (its first segment)
pub fn account_of(path: &str) -> MpuResult<&str> {
    validate_object_path(path)?;
    path[1..]
        .split('/')
        .next()
        .ok_or_else(|| MpuError::InvalidPath(path.to_string()))
}

pub fn uploads_path(account: &str) -> String {
    format!("/{}/uploads", account)
}

pub fn part_path(parts_location: &str, part_number: u32) -> String {
    format!("{}/{}", parts_location, part_number)
}

pub fn commit_path(parts_location: &str) -> String {
    format!("{}/commit", parts_location)
}

pub fn abort_path(parts_location: &str) -> String {
    format!("{}/abort", parts_location)
}

pub fn state_path(parts_location: &str) -> String {
    format!("{}/state", parts_location)
}

/// Map a non-2xx response onto the client error taxonomy.
///
/// `session_id` and `local_state` fill in state-conflict errors when the
/// service does not report the session state itself.
pub fn classify_failure(
    response: &Response,
    operation: Operation,
    session_id: &str,
    local_state: SessionState,
) -> MpuError {
    let body: ServiceError = serde_json::from_slice(&response.body).unwrap_or_else(|_| {
        ServiceError::new(
            "",
            String::from_utf8_lossy(&response.body).trim().to_string(),
        )
    });
    let observed = body.state.map(SessionState::from).unwrap_or(local_state);
    let detail = if body.code.is_empty() {
        format!("HTTP {}: {}", response.status, body.message)
    } else {
        format!("{} ({}): {}", response.status, body.code, body.message)
    };

    let state_conflict = |state: SessionState| match operation {
        Operation::UploadPart(_) => MpuError::SessionClosed {
            session_id: session_id.to_string(),
            state,
        },
        _ if state == SessionState::Committed && operation == Operation::Abort => {
            MpuError::AlreadyCommitted {
                session_id: session_id.to_string(),
            }
        }
        _ => MpuError::SessionNotOpen {
            session_id: session_id.to_string(),
            state,
        },
    };

    match (response.status, body.code.as_str()) {
        (_, codes::INVALID_PATH) => MpuError::InvalidPath(detail),
        (_, codes::INVALID_DURABILITY) => MpuError::PolicyRejected(detail),
        (_, codes::QUOTA_EXCEEDED) | (413, _) | (507, _) => MpuError::QuotaExceeded(detail),
        (_, codes::CHECKSUM_MISMATCH) | (412, _) => MpuError::ChecksumMismatch {
            part_number: match operation {
                Operation::UploadPart(n) => n,
                _ => 0,
            },
            expected: "client digest".to_string(),
            actual: detail,
        },
        (_, codes::ALREADY_COMMITTED) => state_conflict(SessionState::Committed),
        (_, codes::INVALID_PART) => MpuError::MissingPart {
            session_id: session_id.to_string(),
            identifier: body.message,
        },
        (_, codes::NO_SUCH_UPLOAD) => state_conflict(body.state.map_or(SessionState::Aborted, SessionState::from)),
        (_, codes::INVALID_UPLOAD_STATE) | (409, _) => state_conflict(observed),
        (401, _) | (403, _) => MpuError::Authentication(detail),
        (408, _) | (429, _) | (500..=599, _) => MpuError::ServiceUnavailable(detail),
        (400, _) => MpuError::Validation(detail),
        _ => MpuError::InvalidResponse(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(status: u16, error: &ServiceError) -> Response {
        Response::json(status, error)
    }

    #[test]
    fn test_validate_object_path() {
        assert!(validate_object_path("/acct/stor/foo.txt").is_ok());
        assert!(validate_object_path("/acct/stor/dir/nested/obj").is_ok());

        for bad in ["", "acct/stor/x", "/acct", "/acct/stor/", "/acct//x", "/acct/../x"] {
            assert!(
                matches!(validate_object_path(bad), Err(MpuError::InvalidPath(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_account_and_routes() {
        assert_eq!(account_of("/joyent/stor/x").unwrap(), "joyent");
        assert_eq!(uploads_path("joyent"), "/joyent/uploads");
        assert_eq!(part_path("/j/uploads/abc", 3), "/j/uploads/abc/3");
        assert_eq!(commit_path("/j/uploads/abc"), "/j/uploads/abc/commit");
        assert_eq!(abort_path("/j/uploads/abc"), "/j/uploads/abc/abort");
        assert_eq!(state_path("/j/uploads/abc"), "/j/uploads/abc/state");
    }

    #[test]
    fn test_open_response_accepts_legacy_field() {
        let legacy: OpenResponse =
            serde_json::from_str(r#"{"id":"u1","partsDirectory":"/a/uploads/u1"}"#).unwrap();
        let current: OpenResponse =
            serde_json::from_str(r#"{"id":"u1","partsLocation":"/a/uploads/u1"}"#).unwrap();
        assert_eq!(legacy, current);
    }

    #[test]
    fn test_commit_request_shape() {
        let request = CommitRequest {
            parts_location: "/a/uploads/u1".to_string(),
            ordered_identifiers: vec!["p0".to_string(), "p1".to_string()],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["partsLocation"], "/a/uploads/u1");
        assert_eq!(json["orderedIdentifiers"][1], "p1");
    }

    #[test]
    fn test_classify_auth_and_capacity() {
        let err = classify_failure(
            &failure(401, &ServiceError::new(codes::INVALID_CREDENTIALS, "bad key")),
            Operation::Open,
            "",
            SessionState::Open,
        );
        assert!(matches!(err, MpuError::Authentication(_)));

        let err = classify_failure(
            &failure(400, &ServiceError::new(codes::INVALID_DURABILITY, "9")),
            Operation::Open,
            "",
            SessionState::Open,
        );
        assert!(matches!(err, MpuError::PolicyRejected(_)));

        let err = classify_failure(
            &failure(507, &ServiceError::new(codes::QUOTA_EXCEEDED, "full")),
            Operation::UploadPart(1),
            "s",
            SessionState::Open,
        );
        assert!(matches!(err, MpuError::QuotaExceeded(_)));
    }

    #[test]
    fn test_classify_state_conflicts() {
        let conflict = ServiceError::new(codes::INVALID_UPLOAD_STATE, "not open")
            .with_state(RemoteState::Committed);

        let err = classify_failure(
            &failure(409, &conflict),
            Operation::UploadPart(2),
            "s1",
            SessionState::Open,
        );
        assert!(matches!(
            err,
            MpuError::SessionClosed { state: SessionState::Committed, .. }
        ));

        let err = classify_failure(&failure(409, &conflict), Operation::Abort, "s1", SessionState::Aborting);
        assert!(matches!(err, MpuError::AlreadyCommitted { .. }));

        let err = classify_failure(
            &failure(404, &ServiceError::new(codes::NO_SUCH_UPLOAD, "gone")),
            Operation::Commit,
            "s1",
            SessionState::Committing,
        );
        assert!(matches!(
            err,
            MpuError::SessionNotOpen { state: SessionState::Aborted, .. }
        ));
    }

    #[test]
    fn test_classify_transient_and_unknown() {
        let err = classify_failure(
            &Response::new(503, "busy"),
            Operation::Commit,
            "s",
            SessionState::Committing,
        );
        assert!(matches!(err, MpuError::ServiceUnavailable(_)));
        assert!(err.is_retryable());

        let err = classify_failure(&Response::new(418, ""), Operation::Status, "s", SessionState::Open);
        assert!(matches!(err, MpuError::InvalidResponse(_)));
    }
}
