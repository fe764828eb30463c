//! In-memory multipart object store
//!
//! Implements the service side of the wire contract in [`super::wire`] so the
//! engine can be exercised without a network. Supports fault injection per
//! route, upload latency and in-flight accounting for concurrency tests.

use super::wire::{
    self, codes, AbortRequest, CommitRequest, CommitResponse, OpenRequest, OpenResponse,
    RemoteState, ServiceError, StatusResponse, UploadPartResponse,
};
use super::{Body, Method, Request, Response, Transport, TransportError};
use crate::types::ObjectReference;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Highest durability level the store accepts
pub const MAX_DURABILITY: u32 = 6;

/// Request routes understood by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Open,
    UploadPart,
    Commit,
    Abort,
    Status,
}

/// Injected failure behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Drop the connection without processing the request
    Disconnect,
    /// Answer 503 without processing the request
    Unavailable,
    /// Store the part but report a wrong checksum
    CorruptChecksum,
    /// Process the request, then drop the connection before answering
    ApplyThenDisconnect,
}

#[derive(Debug)]
struct StoredPart {
    identifier: String,
    data: Bytes,
}

#[derive(Debug)]
struct RemoteSession {
    object_path: String,
    state: RemoteState,
    parts: BTreeMap<u32, StoredPart>,
    object: Option<ObjectReference>,
}

#[derive(Debug, Default)]
struct StoreState {
    next_id: u64,
    sessions: HashMap<String, RemoteSession>,
    objects: HashMap<String, Bytes>,
    faults: Vec<(Route, Fault, u32)>,
}

impl StoreState {
    fn take_fault(&mut self, route: Route) -> Option<Fault> {
        let index = self
            .faults
            .iter()
            .position(|(r, _, remaining)| *r == route && *remaining > 0)?;
        let entry = &mut self.faults[index];
        entry.2 -= 1;
        let fault = entry.1;
        if entry.2 == 0 {
            self.faults.remove(index);
        }
        Some(fault)
    }

    fn stored_bytes(&self) -> u64 {
        let parts: u64 = self
            .sessions
            .values()
            .flat_map(|s| s.parts.values())
            .map(|p| p.data.len() as u64)
            .sum();
        let objects: u64 = self.objects.values().map(|o| o.len() as u64).sum();
        parts + objects
    }
}

/// Decrements the in-flight counter on drop
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory object store speaking the multipart wire protocol
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    required_token: Option<String>,
    upload_latency: Duration,
    quota_bytes: Option<u64>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    requests: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `authorization: Bearer <token>` on every request
    pub fn with_required_token(mut self, token: impl Into<String>) -> Self {
        self.required_token = Some(token.into());
        self
    }

    /// Delay every part upload by `latency`
    pub fn with_upload_latency(mut self, latency: Duration) -> Self {
        self.upload_latency = latency;
        self
    }

    /// Reject writes once stored parts and objects exceed `bytes`
    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    /// Apply `fault` to the next `times` requests on `route`
    pub fn inject(&self, route: Route, fault: Fault, times: u32) {
        if times > 0 {
            self.lock().faults.push((route, fault, times));
        }
    }

    /// Content of a committed object
    pub fn object(&self, path: &str) -> Option<Bytes> {
        self.lock().objects.get(path).cloned()
    }

    /// Server-side state of a session, by parts location
    pub fn remote_state(&self, parts_location: &str) -> Option<RemoteState> {
        self.lock().sessions.get(parts_location).map(|s| s.state)
    }

    /// Server-side states of every session ever opened
    pub fn remote_states(&self) -> Vec<RemoteState> {
        self.lock().sessions.values().map(|s| s.state).collect()
    }

    /// Number of parts currently staged for a session
    pub fn part_count(&self, parts_location: &str) -> usize {
        self.lock()
            .sessions
            .get(parts_location)
            .map_or(0, |s| s.parts.len())
    }

    /// Highest number of part uploads observed in flight at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Total number of requests received
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn authorized(&self, request: &Request) -> bool {
        match &self.required_token {
            None => true,
            Some(token) => request
                .headers
                .get("authorization")
                .is_some_and(|value| *value == format!("Bearer {}", token)),
        }
    }

    fn enter_upload(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(&self.in_flight)
    }

    fn open(&self, account: &str, body: &[u8]) -> Response {
        let request: OpenRequest = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(e) => return error(400, ServiceError::new(codes::INVALID_ARGUMENT, e.to_string())),
        };
        if let Err(e) = wire::validate_object_path(&request.object_path) {
            return error(400, ServiceError::new(codes::INVALID_PATH, e.to_string()));
        }
        if wire::account_of(&request.object_path).ok() != Some(account) {
            return error(
                403,
                ServiceError::new(
                    codes::AUTHORIZATION_REQUIRED,
                    format!("{} is not owned by {}", request.object_path, account),
                ),
            );
        }
        if !(1..=MAX_DURABILITY).contains(&request.durability_level) {
            return error(
                400,
                ServiceError::new(
                    codes::INVALID_DURABILITY,
                    format!("durability level {} not accepted", request.durability_level),
                ),
            );
        }

        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("mpu-{:08x}", state.next_id);
        let parts_location = format!("{}/{}", wire::uploads_path(account), id);
        state.sessions.insert(
            parts_location.clone(),
            RemoteSession {
                object_path: request.object_path,
                state: RemoteState::Open,
                parts: BTreeMap::new(),
                object: None,
            },
        );
        Response::json(201, &OpenResponse { id, parts_location })
    }

    fn upload(&self, parts_location: &str, part_number: u32, data: Bytes, corrupt: bool) -> Response {
        let mut state = self.lock();
        let stored = state.stored_bytes();
        state.next_id += 1;
        let serial = state.next_id;

        let Some(session) = state.sessions.get_mut(parts_location) else {
            return no_such_upload(parts_location);
        };
        if session.state != RemoteState::Open {
            return invalid_state(session.state);
        }
        if let Some(quota) = self.quota_bytes {
            if stored + data.len() as u64 > quota {
                return error(
                    507,
                    ServiceError::new(codes::QUOTA_EXCEEDED, format!("quota of {} bytes", quota)),
                );
            }
        }

        let mut checksum = hex::encode(Sha256::digest(&data));
        if corrupt {
            checksum = hex::encode(Sha256::digest(checksum.as_bytes()));
        }
        let identifier = format!("{}-{}", part_number, serial);
        let size_bytes = data.len() as u64;
        session.parts.insert(
            part_number,
            StoredPart {
                identifier: identifier.clone(),
                data,
            },
        );

        Response::json(
            200,
            &UploadPartResponse {
                server_identifier: identifier,
                size_bytes,
                checksum,
            },
        )
    }

    fn commit(&self, parts_location: &str, body: &[u8]) -> Response {
        let request: CommitRequest = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(e) => return error(400, ServiceError::new(codes::INVALID_ARGUMENT, e.to_string())),
        };
        if request.parts_location != parts_location {
            return error(
                400,
                ServiceError::new(codes::INVALID_ARGUMENT, "parts location does not match route"),
            );
        }
        if request.ordered_identifiers.is_empty() {
            return error(400, ServiceError::new(codes::INVALID_ARGUMENT, "no parts listed"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = request
            .ordered_identifiers
            .iter()
            .find(|id| !seen.insert(id.as_str()))
        {
            return error(
                400,
                ServiceError::new(codes::INVALID_ARGUMENT, format!("duplicate part {}", dup)),
            );
        }

        let mut state = self.lock();
        let Some(session) = state.sessions.get_mut(parts_location) else {
            return no_such_upload(parts_location);
        };
        if session.state != RemoteState::Open {
            return invalid_state(session.state);
        }

        let mut content = BytesMut::new();
        for id in &request.ordered_identifiers {
            match session.parts.values().find(|p| &p.identifier == id) {
                Some(part) => content.extend_from_slice(&part.data),
                None => return error(409, ServiceError::new(codes::INVALID_PART, id.clone())),
            }
        }

        let content = content.freeze();
        let reference = ObjectReference {
            path: session.object_path.clone(),
            digest: Some(hex::encode(Sha256::digest(&content))),
            size: Some(content.len() as u64),
        };
        session.state = RemoteState::Committed;
        session.parts.clear();
        session.object = Some(reference.clone());
        let path = session.object_path.clone();
        state.objects.insert(path, content);

        Response::json(
            201,
            &CommitResponse {
                object_reference: reference,
            },
        )
    }

    fn abort(&self, parts_location: &str, body: &[u8]) -> Response {
        if let Err(e) = serde_json::from_slice::<AbortRequest>(body) {
            return error(400, ServiceError::new(codes::INVALID_ARGUMENT, e.to_string()));
        }
        let mut state = self.lock();
        let Some(session) = state.sessions.get_mut(parts_location) else {
            return no_such_upload(parts_location);
        };
        match session.state {
            RemoteState::Open => {
                session.state = RemoteState::Aborted;
                session.parts.clear();
                Response::new(204, Bytes::new())
            }
            RemoteState::Aborted => Response::new(204, Bytes::new()),
            RemoteState::Committed => error(
                409,
                ServiceError::new(codes::ALREADY_COMMITTED, "upload already committed")
                    .with_state(RemoteState::Committed),
            ),
        }
    }

    fn status(&self, parts_location: &str) -> Response {
        let state = self.lock();
        match state.sessions.get(parts_location) {
            Some(session) => Response::json(
                200,
                &StatusResponse {
                    state: session.state,
                    object_reference: session.object.clone(),
                },
            ),
            None => no_such_upload(parts_location),
        }
    }
}

#[async_trait]
impl Transport for MemoryStore {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        if !self.authorized(&request) {
            return Ok(error(
                401,
                ServiceError::new(codes::INVALID_CREDENTIALS, "request signature rejected"),
            ));
        }

        let Some((route, account, parts_location, part_number)) = parse_route(&request) else {
            return Ok(error(
                404,
                ServiceError::new(
                    codes::RESOURCE_NOT_FOUND,
                    format!("{} {}", request.method, request.path),
                ),
            ));
        };

        let fault = self.lock().take_fault(route);
        match fault {
            Some(Fault::Disconnect) => return Err(TransportError::Closed),
            Some(Fault::Unavailable) => {
                return Ok(error(
                    503,
                    ServiceError::new(codes::SERVICE_UNAVAILABLE, "try again later"),
                ))
            }
            _ => {}
        }

        let response = match route {
            Route::Open => self.open(&account, &read_body(request.body).await?),
            Route::UploadPart => {
                let _guard = self.enter_upload();
                let data = read_body(request.body).await?;
                if !self.upload_latency.is_zero() {
                    tokio::time::sleep(self.upload_latency).await;
                }
                self.upload(
                    &parts_location,
                    part_number,
                    data,
                    fault == Some(Fault::CorruptChecksum),
                )
            }
            Route::Commit => self.commit(&parts_location, &read_body(request.body).await?),
            Route::Abort => self.abort(&parts_location, &read_body(request.body).await?),
            Route::Status => self.status(&parts_location),
        };

        if fault == Some(Fault::ApplyThenDisconnect) {
            return Err(TransportError::Closed);
        }
        Ok(response)
    }
}

fn error(status: u16, body: ServiceError) -> Response {
    Response::json(status, &body)
}

fn no_such_upload(parts_location: &str) -> Response {
    error(
        404,
        ServiceError::new(codes::NO_SUCH_UPLOAD, format!("{} not found", parts_location)),
    )
}

fn invalid_state(state: RemoteState) -> Response {
    error(
        409,
        ServiceError::new(codes::INVALID_UPLOAD_STATE, "upload is not open").with_state(state),
    )
}

/// Split a request into (route, account, parts location, part number)
fn parse_route(request: &Request) -> Option<(Route, String, String, u32)> {
    let segments: Vec<&str> = request.path.strip_prefix('/')?.split('/').collect();
    match (request.method, segments.as_slice()) {
        (Method::Post, [account, "uploads"]) => {
            Some((Route::Open, account.to_string(), String::new(), 0))
        }
        (method, [account, "uploads", id, action]) => {
            let location = format!("/{}/uploads/{}", account, id);
            let route = match (method, *action) {
                (Method::Post, "commit") => Route::Commit,
                (Method::Post, "abort") => Route::Abort,
                (Method::Get, "state") => Route::Status,
                (Method::Put, number) => {
                    let n = number.parse().ok()?;
                    return Some((Route::UploadPart, account.to_string(), location, n));
                }
                _ => return None,
            };
            Some((route, account.to_string(), location, 0))
        }
        _ => None,
    }
}

async fn read_body(body: Body) -> Result<Bytes, TransportError> {
    match body {
        Body::Empty => Ok(Bytes::new()),
        Body::Json(bytes) => Ok(bytes),
        Body::Stream(mut stream, _) => {
            let mut buf = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                buf.extend_from_slice(&chunk?);
            }
            Ok(buf.freeze())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(store: &MemoryStore, path: &str) -> OpenResponse {
        let request = Request::new(Method::Post, "/acct/uploads")
            .json(&OpenRequest {
                object_path: path.to_string(),
                durability_level: 2,
            })
            .unwrap();
        store.send(request).await.unwrap().decode().unwrap()
    }

    async fn put(store: &MemoryStore, location: &str, n: u32, data: &'static [u8]) -> Response {
        let request = Request::new(Method::Put, wire::part_path(location, n)).stream(
            Box::pin(futures::stream::iter(vec![Ok::<_, std::io::Error>(
                Bytes::from_static(data),
            )])),
            Some(data.len() as u64),
        );
        store.send(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_upload_commit() {
        let store = MemoryStore::new();
        let session = open(&store, "/acct/stor/obj").await;

        let a: UploadPartResponse = put(&store, &session.parts_location, 1, b"world").await.decode().unwrap();
        let b: UploadPartResponse = put(&store, &session.parts_location, 0, b"hello ").await.decode().unwrap();
        assert_eq!(b.size_bytes, 6);

        let commit = Request::new(Method::Post, wire::commit_path(&session.parts_location))
            .json(&CommitRequest {
                parts_location: session.parts_location.clone(),
                ordered_identifiers: vec![b.server_identifier, a.server_identifier],
            })
            .unwrap();
        let response = store.send(commit).await.unwrap();
        assert_eq!(response.status, 201);

        assert_eq!(store.object("/acct/stor/obj").unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(store.part_count(&session.parts_location), 0);
        assert_eq!(store.remote_state(&session.parts_location), Some(RemoteState::Committed));
    }

    #[tokio::test]
    async fn test_rejects_bad_durability_and_path() {
        let store = MemoryStore::new();
        let request = Request::new(Method::Post, "/acct/uploads")
            .json(&OpenRequest {
                object_path: "/acct/stor/x".to_string(),
                durability_level: 9,
            })
            .unwrap();
        let response = store.send(request).await.unwrap();
        assert_eq!(response.status, 400);
        assert_eq!(response.decode::<ServiceError>().unwrap().code, codes::INVALID_DURABILITY);

        let request = Request::new(Method::Post, "/acct/uploads")
            .json(&OpenRequest {
                object_path: "/acct/stor/".to_string(),
                durability_level: 2,
            })
            .unwrap();
        let response = store.send(request).await.unwrap();
        assert_eq!(response.decode::<ServiceError>().unwrap().code, codes::INVALID_PATH);
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let store = MemoryStore::new();
        let session = open(&store, "/acct/stor/obj").await;
        put(&store, &session.parts_location, 0, b"data").await;

        for _ in 0..2 {
            let abort = Request::new(Method::Post, wire::abort_path(&session.parts_location))
                .json(&AbortRequest {
                    parts_location: session.parts_location.clone(),
                })
                .unwrap();
            assert_eq!(store.send(abort).await.unwrap().status, 204);
        }
        assert_eq!(store.part_count(&session.parts_location), 0);

        let late = put(&store, &session.parts_location, 1, b"late").await;
        assert_eq!(late.status, 409);
    }

    #[tokio::test]
    async fn test_fault_injection_counts_down() {
        let store = MemoryStore::new();
        store.inject(Route::Status, Fault::Unavailable, 1);
        let session = open(&store, "/acct/stor/obj").await;

        let status = || Request::new(Method::Get, wire::state_path(&session.parts_location));
        assert_eq!(store.send(status()).await.unwrap().status, 503);
        assert_eq!(store.send(status()).await.unwrap().status, 200);
        assert_eq!(store.request_count(), 3);
    }

    #[tokio::test]
    async fn test_required_token() {
        let store = MemoryStore::new().with_required_token("s3cret");
        let response = store.send(Request::new(Method::Get, "/acct/uploads/x/state")).await.unwrap();
        assert_eq!(response.status, 401);

        let response = store
            .send(Request::new(Method::Get, "/acct/uploads/x/state").header("Authorization", "Bearer s3cret"))
            .await
            .unwrap();
        assert_eq!(response.status, 404);
    }
}
