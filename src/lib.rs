/*!
 * Orbit MPU - multipart upload client engine
 *
 * Drives multipart uploads against an object-storage service:
 * - Sessions with an atomic state machine (open, committing, committed, aborting, aborted, failed)
 * - Concurrent part uploads under a configurable ceiling
 * - SHA-256 verification of every part
 * - Commit from an explicit ordering of server identifiers
 * - Idempotent abort, and abort on failure or cancellation
 * - Retry with exponential backoff, jitter and an elapsed-time ceiling
 *
 * The network is reached through the [`transport::Transport`] trait; request
 * signing is injected with [`transport::SigningTransport`].
 */

pub mod abort;
pub mod client;
pub mod commit;
pub mod config;
pub mod error;
pub mod logging;
pub mod retry;
pub mod session;
pub mod source;
pub mod transport;
pub mod types;
pub mod upload;

// Re-export commonly used types
pub use client::MpuClient;
pub use config::{MpuConfig, PartPolicy, RetryConfig};
pub use error::{ErrorClass, MpuError, MpuResult};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use session::RemoteStatus;
pub use source::{split_file, BytesSource, FileSegment, PartSource, PartSpec, StreamSource};
pub use transport::{RequestSigner, SigningTransport, StaticTokenSigner, Transport};
pub use types::{ObjectReference, Part, Session, SessionState, UploadStatus};

/// Re-exported so callers can build cancellation signals without a direct dependency
pub use tokio_util::sync::CancellationToken;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
