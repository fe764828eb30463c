//! Part data sources
//!
//! A part body must be re-readable: integrity failures are retried as fresh
//! uploads, so every attempt calls [`PartSource::open`] again.

use crate::error::{MpuError, MpuResult};
use crate::transport::BodyStream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// Chunk size used when streaming in-memory and file data
const STREAM_CHUNK: usize = 64 * 1024;

/// Finite, re-openable byte stream for one part
#[async_trait]
pub trait PartSource: Send + Sync {
    /// Open a fresh stream over the part content
    async fn open(&self) -> MpuResult<BodyStream>;

    /// Length in bytes, if known up front
    fn size_hint(&self) -> Option<u64>;
}

/// Part content held in memory
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Bytes,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl PartSource for BytesSource {
    async fn open(&self) -> MpuResult<BodyStream> {
        let chunks: Vec<std::io::Result<Bytes>> = (0..self.data.len())
            .step_by(STREAM_CHUNK)
            .map(|start| {
                let end = (start + STREAM_CHUNK).min(self.data.len());
                Ok(self.data.slice(start..end))
            })
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// Byte range of a local file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSegment {
    path: PathBuf,
    offset: u64,
    length: u64,
}

impl FileSegment {
    pub fn new(path: impl Into<PathBuf>, offset: u64, length: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            length,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

#[async_trait]
impl PartSource for FileSegment {
    async fn open(&self) -> MpuResult<BodyStream> {
        let mut file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            MpuError::Io(format!("Failed to open {}: {}", self.path.display(), e))
        })?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let reader = file.take(self.length);
        Ok(Box::pin(ReaderStream::with_capacity(reader, STREAM_CHUNK)))
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.length)
    }
}

/// Source backed by a caller-supplied stream factory of unknown length
pub struct StreamSource {
    factory: Box<dyn Fn() -> BodyStream + Send + Sync>,
}

impl StreamSource {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> BodyStream + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
        }
    }
}

#[async_trait]
impl PartSource for StreamSource {
    async fn open(&self) -> MpuResult<BodyStream> {
        Ok((self.factory)())
    }

    fn size_hint(&self) -> Option<u64> {
        None
    }
}

impl fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamSource")
    }
}

/// One part to upload: slot number, content and optional declared size
#[derive(Clone)]
pub struct PartSpec {
    pub part_number: u32,
    pub source: Arc<dyn PartSource>,
    pub expected_size: Option<u64>,
}

impl PartSpec {
    /// Part whose expected size is the source's own size hint
    pub fn new(part_number: u32, source: Arc<dyn PartSource>) -> Self {
        let expected_size = source.size_hint();
        Self {
            part_number,
            source,
            expected_size,
        }
    }

    /// Part backed by in-memory bytes
    pub fn from_bytes(part_number: u32, data: impl Into<Bytes>) -> Self {
        Self::new(part_number, Arc::new(BytesSource::new(data)))
    }

    /// Override the declared size
    pub fn with_expected_size(mut self, expected_size: Option<u64>) -> Self {
        self.expected_size = expected_size;
        self
    }
}

impl fmt::Debug for PartSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartSpec")
            .field("part_number", &self.part_number)
            .field("expected_size", &self.expected_size)
            .finish()
    }
}

/// Split a local file into consecutive parts of `part_size` bytes.
///
/// Parts are numbered from 0. The last part holds the remainder; an empty
/// file yields a single empty part.
pub async fn split_file(path: &Path, part_size: u64) -> MpuResult<Vec<PartSpec>> {
    if part_size == 0 {
        return Err(MpuError::Validation("part size must be positive".to_string()));
    }

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| MpuError::Io(format!("Failed to stat {}: {}", path.display(), e)))?;
    if !metadata.is_file() {
        return Err(MpuError::Validation(format!(
            "{} is not a regular file",
            path.display()
        )));
    }

    let total = metadata.len();
    let count = total.div_ceil(part_size).max(1);
    if count > u64::from(u32::MAX) {
        return Err(MpuError::Validation(format!(
            "{} would need {} parts",
            path.display(),
            count
        )));
    }

    Ok((0..count)
        .map(|index| {
            let offset = index * part_size;
            let length = part_size.min(total - offset);
            PartSpec::new(index as u32, Arc::new(FileSegment::new(path, offset, length)))
        })
        .collect())
}
