//! The storage seam the loader reads module images through.
//!
//! The console side of this trait is a thin wrapper over the block-device
//! driver; on a development host [`RamStorage`] serves images out of memory.
//! Closing a stream is dropping it.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::DlError;

/// Produces a byte stream for a named module image.
pub trait StorageEngine {
    type Stream: ImageStream;

    /// Open the image at `path`, or fail with [`DlError::NotFound`].
    fn open(&mut self, path: &str) -> Result<Self::Stream, DlError>;
}

/// A readable, seekable stream of image bytes.
///
/// A `read` returning fewer bytes than requested means the stream is
/// exhausted; the loader reports that as a truncated image.
pub trait ImageStream {
    fn read(&mut self, buf: &mut [u8]) -> usize;
    fn seek(&mut self, pos: u32);
}

/// Reads the full contents of `buf`, or fails with [`DlError::TruncatedImage`].
pub(crate) fn read_exact(stream: &mut impl ImageStream, buf: &mut [u8]) -> Result<(), DlError> {
    let got = stream.read(buf);
    if got < buf.len() {
        return Err(DlError::TruncatedImage {
            wanted: buf.len(),
            got,
        });
    }
    Ok(())
}

/// In-memory storage: a map from path to image bytes. Used by the test
/// suites, and on-console for module sets baked into the program image.
#[derive(Default)]
pub struct RamStorage {
    images: HashMap<String, Arc<[u8]>>,
}

impl RamStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl ToString, bytes: impl Into<Vec<u8>>) {
        self.images
            .insert(path.to_string(), Arc::from(bytes.into().into_boxed_slice()));
    }
}

impl StorageEngine for RamStorage {
    type Stream = RamStream;

    fn open(&mut self, path: &str) -> Result<RamStream, DlError> {
        let data = self.images.get(path).cloned().ok_or_else(|| DlError::NotFound {
            path: path.to_string(),
        })?;
        trace!("storage: opened {} ({} bytes)", path, data.len());
        Ok(RamStream { data, pos: 0 })
    }
}

pub struct RamStream {
    data: Arc<[u8]>,
    pos: usize,
}

impl RamStream {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::from(bytes.into().into_boxed_slice()),
            pos: 0,
        }
    }
}

impl ImageStream for RamStream {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let avail = self.data.len().saturating_sub(self.pos);
        let n = buf.len().min(avail);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    fn seek(&mut self, pos: u32) {
        self.pos = pos as usize;
    }
}
