//! Binary Object Codec
//!
//! Type-tagged binary encoding used by the disk tier. Every frame carries
//! the runtime type name of the encoded value ahead of the bincode payload,
//! so heterogeneous values can share one column and a mismatched decode
//! fails instead of yielding garbage. Encode buffers are drawn from a
//! bounded lock-free pool to cut per-call allocation on the spillover path.

use crossbeam::queue::ArrayQueue;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Maximum number of encode buffers retained by the pool.
const POOL_CAPACITY: usize = 16;

/// Capacity of a freshly allocated encode buffer.
const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;

/// Buffers that grew beyond this are dropped instead of returned to the pool.
const MAX_RETAINED_CAPACITY: usize = 256 * 1024;

/// Codec error types
#[derive(Debug, Error)]
pub enum CodecError {
    /// Value could not be encoded
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Frame could not be decoded into the requested type
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

/// Thread-safe binary codec with a bounded pool of reusable encode buffers.
///
/// Acquiring a buffer never blocks: a pool miss allocates a fresh buffer,
/// and releasing into a full pool discards the buffer. Decoding requires
/// the requested type to match the type the frame was encoded from.
#[derive(Debug, Clone)]
pub struct ObjectCodec {
    buffers: Arc<ArrayQueue<Vec<u8>>>,
}

impl ObjectCodec {
    /// Creates a codec with the default pool capacity.
    pub fn new() -> Self {
        Self::with_pool_capacity(POOL_CAPACITY)
    }

    /// Creates a codec retaining at most `capacity` encode buffers.
    pub fn with_pool_capacity(capacity: usize) -> Self {
        Self {
            buffers: Arc::new(ArrayQueue::new(capacity.max(1))),
        }
    }

    /// Encodes `value` into a self-describing binary frame.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let type_name = std::any::type_name::<T>();
        let tag = type_name.as_bytes();
        if tag.len() > u16::MAX as usize {
            return Err(CodecError::Serialization(format!(
                "type name too long to tag: {}",
                type_name
            )));
        }

        let mut buf = self.acquire();
        buf.extend_from_slice(&(tag.len() as u16).to_le_bytes());
        buf.extend_from_slice(tag);

        let result = match bincode::serialize_into(&mut buf, value) {
            Ok(()) => Ok(buf.as_slice().to_vec()),
            Err(e) => Err(CodecError::Serialization(e.to_string())),
        };
        self.release(buf);
        result
    }

    /// Decodes a frame produced by [`encode`](Self::encode) back into `T`.
    ///
    /// The requested type must be exactly the type the frame was encoded
    /// from; anything else is a [`CodecError::Deserialization`].
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let payload = check_tag(std::any::type_name::<T>(), bytes)?;
        bincode::deserialize(payload).map_err(|e| CodecError::Deserialization(e.to_string()))
    }

    fn acquire(&self) -> Vec<u8> {
        match self.buffers.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    fn release(&self, buf: Vec<u8>) {
        if buf.capacity() <= MAX_RETAINED_CAPACITY {
            let _ = self.buffers.push(buf);
        }
    }
}

impl Default for ObjectCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Validates the frame's type tag and returns the payload slice.
fn check_tag<'a>(expected: &str, bytes: &'a [u8]) -> Result<&'a [u8], CodecError> {
    if bytes.len() < 2 {
        return Err(CodecError::Deserialization(
            "frame shorter than its tag header".to_string(),
        ));
    }
    let tag_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
    if bytes.len() < 2 + tag_len {
        return Err(CodecError::Deserialization(
            "frame truncated inside its type tag".to_string(),
        ));
    }
    let tag = &bytes[2..2 + tag_len];
    if tag != expected.as_bytes() {
        return Err(CodecError::Deserialization(format!(
            "type tag mismatch: stored {}, requested {}",
            String::from_utf8_lossy(tag),
            expected
        )));
    }
    Ok(&bytes[2 + tag_len..])
}
