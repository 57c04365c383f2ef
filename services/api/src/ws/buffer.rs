//! Audio buffered for one utterance.

use bytes::{Bytes, BytesMut};

/// The audio received so far, with a byte cap.
///
/// Snapshots handed to recognition share the buffered bytes. Audio pushed
/// after a snapshot collects in a tail and is folded in by the next one.
#[derive(Debug)]
pub(crate) struct AudioBuffer {
    heard: Bytes,
    tail: BytesMut,
    limit: usize,
}

/// Pushing a chunk would take the utterance past its cap.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("buffered audio would exceed {limit} bytes")]
pub(crate) struct Overflow {
    pub limit: usize,
}

impl AudioBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            heard: Bytes::new(),
            tail: BytesMut::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.heard.len() + self.tail.len()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<(), Overflow> {
        if self.len() + chunk.len() > self.limit {
            return Err(Overflow { limit: self.limit });
        }
        self.tail.extend_from_slice(chunk);
        Ok(())
    }

    /// Everything buffered so far. The buffer keeps its contents.
    pub fn snapshot(&mut self) -> Bytes {
        if !self.tail.is_empty() {
            let tail = self.tail.split();
            self.heard = if self.heard.is_empty() {
                tail.freeze()
            } else {
                // Reuses the allocation once no earlier snapshot is alive.
                let mut whole = match std::mem::take(&mut self.heard).try_into_mut() {
                    Ok(whole) => whole,
                    Err(shared) => BytesMut::from(shared.as_ref()),
                };
                whole.extend_from_slice(&tail);
                whole.freeze()
            };
        }
        self.heard.clone()
    }

    /// Takes the whole utterance, leaving the buffer empty.
    pub fn take(&mut self) -> Bytes {
        let utterance = self.snapshot();
        self.heard = Bytes::new();
        utterance
    }
}
