#[cfg(test)]
mod buffer_test;

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// One overlay payload after encryption, split into wire-sized chunks.
/// The Index preserves the message boundary: popping its last chunk is
/// what sets PUSH on the outgoing packet.
#[derive(Debug, Default)]
pub struct Index {
    chunks: VecDeque<Bytes>,
}

impl Index {
    pub fn new() -> Self {
        Index::default()
    }

    /// Splits one ciphertext into chunks of at most `max_size` bytes.
    pub fn split(data: Bytes, max_size: usize) -> Self {
        let mut chunks = VecDeque::new();
        let mut rest = data;
        while rest.len() > max_size {
            chunks.push_back(rest.split_to(max_size));
        }
        chunks.push_back(rest);
        Index { chunks }
    }

    pub fn add(&mut self, chunk: Bytes) {
        self.chunks.push_back(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }
}

/// Outbound queue: ordered Indices awaiting transmission. Strictly FIFO;
/// a partial Index survives arbitrarily many intervening packets.
#[derive(Debug, Default)]
pub struct OverlayBuffer {
    data: VecDeque<Index>,
}

impl OverlayBuffer {
    pub fn new() -> Self {
        OverlayBuffer::default()
    }

    pub fn add_index(&mut self, index: Index) {
        self.data.push_back(index);
    }

    /// Pops the next chunk. The returned flag is true iff this chunk
    /// emptied the head Index (the chunk must go out with PUSH set).
    pub fn get_chunk(&mut self) -> Result<(Bytes, bool)> {
        let head = self.data.front_mut().ok_or(Error::ErrOverlayBufferEmpty)?;
        let chunk = head.chunks.pop_front().ok_or(Error::ErrOverlayBufferEmpty)?;
        if head.chunks.is_empty() {
            self.data.pop_front();
            return Ok((chunk, true));
        }
        Ok((chunk, false))
    }

    pub fn any_index(&self) -> bool {
        !self.data.is_empty()
    }
}

/// Inbound accumulator: chunk contents received since the last PUSH, in
/// arrival order. On PUSH all of it is concatenated, decrypted and
/// delivered as one payload, then the buffer resets.
#[derive(Debug, Default)]
pub struct WrapperBuffer {
    chunks: Vec<Bytes>,
}

impl WrapperBuffer {
    pub fn new() -> Self {
        WrapperBuffer::default()
    }

    pub fn add_chunk(&mut self, chunk: Bytes) {
        self.chunks.push(chunk);
    }

    /// Concatenates and clears the buffered chunks.
    pub fn drain(&mut self) -> Result<Bytes> {
        if self.chunks.is_empty() {
            return Err(Error::ErrWrapperBufferEmpty);
        }
        let mut joined = BytesMut::new();
        for chunk in self.chunks.drain(..) {
            joined.extend_from_slice(&chunk);
        }
        Ok(joined.freeze())
    }
}
