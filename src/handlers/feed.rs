//! Feed handlers

use std::collections::VecDeque;

use super::HandlerError;

/// One chunk of payload for an input port
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeedChunk {
    pub bytes: Vec<u8>,
    /// No chunks follow this one
    pub is_eof: bool,
}

impl FeedChunk {
    pub fn data(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            is_eof: false,
        }
    }

    /// Final chunk, possibly carrying the last bytes
    pub fn last(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            is_eof: true,
        }
    }

    pub fn eof() -> Self {
        Self::last(Vec::new())
    }
}

/// Producer of payload for an input port
pub trait FeedHandler: Send {
    /// Return at most `max_len` bytes; longer chunks are truncated
    fn next_chunk(&mut self, max_len: usize) -> Result<FeedChunk, HandlerError>;
}

/// Feeds a byte slice in `max_len` pieces, then an empty end-of-feed chunk
#[derive(Debug, Clone)]
pub struct MemoryFeed {
    data: Vec<u8>,
    position: usize,
}

impl MemoryFeed {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }
}

impl FeedHandler for MemoryFeed {
    fn next_chunk(&mut self, max_len: usize) -> Result<FeedChunk, HandlerError> {
        if self.position >= self.data.len() {
            return Ok(FeedChunk::eof());
        }
        let end = (self.position + max_len).min(self.data.len());
        let chunk = FeedChunk::data(&self.data[self.position..end]);
        self.position = end;
        Ok(chunk)
    }
}

/// Feeds an explicit list of chunks, then an empty end-of-feed chunk
#[derive(Debug, Clone, Default)]
pub struct ChunkFeed {
    chunks: VecDeque<Vec<u8>>,
    calls: usize,
}

impl ChunkFeed {
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            calls: 0,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl FeedHandler for ChunkFeed {
    fn next_chunk(&mut self, _max_len: usize) -> Result<FeedChunk, HandlerError> {
        self.calls += 1;
        Ok(match self.chunks.pop_front() {
            Some(bytes) => FeedChunk::data(bytes),
            None => FeedChunk::eof(),
        })
    }
}
