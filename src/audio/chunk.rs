use std::collections::VecDeque;

/// Size in bytes of one mono 16-bit chunk
///
/// 16 kHz * 2 bytes * 200 ms = 6400 bytes.
pub fn chunk_bytes(sample_rate: u32, chunk_ms: u32) -> usize {
    (sample_rate as usize * 2 * chunk_ms as usize) / 1000
}

/// Ordered PCM byte buffer that releases fixed-size chunks
///
/// Bytes are only ever released in push order. Every chunk has exactly
/// `chunk_bytes` bytes except the single remainder returned by
/// [`ChunkQueue::flush_final`].
#[derive(Debug)]
pub struct ChunkQueue {
    pending: VecDeque<Vec<u8>>,
    len: usize,
    chunk_bytes: usize,
}

impl ChunkQueue {
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            len: 0,
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Total buffered bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append bytes to the back of the queue
    pub fn push(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.pending.push_back(bytes);
    }

    /// Take one full chunk from the front, splitting the head array if it
    /// straddles the chunk boundary
    pub fn pop_chunk(&mut self) -> Option<Vec<u8>> {
        if self.len < self.chunk_bytes {
            return None;
        }

        let mut chunk = Vec::with_capacity(self.chunk_bytes);
        while chunk.len() < self.chunk_bytes {
            let Some(head) = self.pending.front_mut() else {
                break;
            };
            let need = self.chunk_bytes - chunk.len();
            if head.len() <= need {
                chunk.extend_from_slice(head);
                self.pending.pop_front();
            } else {
                chunk.extend_from_slice(&head[..need]);
                head.drain(..need);
            }
        }

        self.len -= chunk.len();
        Some(chunk)
    }

    /// Take every full chunk currently available
    pub fn drain_ready(&mut self) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.pop_chunk() {
            chunks.push(chunk);
        }
        chunks
    }

    /// Drain full chunks, then the undersized remainder (if any) as one last chunk
    pub fn flush_final(&mut self) -> Vec<Vec<u8>> {
        let mut chunks = self.drain_ready();
        if self.len > 0 {
            let mut rest = Vec::with_capacity(self.len);
            for part in self.pending.drain(..) {
                rest.extend_from_slice(&part);
            }
            self.len = 0;
            chunks.push(rest);
        }
        chunks
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.pending.clear();
        self.len = 0;
    }
}
