//! Pooled write buffers.
//!
//! Each connection owns a FIFO queue of pending write buffers plus a free
//! list of drained ones for reuse. The head of the queue is the in-flight
//! buffer; `off` tracks how much of it has been written to the socket.

use logvault_wire::Frame;

/// One queued outbound record: the wire-ready bytes and a consumed offset.
#[derive(Debug, Default)]
pub(crate) struct WriteBuf {
    data: Vec<u8>,
    off: usize,
}

impl WriteBuf {
    /// The bytes still to be written.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.off..]
    }

    /// Marks `n` more bytes as written.
    pub fn advance(&mut self, n: usize) {
        self.off += n;
        debug_assert!(self.off <= self.data.len());
    }

    /// True once the whole buffer has been written.
    pub fn is_done(&self) -> bool {
        self.off == self.data.len()
    }

    /// Prepares a recycled buffer for a record of `len` bytes.
    ///
    /// Capacity grows to the next power of two so buffers converge on a
    /// stable size for a connection's message mix.
    fn reset_for(&mut self, len: usize) {
        self.data.clear();
        self.off = 0;
        if self.data.capacity() < len {
            self.data.reserve_exact(len.next_power_of_two() - self.data.len());
        }
    }
}

/// FIFO write queue with buffer reuse.
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    queue: std::collections::VecDeque<WriteBuf>,
    free: Vec<WriteBuf>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns a buffer with capacity for `len` bytes, preferring reuse.
    fn get_free(&mut self, len: usize) -> WriteBuf {
        let mut buf = self.free.pop().unwrap_or_default();
        buf.reset_for(len);
        buf
    }

    /// Appends a frame (length prefix plus payload) to the queue.
    pub fn enqueue_frame(&mut self, frame: &Frame) {
        let mut buf = self.get_free(frame.total_size());
        buf.data
            .extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
        buf.data.extend_from_slice(&frame.payload);
        self.queue.push_back(buf);
    }

    /// Appends an already-framed record to the queue.
    pub fn enqueue_raw_frame(&mut self, payload: &[u8]) {
        let mut buf = self.get_free(4 + payload.len());
        buf.data
            .extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.data.extend_from_slice(payload);
        self.queue.push_back(buf);
    }

    /// The in-flight buffer at the head of the queue.
    pub fn head_mut(&mut self) -> Option<&mut WriteBuf> {
        self.queue.front_mut()
    }

    /// Moves the drained head buffer to the free list.
    pub fn recycle_head(&mut self) {
        if let Some(buf) = self.queue.pop_front() {
            debug_assert!(buf.is_done());
            self.free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(data: &[u8]) -> Frame {
        Frame::new(Bytes::copy_from_slice(data)).unwrap()
    }

    #[test]
    fn fifo_order_and_framing() {
        let mut q = WriteQueue::new();
        q.enqueue_frame(&frame(b"first"));
        q.enqueue_frame(&frame(b"second"));
        assert_eq!(q.len(), 2);

        let head = q.head_mut().unwrap();
        assert_eq!(&head.remaining()[..4], &5u32.to_be_bytes());
        assert_eq!(&head.remaining()[4..], b"first");
    }

    #[test]
    fn partial_writes_track_offset() {
        let mut q = WriteQueue::new();
        q.enqueue_frame(&frame(b"payload"));

        let head = q.head_mut().unwrap();
        let total = head.remaining().len();
        head.advance(4);
        assert_eq!(head.remaining().len(), total - 4);
        assert!(!head.is_done());
        head.advance(total - 4);
        assert!(head.is_done());
        q.recycle_head();
        assert!(q.is_empty());
    }

    #[test]
    fn drained_buffers_are_reused() {
        let mut q = WriteQueue::new();
        q.enqueue_frame(&frame(&[0u8; 100]));
        let head = q.head_mut().unwrap();
        let n = head.remaining().len();
        head.advance(n);
        q.recycle_head();
        assert_eq!(q.free.len(), 1);

        q.enqueue_frame(&frame(b"tiny"));
        assert!(q.free.is_empty());
        // The recycled buffer kept its grown capacity.
        assert!(q.queue.front().unwrap().data.capacity() >= 104);
    }

    #[test]
    fn capacity_grows_to_power_of_two() {
        let mut q = WriteQueue::new();
        q.enqueue_frame(&frame(&[7u8; 1000]));
        assert!(q.queue.front().unwrap().data.capacity() >= 1024);
    }
}
