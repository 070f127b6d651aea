//! # Ring buffer
//!
//! Bounded circular queue connecting pipeline stages, with multi-reader
//! broadcast semantics: every reader owns a private cursor and observes
//! every slot; the writer stamps each slot with a reference count equal to
//! the number of readers that must acknowledge it. The buffer's own read
//! offset only advances once a slot's count reaches zero, so a slow reader
//! holds back reclamation without blocking faster ones.
//!
//! A slot carries `Option<Arc<IpfixMessage>>`; `None` is the shutdown
//! sentinel a writer enqueues once per reader cohort. Readers release their
//! reference and exit when they see it.
//!
//! Only [`RingBuffer::write`], [`RingBuffer::read`] and
//! [`RingBuffer::wait_empty`] block; everything else returns immediately.

use crate::message::IpfixMessage;
use crate::CollectorError;

use std::sync::{Arc, Condvar, Mutex};

struct Slot {
    msg: Option<Arc<IpfixMessage>>,
    refs: usize,
}

struct Inner {
    slots: Vec<Slot>,
    read_offset: usize,
    write_offset: usize,
    count: usize,
}

/// A reader's private position. Fresh cursors attach at the buffer's
/// current read offset on first use and then advance monotonically, one
/// slot per release: no re-reads, no skips.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadCursor {
    pos: Option<usize>,
}

impl ReadCursor {
    pub fn new() -> Self {
        ReadCursor { pos: None }
    }
}

/// Bounded multi-reader broadcast queue of pipeline messages.
///
/// ```
/// use ipfix_collector::ring_buffer::{ReadCursor, RingBuffer};
///
/// let queue = RingBuffer::new(8).unwrap();
/// queue.write(None, 1).unwrap(); // shutdown sentinel for one reader
///
/// let mut cursor = ReadCursor::new();
/// assert!(queue.read(&mut cursor).is_none());
/// queue.release(&mut cursor).unwrap();
/// queue.wait_empty();
/// ```
pub struct RingBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
    /// Signalled on writes and on reader progress (slots reclaimed).
    cond: Condvar,
    /// Signalled when the buffer drains to empty.
    cond_empty: Condvar,
}

impl RingBuffer {
    /// Create a buffer with `capacity` slots. One slot is always kept free
    /// so a fast reader cannot lap a slow writer; the buffer is full at
    /// `capacity - 1` queued messages.
    pub fn new(capacity: usize) -> Result<Arc<RingBuffer>, CollectorError> {
        if capacity < 2 {
            return Err(CollectorError::ConfigInvalid(format!(
                "ring buffer capacity {capacity} too small"
            )));
        }
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot { msg: None, refs: 0 });
        }
        Ok(Arc::new(RingBuffer {
            capacity,
            inner: Mutex::new(Inner {
                slots,
                read_offset: 0,
                write_offset: 0,
                count: 0,
            }),
            cond: Condvar::new(),
            cond_empty: Condvar::new(),
        }))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued messages not yet reclaimed.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue `msg` (or the `None` sentinel) with the given reference
    /// count, blocking while the buffer is full. A zero reference count is
    /// a programming bug and is rejected.
    pub fn write(
        &self,
        msg: Option<Arc<IpfixMessage>>,
        refcount: usize,
    ) -> Result<(), CollectorError> {
        if refcount == 0 {
            return Err(CollectorError::QueueWriteFailed(
                "zero reference count on ring buffer write",
            ));
        }

        let mut inner = self.inner.lock().unwrap();
        while inner.count + 1 >= self.capacity {
            inner = self.cond.wait(inner).unwrap();
        }

        let pos = inner.write_offset;
        inner.slots[pos] = Slot { msg, refs: refcount };
        inner.write_offset = (pos + 1) % self.capacity;
        inner.count += 1;

        self.cond.notify_all();
        Ok(())
    }

    /// Return the message at the reader's cursor, blocking until the writer
    /// has produced one there. The cursor is not advanced; call
    /// [`RingBuffer::release`] when done with the slot. A `None` return is
    /// the shutdown sentinel (release it too, then exit).
    pub fn read(&self, cursor: &mut ReadCursor) -> Option<Arc<IpfixMessage>> {
        let mut inner = self.inner.lock().unwrap();
        let pos = match cursor.pos {
            Some(pos) => pos,
            None => {
                let pos = inner.read_offset;
                cursor.pos = Some(pos);
                pos
            }
        };

        while inner.write_offset == pos {
            inner = self.cond.wait(inner).unwrap();
        }

        inner.slots[pos].msg.clone()
    }

    /// Acknowledge the slot under the cursor and step the cursor forward.
    ///
    /// Decrements the slot's reference count; when the slot at the buffer's
    /// read offset reaches zero, the offset advances past every consecutive
    /// fully-released slot, dropping each slot's message reference on the
    /// way (the last `Arc` dropped frees the message).
    pub fn release(&self, cursor: &mut ReadCursor) -> Result<(), CollectorError> {
        let pos = cursor.pos.ok_or(CollectorError::QueueWriteFailed(
            "release without a prior read",
        ))?;
        cursor.pos = Some((pos + 1) % self.capacity);

        let mut inner = self.inner.lock().unwrap();
        if inner.slots[pos].refs == 0 {
            return Err(CollectorError::QueueWriteFailed(
                "release of an unreferenced ring buffer slot",
            ));
        }
        inner.slots[pos].refs -= 1;

        if inner.slots[inner.read_offset].refs == 0 {
            while inner.count > 0 && inner.slots[inner.read_offset].refs == 0 {
                let off = inner.read_offset;
                inner.slots[off].msg = None;
                inner.read_offset = (off + 1) % self.capacity;
                inner.count -= 1;
            }
            if inner.count == 0 {
                self.cond_empty.notify_all();
            }
            self.cond.notify_all();
        }

        Ok(())
    }

    /// Block until every queued slot has been reclaimed.
    pub fn wait_empty(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.count > 0 {
            inner = self.cond_empty.wait(inner).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{InputInfo, SourceStatus, Transport};
    use std::thread;

    fn test_message(seq: u32) -> Arc<IpfixMessage> {
        let info = Arc::new(InputInfo::network(
            Transport::Udp,
            "127.0.0.1:4739".parse().unwrap(),
        ));
        let mut msg = IpfixMessage::source_event(info, SourceStatus::Opened);
        msg.header.sequence_number = seq;
        Arc::new(msg)
    }

    #[test]
    fn rejects_degenerate_sizes() {
        assert!(RingBuffer::new(0).is_err());
        assert!(RingBuffer::new(1).is_err());
    }

    #[test]
    fn rejects_zero_refcount() {
        let rb = RingBuffer::new(4).unwrap();
        assert!(rb.write(Some(test_message(0)), 0).is_err());
    }

    #[test]
    fn single_reader_sees_messages_in_order() {
        let rb = RingBuffer::new(4).unwrap();
        let mut cursor = ReadCursor::new();

        for seq in 0..3 {
            rb.write(Some(test_message(seq)), 1).unwrap();
            let msg = rb.read(&mut cursor).unwrap();
            assert_eq!(msg.header.sequence_number, seq);
            rb.release(&mut cursor).unwrap();
        }
        assert!(rb.is_empty());
    }

    #[test]
    fn count_tracks_offsets() {
        let rb = RingBuffer::new(4).unwrap();
        let mut cursor = ReadCursor::new();
        rb.write(Some(test_message(1)), 1).unwrap();
        rb.write(Some(test_message(2)), 1).unwrap();
        assert_eq!(rb.len(), 2);
        rb.read(&mut cursor);
        rb.release(&mut cursor).unwrap();
        assert_eq!(rb.len(), 1);
    }

    #[test]
    fn slot_retained_until_every_reader_releases() {
        let rb = RingBuffer::new(4).unwrap();
        let msg = test_message(9);
        rb.write(Some(Arc::clone(&msg)), 2).unwrap();

        let mut first = ReadCursor::new();
        let mut second = ReadCursor::new();
        assert!(rb.read(&mut first).is_some());
        assert!(rb.read(&mut second).is_some());

        rb.release(&mut first).unwrap();
        assert_eq!(rb.len(), 1, "slot must survive the first release");
        rb.release(&mut second).unwrap();
        assert!(rb.is_empty());
    }

    // The threaded producer/consumer exercise: one writer, two readers with
    // independent cursors, terminated by a broadcast sentinel.
    #[test]
    fn broadcast_to_two_threaded_readers() {
        const MESSAGES: u32 = 200;
        let rb = RingBuffer::new(8).unwrap();

        let mut readers = Vec::new();
        for _ in 0..2 {
            let rb = Arc::clone(&rb);
            readers.push(thread::spawn(move || {
                let mut cursor = ReadCursor::new();
                let mut expected = 0u32;
                loop {
                    match rb.read(&mut cursor) {
                        Some(msg) => {
                            assert_eq!(msg.header.sequence_number, expected);
                            expected += 1;
                        }
                        None => {
                            rb.release(&mut cursor).unwrap();
                            break;
                        }
                    }
                    rb.release(&mut cursor).unwrap();
                }
                expected
            }));
        }

        for seq in 0..MESSAGES {
            rb.write(Some(test_message(seq)), 2).unwrap();
        }
        rb.write(None, 2).unwrap();

        for handle in readers {
            assert_eq!(handle.join().unwrap(), MESSAGES);
        }
        rb.wait_empty();
        assert!(rb.is_empty());
    }

    #[test]
    fn wait_empty_returns_once_drained() {
        let rb = RingBuffer::new(4).unwrap();
        rb.write(Some(test_message(1)), 1).unwrap();

        let drainer = {
            let rb = Arc::clone(&rb);
            thread::spawn(move || {
                let mut cursor = ReadCursor::new();
                rb.read(&mut cursor);
                rb.release(&mut cursor).unwrap();
            })
        };
        rb.wait_empty();
        drainer.join().unwrap();
        assert_eq!(rb.len(), 0);
    }
}
