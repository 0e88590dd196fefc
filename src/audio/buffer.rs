//! Bounded ring buffers connecting pipeline tasks
//!
//! Two variants share one capability trait:
//!
//! - [`StreamBuffer`] is a byte stream. Writes coalesce with unread bytes, so
//!   a producer writing in irregular chunk sizes still yields a continuous
//!   PCM cadence on the read side.
//! - [`ItemBuffer`] stores each write as one indivisible unit. A reader gets a
//!   whole item or nothing, so two unrelated compressed frames are never
//!   concatenated.
//!
//! Both are single-producer single-consumer. Neither blocks on write: a write
//! that does not fit fails with [`BufferError::WouldOverflow`] and leaves the
//! buffer untouched. A consumer task registers itself with
//! [`RingBuffer::set_consumer`] and then sleeps on the returned [`Consumer`]
//! instead of polling; every successful write posts a coalesced wake.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::BufferError;

/// Wake handle owned by the task registered as a buffer's consumer.
///
/// Wakes are coalesced: any number of writes between two waits collapse into
/// one pending notification. The consumer re-checks buffer state after every
/// wake rather than counting them.
#[derive(Debug)]
pub struct Consumer {
    rx: Receiver<()>,
}

impl Consumer {
    /// Block until woken or until `timeout` elapses.
    /// Returns true if a wake was consumed.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// Consume a pending wake without blocking
    pub fn try_take(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Whether a wake is posted and not yet observed
    pub fn has_pending(&self) -> bool {
        !self.rx.is_empty()
    }
}

/// Producer side of the wake channel. Sending never blocks and never allocates.
#[derive(Default)]
struct Notifier {
    target: Mutex<Option<Sender<()>>>,
}

impl Notifier {
    fn register(&self) -> Result<Consumer, BufferError> {
        let mut target = self.target.lock();
        if let Some(existing) = target.as_ref() {
            // A pending wake whose consumer has been dropped is stale and
            // may be replaced. The channel is full here, so try_send has no
            // side effect.
            if !existing.is_empty() {
                if let Err(TrySendError::Full(())) = existing.try_send(()) {
                    return Err(BufferError::WakePending);
                }
            }
        }

        let (tx, rx) = bounded(1);
        *target = Some(tx);
        Ok(Consumer { rx })
    }

    fn notify(&self) {
        if let Some(tx) = self.target.lock().as_ref() {
            match tx.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {
                    tracing::trace!("Buffer consumer dropped, wake discarded");
                }
            }
        }
    }
}

/// Capabilities shared by both buffer variants
pub trait RingBuffer: Send + Sync {
    /// Append `data`. Stream buffers coalesce it with unread bytes; item
    /// buffers store it as one unit. Never blocks.
    fn write(&self, data: &[u8]) -> Result<(), BufferError>;

    /// Occupied size in bytes
    fn available(&self) -> usize;

    /// Total capacity in bytes
    fn capacity(&self) -> usize;

    /// Register the consumer task that is woken on every successful write.
    ///
    /// Replacing an earlier registration is refused while that consumer still
    /// has an unobserved wake.
    fn set_consumer(&self) -> Result<Consumer, BufferError>;

    /// Post a wake to the registered consumer without writing data.
    /// Used on shutdown so blocked tasks re-check their exit flag.
    fn wake_consumer(&self);

    /// Discard all buffered data
    fn clear(&self);

    /// Free space in bytes
    fn free(&self) -> usize {
        self.capacity().saturating_sub(self.available())
    }

    fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Occupancy as a percentage of capacity
    fn fill_percent(&self) -> u8 {
        match self.capacity() {
            0 => 0,
            cap => ((self.available() * 100) / cap).min(100) as u8,
        }
    }
}

/// Byte-stream ring buffer for continuous PCM
pub struct StreamBuffer {
    bytes: Mutex<VecDeque<u8>>,
    capacity: usize,
    notifier: Notifier,
}

impl StreamBuffer {
    /// Create a stream buffer holding at most `capacity` bytes.
    /// The backing store is allocated once and never grows.
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity(capacity));
        }

        Ok(Self {
            bytes: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notifier: Notifier::default(),
        })
    }

    /// Copy up to `out.len()` bytes into `out` and return how many were copied.
    ///
    /// Fewer bytes than requested may be returned; the caller must check.
    /// Returns [`BufferError::Empty`] if nothing is buffered.
    pub fn read(&self, out: &mut [u8]) -> Result<usize, BufferError> {
        let mut bytes = self.bytes.lock();
        if bytes.is_empty() {
            return Err(BufferError::Empty);
        }

        let n = out.len().min(bytes.len());
        for (dst, src) in out[..n].iter_mut().zip(bytes.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    /// Wait on the consumer wake (bounded by `timeout`) if nothing is
    /// buffered, then perform a non-blocking read.
    pub fn read_blocking(
        &self,
        consumer: &Consumer,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, BufferError> {
        if self.is_empty() {
            consumer.wait(timeout);
        }

        match self.read(out) {
            Err(BufferError::Empty) => Err(BufferError::Timeout),
            other => other,
        }
    }
}

impl RingBuffer for StreamBuffer {
    fn write(&self, data: &[u8]) -> Result<(), BufferError> {
        {
            let mut bytes = self.bytes.lock();
            let free = self.capacity - bytes.len();
            if data.len() > free {
                return Err(BufferError::WouldOverflow {
                    needed: data.len(),
                    free,
                });
            }
            bytes.extend(data.iter().copied());
        }

        self.notifier.notify();
        Ok(())
    }

    fn available(&self) -> usize {
        self.bytes.lock().len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn set_consumer(&self) -> Result<Consumer, BufferError> {
        self.notifier.register()
    }

    fn wake_consumer(&self) {
        self.notifier.notify();
    }

    fn clear(&self) {
        self.bytes.lock().clear();
    }
}

struct ItemQueue {
    items: VecDeque<Bytes>,
    bytes: usize,
}

/// Discrete-item ring buffer for variable-length compressed frames
pub struct ItemBuffer {
    queue: Mutex<ItemQueue>,
    capacity: usize,
    outstanding: AtomicBool,
    notifier: Notifier,
}

impl ItemBuffer {
    /// Create an item buffer whose items may total at most `capacity` bytes
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity(capacity));
        }

        Ok(Self {
            queue: Mutex::new(ItemQueue {
                items: VecDeque::new(),
                bytes: 0,
            }),
            capacity,
            outstanding: AtomicBool::new(false),
            notifier: Notifier::default(),
        })
    }

    /// Store an already-owned item without copying it
    pub fn write_bytes(&self, item: Bytes) -> Result<(), BufferError> {
        {
            let mut queue = self.queue.lock();
            let free = self.capacity - queue.bytes;
            if item.len() > free {
                return Err(BufferError::WouldOverflow {
                    needed: item.len(),
                    free,
                });
            }
            queue.bytes += item.len();
            queue.items.push_back(item);
        }

        self.notifier.notify();
        Ok(())
    }

    /// Borrow the oldest item without copying it.
    ///
    /// The borrow must be released (or dropped) before the next call;
    /// otherwise [`BufferError::ItemOutstanding`] is returned.
    pub fn receive_item(&self) -> Result<ItemRef<'_>, BufferError> {
        if self.outstanding.swap(true, Ordering::AcqRel) {
            return Err(BufferError::ItemOutstanding);
        }

        let front = self.queue.lock().items.front().cloned();
        match front {
            Some(data) => Ok(ItemRef {
                buffer: self,
                data,
            }),
            None => {
                self.outstanding.store(false, Ordering::Release);
                Err(BufferError::Empty)
            }
        }
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.queue.lock().items.len()
    }

    fn return_item(&self, data: &Bytes) {
        let mut queue = self.queue.lock();
        let is_front = queue
            .items
            .front()
            .map(|front| front.as_ptr() == data.as_ptr() && front.len() == data.len())
            .unwrap_or(false);
        if is_front {
            if let Some(item) = queue.items.pop_front() {
                queue.bytes -= item.len();
            }
        }
        drop(queue);
        self.outstanding.store(false, Ordering::Release);
    }
}

impl RingBuffer for ItemBuffer {
    fn write(&self, data: &[u8]) -> Result<(), BufferError> {
        self.write_bytes(Bytes::copy_from_slice(data))
    }

    fn available(&self) -> usize {
        self.queue.lock().bytes
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn set_consumer(&self) -> Result<Consumer, BufferError> {
        self.notifier.register()
    }

    fn wake_consumer(&self) {
        self.notifier.notify();
    }

    fn clear(&self) {
        let mut queue = self.queue.lock();
        queue.items.clear();
        queue.bytes = 0;
    }
}

/// Zero-copy borrow of the oldest item in an [`ItemBuffer`].
/// Dropping it returns the item to the buffer (removing it from the queue).
pub struct ItemRef<'a> {
    buffer: &'a ItemBuffer,
    data: Bytes,
}

impl ItemRef<'_> {
    /// Return the item explicitly
    pub fn release(self) {}

    /// Cheap owned handle to the item bytes
    pub fn to_bytes(&self) -> Bytes {
        self.data.clone()
    }
}

impl Deref for ItemRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for ItemRef<'_> {
    fn drop(&mut self) {
        self.buffer.return_item(&self.data);
    }
}

/// Thread-safe handles to the buffers
pub type SharedStreamBuffer = Arc<StreamBuffer>;
pub type SharedItemBuffer = Arc<ItemBuffer>;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_stream_coalesces_irregular_writes() {
        let buffer = StreamBuffer::new(16).unwrap();
        buffer.write(&[1, 2, 3]).unwrap();
        buffer.write(&[4]).unwrap();
        buffer.write(&[5, 6]).unwrap();

        let mut out = [0u8; 4];
        assert_eq!(buffer.read(&mut out).unwrap(), 4);
        assert_eq!(out, [1, 2, 3, 4]);

        let mut out = [0u8; 8];
        assert_eq!(buffer.read(&mut out).unwrap(), 2);
        assert_eq!(&out[..2], &[5, 6]);

        assert_eq!(buffer.read(&mut out), Err(BufferError::Empty));
    }

    #[test]
    fn test_failed_write_leaves_buffer_untouched() {
        let buffer = StreamBuffer::new(8).unwrap();
        buffer.write(&[9; 6]).unwrap();
        let before = buffer.available();

        let err = buffer.write(&[1, 2, 3]).unwrap_err();
        assert_eq!(err, BufferError::WouldOverflow { needed: 3, free: 2 });
        assert_eq!(buffer.available(), before);

        let mut out = [0u8; 8];
        assert_eq!(buffer.read(&mut out).unwrap(), 6);
        assert_eq!(&out[..6], &[9; 6]);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(StreamBuffer::new(0), Err(BufferError::InvalidCapacity(0))));
        assert!(matches!(ItemBuffer::new(0), Err(BufferError::InvalidCapacity(0))));
    }

    #[test]
    fn test_items_are_retrieved_whole_and_in_order() {
        let buffer = ItemBuffer::new(64).unwrap();
        buffer.write(&[1, 1, 1]).unwrap();
        buffer.write(&[2]).unwrap();
        buffer.write(&[3, 3]).unwrap();
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.available(), 6);

        for expected in [&[1u8, 1, 1][..], &[2][..], &[3, 3][..]] {
            let item = buffer.receive_item().unwrap();
            assert_eq!(&*item, expected);
            item.release();
        }
        assert!(matches!(buffer.receive_item(), Err(BufferError::Empty)));
        assert_eq!(buffer.available(), 0);
    }

    #[test]
    fn test_item_must_be_returned_before_next_receive() {
        let buffer = ItemBuffer::new(64).unwrap();
        buffer.write(&[1]).unwrap();
        buffer.write(&[2]).unwrap();

        let first = buffer.receive_item().unwrap();
        assert!(matches!(buffer.receive_item(), Err(BufferError::ItemOutstanding)));
        drop(first);

        let second = buffer.receive_item().unwrap();
        assert_eq!(&*second, &[2]);
    }

    #[test]
    fn test_item_overflow_counts_bytes() {
        let buffer = ItemBuffer::new(10).unwrap();
        buffer.write(&[0; 6]).unwrap();
        assert!(matches!(
            buffer.write(&[0; 5]),
            Err(BufferError::WouldOverflow { needed: 5, free: 4 })
        ));
        assert_eq!(buffer.len(), 1);
        buffer.write(&[0; 4]).unwrap();
        assert_eq!(buffer.fill_percent(), 100);
    }

    #[test]
    fn test_wakes_are_coalesced() {
        let buffer = StreamBuffer::new(32).unwrap();
        let consumer = buffer.set_consumer().unwrap();

        buffer.write(&[1]).unwrap();
        buffer.write(&[2]).unwrap();
        buffer.write(&[3]).unwrap();

        assert!(consumer.try_take());
        assert!(!consumer.try_take());
        assert_eq!(buffer.available(), 3);
    }

    #[test]
    fn test_replacing_consumer_refused_while_wake_pending() {
        let buffer = ItemBuffer::new(32).unwrap();
        let consumer = buffer.set_consumer().unwrap();
        buffer.write(&[1]).unwrap();

        assert!(matches!(buffer.set_consumer(), Err(BufferError::WakePending)));

        assert!(consumer.try_take());
        assert!(buffer.set_consumer().is_ok());
    }

    #[test]
    fn test_dropped_consumer_with_pending_wake_is_replaceable() {
        let buffer = StreamBuffer::new(8).unwrap();
        let consumer = buffer.set_consumer().unwrap();
        buffer.wake_consumer();
        drop(consumer);

        let replacement = buffer.set_consumer().unwrap();
        assert!(!replacement.has_pending());
    }

    #[test]
    fn test_consumer_woken_by_write_from_other_thread() {
        let buffer = Arc::new(StreamBuffer::new(64).unwrap());
        let consumer = buffer.set_consumer().unwrap();

        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                buffer.write(&[7; 4]).unwrap();
            })
        };

        let start = Instant::now();
        assert!(consumer.wait(Duration::from_secs(2)));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(buffer.available() > 0);
        producer.join().unwrap();
    }

    #[test]
    fn test_read_blocking_times_out_when_idle() {
        let buffer = StreamBuffer::new(8).unwrap();
        let consumer = buffer.set_consumer().unwrap();
        let mut out = [0u8; 4];

        let err = buffer
            .read_blocking(&consumer, &mut out, Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err, BufferError::Timeout);

        buffer.write(&[5, 6]).unwrap();
        let n = buffer
            .read_blocking(&consumer, &mut out, Duration::from_millis(10))
            .unwrap();
        assert_eq!(&out[..n], &[5, 6]);
    }

    proptest! {
        #[test]
        fn prop_stream_fifo(chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..32), 0..32)
        ) {
            let buffer = StreamBuffer::new(64).unwrap();
            let mut written = Vec::new();
            let mut drained = Vec::new();
            let mut out = [0u8; 13];

            for chunk in &chunks {
                if buffer.write(chunk).is_ok() {
                    written.extend_from_slice(chunk);
                }
                while let Ok(n) = buffer.read(&mut out) {
                    drained.extend_from_slice(&out[..n]);
                    if buffer.available() < 8 {
                        break;
                    }
                }
            }
            while let Ok(n) = buffer.read(&mut out) {
                drained.extend_from_slice(&out[..n]);
            }

            prop_assert_eq!(written, drained);
        }

        #[test]
        fn prop_item_fifo(items in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..24), 0..24)
        ) {
            let buffer = ItemBuffer::new(96).unwrap();
            let mut written = Vec::new();
            let mut drained = Vec::new();

            for item in &items {
                if buffer.write(item).is_ok() {
                    written.push(item.clone());
                }
                if buffer.len() > 2 {
                    let got = buffer.receive_item().unwrap();
                    drained.push(got.to_vec());
                }
            }
            while let Ok(got) = buffer.receive_item() {
                drained.push(got.to_vec());
            }

            prop_assert_eq!(written, drained);
        }
    }
}
