//! Single-producer/single-consumer ring buffer.
//!
//! One byte of the backing region is permanently reserved so that `head ==
//! tail` can mean "empty" without also meaning "full". Capacity is therefore
//! `region.len() - 1`.
//!
//! Exactly one producer may call `write`/`write_byte`, and exactly one
//! consumer may call `read`/`read_byte`, concurrently and without any lock:
//! the producer only ever mutates `tail`, the consumer only ever mutates
//! `head`, and each observes the other's cursor through a single atomic load.
//! `Ordering::Release` on the writing side and `Ordering::Acquire` on the
//! peer-observing side are enough to keep the compiler (and, on other
//! targets, the hardware) from reordering the data write ahead of the cursor
//! publish, so a byte is never visible to its reader before it's written.

use core::sync::atomic::{AtomicUsize, Ordering};

pub struct RingBuffer {
    /// Backing storage, `len` bytes. Null only when `len == 1` (zero
    /// capacity; no byte is ever read through it).
    ptr: *mut u8,
    len: usize,
    /// Read cursor. Mutated only by the consumer.
    head: AtomicUsize,
    /// Write cursor. Mutated only by the producer.
    tail: AtomicUsize,
}

// Safety: `RingBuffer` is designed to be shared between exactly one producer
// and one consumer, each touching only their own cursor and the disjoint
// region of the backing storage that cursor guards.
unsafe impl Sync for RingBuffer {}
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// An uninitialized, zero-capacity ring buffer, suitable for a `static`
    /// that will be `init`ialized before first use.
    pub const EMPTY: Self = RingBuffer {
        ptr: core::ptr::null_mut(),
        len: 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    };

    /// Initializes a ring buffer to use `region` as backing storage.
    ///
    /// `region.len()` becomes `L`; capacity is `L - 1`. `region` must be at
    /// least one byte long (a one-byte region gives a valid, permanently-empty,
    /// zero-capacity buffer).
    pub fn init(&mut self, region: &'static mut [u8]) {
        assert!(!region.is_empty(), "ring buffer region must be non-empty");
        self.len = region.len();
        self.ptr = region.as_mut_ptr();
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        debug_assert!(self.is_valid());
    }

    /// Whether the cursors are within bounds. Used only in debug assertions;
    /// the implementation maintains this invariant by construction.
    pub fn is_valid(&self) -> bool {
        self.len >= 1
            && self.head.load(Ordering::Relaxed) < self.len
            && self.tail.load(Ordering::Relaxed) < self.len
    }

    pub fn capacity(&self) -> usize {
        self.len - 1
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.data_len() == self.capacity()
    }

    pub fn data_len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail.wrapping_sub(head)).wrapping_add(self.len) % self.len
    }

    /// Appends `byte` unless the buffer is full. Returns whether it fit.
    ///
    /// Call only from the single producer.
    pub fn write_byte(&self, byte: u8) -> bool {
        debug_assert!(self.is_valid());
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let next = (tail + 1) % self.len;
        if next == head {
            return false;
        }
        // Safety: `tail` is owned exclusively by the producer and is always
        // in `[0, len)`; `ptr` is non-null whenever a write can be reached
        // (capacity 0 implies `next == head` above for any `tail`).
        unsafe { *self.ptr.add(tail) = byte };
        self.tail.store(next, Ordering::Release);
        true
    }

    /// Consumes the oldest byte into `*out` (if `out` is `Some`), or
    /// discards it. Returns whether a byte was available.
    ///
    /// Call only from the single consumer.
    pub fn read_byte(&self, out: Option<&mut u8>) -> bool {
        debug_assert!(self.is_valid());
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return false;
        }
        // Safety: see `write_byte`; `head` is owned exclusively by the
        // consumer and always addresses a byte the producer has published.
        let byte = unsafe { *self.ptr.add(head) };
        if let Some(out) = out {
            *out = byte;
        }
        self.head.store((head + 1) % self.len, Ordering::Release);
        true
    }

    /// Greedily appends as much of `src` as fits. Returns the number of
    /// bytes actually written.
    pub fn write(&self, src: &[u8]) -> usize {
        let mut n = 0;
        for &b in src {
            if !self.write_byte(b) {
                break;
            }
            n += 1;
        }
        n
    }

    /// Greedily consumes into `dst`. Returns the number of bytes actually
    /// read.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let mut n = 0;
        for slot in dst.iter_mut() {
            if !self.read_byte(Some(slot)) {
                break;
            }
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(region: &'static mut [u8]) -> RingBuffer {
        let mut rb = RingBuffer::EMPTY;
        rb.init(region);
        rb
    }

    #[test]
    fn scenario_a_fill_then_drain() {
        static mut BUF: [u8; 4] = [0; 4];
        let rb = make(unsafe { &mut BUF });
        assert_eq!(rb.write(&[1, 2, 3]), 3);
        let mut out = [0u8; 3];
        assert_eq!(rb.read(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert!(rb.is_empty());
    }

    #[test]
    fn scenario_b_overflow_reports_short_write() {
        static mut BUF: [u8; 4] = [0; 4];
        let rb = make(unsafe { &mut BUF });
        assert_eq!(rb.write(&[1, 2, 3, 4]), 3);
        assert!(rb.is_full());
    }

    #[test]
    fn scenario_c_interleaved_write_read() {
        static mut BUF: [u8; 4] = [0; 4];
        let rb = make(unsafe { &mut BUF });
        assert_eq!(rb.write(&[1, 2]), 2);
        let mut one = 0u8;
        assert!(rb.read_byte(Some(&mut one)));
        assert_eq!(one, 1);
        assert_eq!(rb.write(&[3, 4]), 2);
        let mut out = [0u8; 3];
        assert_eq!(rb.read(&mut out), 3);
        assert_eq!(out, [2, 3, 4]);
        assert!(rb.is_empty());
    }

    #[test]
    fn capacity_is_length_minus_one() {
        static mut BUF: [u8; 8] = [0; 8];
        let rb = make(unsafe { &mut BUF });
        assert_eq!(rb.capacity(), 7);
    }

    #[test]
    fn is_full_and_is_empty_are_mutually_exclusive() {
        static mut BUF: [u8; 4] = [0; 4];
        let rb = make(unsafe { &mut BUF });
        assert!(rb.is_empty());
        assert!(!rb.is_full());
        rb.write(&[0, 0, 0]);
        assert!(rb.is_full());
        assert!(!rb.is_empty());
    }

    #[test]
    fn round_trip_prefix_property() {
        static mut BUF: [u8; 5] = [0; 5];
        let rb = make(unsafe { &mut BUF });
        let written: [u8; 10] = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100];
        let mut consumed = 0usize;
        let mut out = [0u8; 10];
        for chunk in written.chunks(3) {
            let w = rb.write(chunk);
            let r = rb.read(&mut out[consumed..consumed + w]);
            assert_eq!(w, r);
            consumed += r;
        }
        assert_eq!(&out[..consumed], &written[..consumed]);
        assert!(rb.data_len() <= rb.capacity());
    }
}
