use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Cell<T> {
    /// Stamp coordinating producers and consumers: `pos` means the cell is free for the
    ///  producer at position `pos`, `pos + 1` means it holds the value for the consumer at `pos`
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded lock-free multi-producer multi-consumer FIFO queue (Dmitry Vyukov's array based
///  design). Producers and consumers claim positions with a compare-and-swap on their
///  respective counter, and per-cell sequence stamps hand each cell over between them.
pub struct BoundedQueue<T> {
    buffer: Box<[Cell<T>]>,
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

// values are moved between threads through the cells, access to which is coordinated by
//  the sequence stamps
unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
    /// NB: `capacity` must be a power of two and at least 2
    pub fn new(capacity: usize) -> BoundedQueue<T> {
        assert!(capacity >= 2 && capacity.is_power_of_two(), "queue capacity must be a power of two and at least 2: {}", capacity);

        BoundedQueue {
            buffer: (0..capacity)
                .map(|i| Cell {
                    sequence: AtomicUsize::new(i),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                })
                .collect(),
            mask: capacity - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Hands the value back if the queue is full
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let sequence = cell.sequence.load(Ordering::Acquire);
            let diff = (sequence as isize).wrapping_sub(pos as isize);

            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => {
                        // claiming the position gives us exclusive access to the cell until
                        //  the sequence stamp is published
                        unsafe { (*cell.value.get()).write(value); }
                        cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            }
            else if diff < 0 {
                return Err(value);
            }
            else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let sequence = cell.sequence.load(Ordering::Acquire);
            let diff = (sequence as isize).wrapping_sub(pos.wrapping_add(1) as isize);

            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => {
                        // the producer's Release store of the stamp made the value visible
                        let value = unsafe { (*cell.value.get()).assume_init_read() };
                        cell.sequence.store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            }
            else if diff < 0 {
                return None;
            }
            else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// A snapshot that may be outdated by the time the caller looks at it
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// approximate under concurrent modification
    pub fn len(&self) -> usize {
        let dequeue_pos = self.dequeue_pos.load(Ordering::Acquire);
        let enqueue_pos = self.enqueue_pos.load(Ordering::Acquire);
        enqueue_pos.wrapping_sub(dequeue_pos).min(self.capacity())
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
