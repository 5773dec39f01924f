use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::{addr_of, null_mut, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

/// Its address marks a slot whose entry is checked out. A static is never a heap address, so
///  it can not be confused with an entry.
static CHECKED_OUT: u8 = 0;

/// A fixed size open addressed table of heap allocated entries, one entry per slot, indexed by
///  `key & (size - 1)`. There is no chaining: inserting into an occupied slot fails.
///
/// Ownership of an entry is transferred by atomically swapping its pointer: whoever takes the
///  pointer out of a slot owns the entry exclusively, and only the owner ever dereferences it.
///  Reading an entry checks it out, leaving a marker in the slot until it is checked back in.
///  A checked out slot counts as occupied, and operations that need its entry wait for it.
pub struct SlotTable<T> {
    slots: Box<[AtomicPtr<T>]>,
    mask: usize,
    _marker: PhantomData<T>,
}

fn checked_out<T>() -> *mut T {
    addr_of!(CHECKED_OUT) as *mut T
}

/// An entry taken out of its slot for inspection. It goes back when the guard is dropped,
///  unless it was removed.
pub struct CheckedOut<'a, T> {
    slot: &'a AtomicPtr<T>,
    entry: NonNull<T>,
}

impl<T> CheckedOut<'_, T> {
    /// Removes the entry from the table for good
    pub fn remove(self) -> Box<T> {
        let raw = self.entry.as_ptr();
        self.slot.store(null_mut(), Ordering::Release);
        std::mem::forget(self);
        unsafe { Box::from_raw(raw) }
    }
}

impl<T> Deref for CheckedOut<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // checked out entries are exclusively ours
        unsafe { self.entry.as_ref() }
    }
}

impl<T> DerefMut for CheckedOut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.entry.as_mut() }
    }
}

impl<T> Drop for CheckedOut<'_, T> {
    fn drop(&mut self) {
        // nobody else modifies a checked out slot
        self.slot.store(self.entry.as_ptr(), Ordering::Release);
    }
}

impl<T> SlotTable<T> {
    /// NB: `size` must be a power of two, which is ensured by configuration validation
    pub fn new(size: usize) -> SlotTable<T> {
        assert!(size.is_power_of_two(), "slot table size must be a power of two: {}", size);

        SlotTable {
            slots: (0..size).map(|_| AtomicPtr::new(null_mut())).collect(),
            mask: size - 1,
            _marker: Default::default(),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, key: u32) -> &AtomicPtr<T> {
        &self.slots[key as usize & self.mask]
    }

    pub fn is_vacant(&self, key: u32) -> bool {
        self.slot(key).load(Ordering::Acquire).is_null()
    }

    /// Hands the value back if the slot is occupied or checked out
    pub fn try_insert(&self, key: u32, value: T) -> Result<(), T> {
        let new = Box::into_raw(Box::new(value));
        match self.slot(key).compare_exchange(null_mut(), new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(_) => {
                // never published, so this is still exclusively ours
                let value = unsafe { Box::from_raw(new) };
                Err(*value)
            }
        }
    }

    /// Atomically replaces the slot's current entry with `replacement`, waiting while the entry
    ///  is checked out. Returns the previous raw pointer, which is null if the slot was empty.
    fn swap_current(&self, key: u32, replacement: *mut T) -> *mut T {
        let slot = self.slot(key);
        loop {
            let current = slot.load(Ordering::Acquire);
            if current.is_null() {
                return current;
            }
            if current == checked_out() {
                std::thread::yield_now();
                continue;
            }
            if slot.compare_exchange(current, replacement, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                return current;
            }
        }
    }

    /// Takes the entry out of the key's slot, transferring ownership to the caller
    pub fn take(&self, key: u32) -> Option<Box<T>> {
        let raw = self.swap_current(key, null_mut());
        if raw.is_null() {
            None
        }
        else {
            // the swap made us the sole owner
            Some(unsafe { Box::from_raw(raw) })
        }
    }

    /// Gives exclusive access to the key's entry until the returned guard is dropped
    pub fn check_out(&self, key: u32) -> Option<CheckedOut<'_, T>> {
        // the swap made us the sole owner
        NonNull::new(self.swap_current(key, checked_out()))
            .map(|entry| CheckedOut {
                slot: self.slot(key),
                entry,
            })
    }

    /// Removes the key's entry if `matches` holds for it; a non-matching entry stays in place.
    pub fn remove_if(&self, key: u32, matches: impl FnOnce(&T) -> bool) -> Option<Box<T>> {
        let entry = self.check_out(key)?;
        if matches(&entry) {
            Some(entry.remove())
        }
        else {
            None
        }
    }

    /// Applies `f` to the key's entry without removing it
    pub fn with_entry<R>(&self, key: u32, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut entry = self.check_out(key)?;
        Some(f(&mut entry))
    }

    /// Visits every occupied slot, checking the entry out for the duration of the call to `f`
    pub fn for_each(&self, mut f: impl FnMut(&mut T)) {
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.load(Ordering::Acquire).is_null() {
                continue;
            }
            if let Some(mut entry) = self.check_out(idx as u32) {
                f(&mut entry);
            }
        }
    }
}

impl<T> Drop for SlotTable<T> {
    fn drop(&mut self) {
        // no guard can outlive the table, so no slot is checked out here
        for slot in self.slots.iter() {
            let raw = slot.swap(null_mut(), Ordering::AcqRel);
            if !raw.is_null() {
                unsafe { drop(Box::from_raw(raw)); }
            }
        }
    }
}
