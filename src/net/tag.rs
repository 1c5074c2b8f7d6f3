//! Connection tags.

use std::sync::atomic::{AtomicI32, Ordering};

/// Disambiguates concurrent connections sharing one backend communicator.
pub type Tag = i32;

/// First tag handed out by a fresh allocator.
pub const FIRST_TAG: Tag = 1;

/// Monotonic, lock-free tag source.
///
/// Every call to [`next`](TagAllocator::next) returns a value no other call on
/// the same allocator has returned.
#[derive(Debug)]
pub struct TagAllocator {
    next: AtomicI32,
}

impl TagAllocator {
    /// Allocator starting at [`FIRST_TAG`].
    pub fn new() -> Self {
        TagAllocator {
            next: AtomicI32::new(FIRST_TAG),
        }
    }

    /// Allocate a fresh tag.
    ///
    /// # Panics
    ///
    /// Panics if the positive tag space is exhausted.
    pub fn next(&self) -> Tag {
        let tag = self.next.fetch_add(1, Ordering::Relaxed);
        assert!(tag >= FIRST_TAG, "connection tag space exhausted");
        tag
    }

    /// The tag the next call will return.
    pub fn peek(&self) -> Tag {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for TagAllocator {
    fn default() -> Self {
        TagAllocator::new()
    }
}
