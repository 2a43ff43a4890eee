//! Bounded pool of page-sized scratch buffers.

use crate::{os, page, Result};

/// A bounded pool of page-sized buffers carved out of a single anonymous
/// mapping.
///
/// The pool front-loads all of its allocation work: after construction,
/// acquiring and releasing buffers touches nothing but a preallocated
/// free-list, performing no heap allocation and no system calls. This is the
/// invariant the write-capture path depends on, since it runs inside a fault
/// handler.
///
/// Buffers are handed out uninitialized with respect to their previous use;
/// callers that need zeroed memory clear it themselves.
pub struct PagePool {
  base: *mut u8,
  len: usize,
  capacity: usize,
  free: Vec<u32>,
}

impl PagePool {
  /// Creates a pool of `capacity` page-sized buffers.
  pub fn new(capacity: usize) -> Result<Self> {
    let len = capacity * page::size();
    let base = unsafe { os::map_anon(len, false)? };
    let free = (0..capacity as u32).rev().collect();

    Ok(PagePool {
      base,
      len,
      capacity,
      free,
    })
  }

  /// Takes a buffer out of the pool, or `None` when the pool is exhausted.
  pub fn acquire(&mut self) -> Option<*mut u8> {
    let index = self.free.pop()?;
    Some(unsafe { self.base.add(index as usize * page::size()) })
  }

  /// Returns a previously acquired buffer to the pool.
  pub fn release(&mut self, buffer: *mut u8) {
    let offset = buffer as usize - self.base as usize;
    let index = offset / page::size();

    debug_assert_eq!(offset % page::size(), 0);
    debug_assert!(index < self.capacity);
    self.free.push(index as u32);
  }

  /// Returns the number of buffers currently available.
  pub fn available(&self) -> usize {
    self.free.len()
  }
}

impl Drop for PagePool {
  fn drop(&mut self) {
    let result = unsafe { os::unmap(self.base, self.len) };
    debug_assert!(result.is_ok(), "freeing pool mapping: {:?}", result);
  }
}
