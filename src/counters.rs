//! Shared sharing-instrumentation counters.
//!
//! One `Counters` block is created per region inside a `MAP_SHARED` anonymous
//! mapping, so worker processes forked afterwards all observe the same cells.
//! Cross-process coordination happens exclusively through the atomics in this
//! block; the block itself holds no locks.

use crate::{os, page, Result};
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Reserved owner id meaning "written by two or more processes".
pub const SHARED_MARK: u32 = u32::max_value();

/// Invalidation count at which a cache line becomes interesting enough that
/// its counters survive heap object reuse.
pub const MIN_INVALIDATES_CARE: u32 = 4;

/// Extracts the owner id from a packed word-change cell.
#[inline]
pub fn word_owner(cell: u64) -> u32 {
  cell as u32
}

/// Extracts the version from a packed word-change cell.
#[inline]
pub fn word_version(cell: u64) -> u32 {
  (cell >> 32) as u32
}

#[inline]
fn pack(owner: u32, version: u32) -> u64 {
  (u64::from(version) << 32) | u64::from(owner)
}

/// Per-region instrumentation state shared by every worker process.
///
/// The block is laid out as four arrays sized by the region: one writer count
/// per page, one last-writer id and one invalidation count per cache line,
/// and one packed (owner, version) cell per machine word.
pub struct Counters {
  base: *mut u8,
  map_len: usize,
  pages: usize,
  lines: usize,
  words: usize,
  lines_offset: usize,
  invalidates_offset: usize,
  words_offset: usize,
}

unsafe impl Send for Counters {}
unsafe impl Sync for Counters {}

impl Counters {
  /// Creates a zeroed counter block covering `len` region bytes.
  ///
  /// `len` must be a multiple of the page size.
  pub fn new(len: usize) -> Result<Self> {
    debug_assert_eq!(len % page::size(), 0);

    let pages = len / page::size();
    let lines = len / page::CACHE_LINE_SIZE;
    let words = len / page::WORD_SIZE;

    let lines_offset = pages * 4;
    let invalidates_offset = lines_offset + lines * 4;
    let words_offset = (invalidates_offset + lines * 4 + 7) & !7;
    let map_len = page::ceil(words_offset + words * 8);

    let base = unsafe { os::map_anon(map_len, true)? };

    Ok(Counters {
      base,
      map_len,
      pages,
      lines,
      words,
      lines_offset,
      invalidates_offset,
      words_offset,
    })
  }

  fn page_users(&self) -> &[AtomicU32] {
    unsafe { slice::from_raw_parts(self.base as *const AtomicU32, self.pages) }
  }

  fn cache_last_thread(&self) -> &[AtomicU32] {
    unsafe { slice::from_raw_parts(self.base.add(self.lines_offset) as *const AtomicU32, self.lines) }
  }

  /// Per-cache-line counts of cross-process invalidations.
  pub fn cache_invalidates(&self) -> &[AtomicU32] {
    unsafe {
      slice::from_raw_parts(
        self.base.add(self.invalidates_offset) as *const AtomicU32,
        self.lines,
      )
    }
  }

  /// Per-word packed (owner, version) cells.
  pub fn word_changes(&self) -> &[AtomicU64] {
    unsafe { slice::from_raw_parts(self.base.add(self.words_offset) as *const AtomicU64, self.words) }
  }

  /// Notes one more process with a pending write to `page`, returning the
  /// previous writer count.
  pub fn note_writer(&self, page: usize) -> u32 {
    self.page_users()[page].fetch_add(1, Ordering::AcqRel)
  }

  /// Retracts a pending write to `page` at transaction end.
  pub fn drop_writer(&self, page: usize) {
    let previous = self.page_users()[page].fetch_sub(1, Ordering::AcqRel);
    debug_assert!(previous > 0);
  }

  /// Returns the number of processes whose current transaction dirtied `page`.
  pub fn writers(&self, page: usize) -> u32 {
    self.page_users()[page].load(Ordering::Acquire)
  }

  /// Records that `tid` invalidated cache line `line`.
  ///
  /// Only a change of writer counts: the increment happens when the previous
  /// writer was a different live process.
  pub fn record_invalidate(&self, tid: u32, line: usize) {
    let last = self.cache_last_thread()[line].swap(tid, Ordering::AcqRel);
    if last != 0 && last != tid {
      self.cache_invalidates()[line].fetch_add(1, Ordering::AcqRel);
    }
  }

  /// Folds `delta` observed changes of `word` by `tid` into the word's packed
  /// (owner, version) cell.
  ///
  /// The cell is read and written as one atomic unit, but the update itself is
  /// not a read-modify-write; concurrent committers may overwrite each other's
  /// folds. The version is saturating and therefore never decreases.
  pub fn record_word_changes(&self, word: usize, tid: u32, delta: u32) {
    let cell = &self.word_changes()[word];
    let packed = cell.load(Ordering::Acquire);

    let mut owner = word_owner(packed);
    if owner == 0 {
      owner = tid;
    } else if owner != tid && owner != SHARED_MARK {
      owner = SHARED_MARK;
    }

    let version = word_version(packed).saturating_add(delta);
    cell.store(pack(owner, version), Ordering::Release);
  }

  /// Zeroes the invalidation and word-change counters covering a heap object
  /// about to be reused.
  ///
  /// Returns `false`, leaving every counter intact, when a covered cache
  /// line has already accumulated `MIN_INVALIDATES_CARE` invalidations; that
  /// signal belongs to the reporter, not the allocator. Both ranges are
  /// inclusive.
  pub fn reset_range(
    &self,
    first_line: usize,
    last_line: usize,
    first_word: usize,
    last_word: usize,
  ) -> bool {
    let invalidates = self.cache_invalidates();
    let interesting = (first_line..=last_line)
      .any(|line| invalidates[line].load(Ordering::Acquire) >= MIN_INVALIDATES_CARE);
    if interesting {
      return false;
    }

    for line in first_line..=last_line {
      invalidates[line].store(0, Ordering::Release);
    }

    let word_changes = self.word_changes();
    for word in first_word..=last_word {
      word_changes[word].store(0, Ordering::Release);
    }

    true
  }
}

impl Drop for Counters {
  fn drop(&mut self) {
    let result = unsafe { os::unmap(self.base, self.map_len) };
    debug_assert!(result.is_ok(), "freeing counter mapping: {:?}", result);
  }
}
