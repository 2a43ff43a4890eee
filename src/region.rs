//! Page-protected shared memory regions.
//!
//! A region is one contiguous byte range backed by an unlinked temporary
//! file, mapped twice into the process: a *master* mapping at a kernel-chosen
//! address that always reflects the committed state, and a *working* mapping
//! at the region's public base that the program reads and writes. Between
//! transactions the working mapping is private and read-only, so the first
//! write to each page traps into the write-capture path, which snapshots the
//! page and tracks it until the next commit.

use crate::counters::Counters;
use crate::pool::PagePool;
use crate::tracker::{RegionKind, RegionView, Reporter};
use crate::{diff, fault, os, page, Error, Protection, Result};
use std::os::unix::io::RawFd;
use std::sync::atomic::{compiler_fence, Ordering};
use std::{mem, process, ptr, slice};

/// Upper bound on the pages one transaction may dirty.
const MAX_DIRTY_PAGES: usize = 1024;

/// Twin slots: one original twin per dirty page, plus a temporary twin and a
/// delta buffer for every page that turns out to be shared.
const TWIN_POOL_SLOTS: usize = MAX_DIRTY_PAGES * 3;

/// Bookkeeping for one dirtied page within the current transaction.
struct PageInfo {
  page_no: usize,
  page_start: *mut u8,
  /// Snapshot of the page at the faulting write; read-only until commit.
  orig_twin: *mut u8,
  /// Rolling snapshot refreshed by each sampling pass; null until bound.
  temp_twin: *mut u8,
  /// Per-word change tallies observed by sampling; null until bound.
  deltas: *mut u32,
  shared: bool,
  alloced: bool,
}

pub(crate) struct RegionInner {
  base: usize,
  len: usize,
  fd: RawFd,
  master: *mut u8,
  kind: RegionKind,
  counters: Counters,
  twins: PagePool,
  /// Dirty pages of the current transaction, sorted by page number.
  write_set: Vec<PageInfo>,
}

/// A handle to a page-protected shared memory region.
///
/// Workers forked after construction share the backing file, the master
/// mapping and the instrumentation counters; the working mapping's private
/// copies, the twin pool and the write-set stay private to each process.
pub struct Region(&'static mut RegionInner);

impl Region {
  /// Creates an anonymous heap region of `len` bytes, rounded up to whole
  /// pages and zero-initialized.
  pub fn heap(len: usize) -> Result<Self> {
    Self::open(len, RegionKind::Heap, None)
  }

  /// Overlays `len` bytes at `base` with a region, preserving the first
  /// `init_len` bytes of the original contents.
  ///
  /// The overlay replaces whatever mapping previously backed the range, so
  /// the preserved prefix is copied into the master beforehand. `init_len`
  /// is rounded up to whole pages.
  ///
  /// # Safety
  ///
  /// `base` must be page-aligned and reference `max(len, page::ceil(init_len))`
  /// bytes that stay valid for the lifetime of the region: the preserving
  /// copy reads whole pages, so it reaches up to `page::ceil(init_len)` even
  /// when `init_len` itself does not end on a page boundary. Nothing else may
  /// rely on the previous mapping of the range.
  pub unsafe fn globals(base: *mut u8, len: usize, init_len: usize) -> Result<Self> {
    if base.is_null() || base as usize % page::size() != 0 {
      return Err(Error::InvalidParameter("base"));
    }

    if init_len > len {
      return Err(Error::InvalidParameter("init_len"));
    }

    Self::open(len, RegionKind::Globals, Some((base, init_len)))
  }

  fn open(len: usize, kind: RegionKind, overlay: Option<(*mut u8, usize)>) -> Result<Self> {
    let len = page::ceil(len);
    if len == 0 {
      return Err(Error::InvalidParameter("len"));
    }

    fault::init();

    let counters = Counters::new(len)?;
    let twins = PagePool::new(TWIN_POOL_SLOTS)?;
    let fd = os::temp_file(len)?;

    let master = match unsafe { os::map_file(None, len, Protection::READ_WRITE, true, fd) } {
      Ok(master) => master,
      Err(error) => {
        os::close(fd);
        return Err(error);
      }
    };

    let working = unsafe {
      if let Some((address, init_len)) = overlay {
        // The overlay destroys the original contents, so the preserved
        // prefix goes through the master first.
        ptr::copy_nonoverlapping(address as *const u8, master, page::ceil(init_len));
        os::map_file(Some(address as usize), len, Protection::READ_WRITE, true, fd)
      } else {
        os::map_file(None, len, Protection::READ_WRITE, true, fd)
      }
    };

    let working = match working {
      Ok(working) => working,
      Err(error) => {
        let _ = unsafe { os::unmap(master, len) };
        os::close(fd);
        return Err(error);
      }
    };

    let inner = Box::leak(Box::new(RegionInner {
      base: working as usize,
      len,
      fd,
      master,
      kind,
      counters,
      twins,
      write_set: Vec::with_capacity(MAX_DIRTY_PAGES),
    }));

    log::debug!(
      "opened {:?} region of {} pages at {:#x}",
      kind,
      len / page::size(),
      inner.base
    );

    let inner_ptr = inner as *mut RegionInner;
    if let Err(error) = fault::register(inner_ptr, working as usize, len) {
      unsafe { drop(Box::from_raw(inner_ptr)) };
      return Err(error);
    }

    Ok(Region(inner))
  }

  /// Returns the region's public base address.
  #[inline]
  pub fn base(&self) -> *mut u8 {
    self.0.base as *mut u8
  }

  /// Returns the region's length in bytes.
  ///
  /// The length is always a multiple of the page size.
  #[inline]
  pub fn len(&self) -> usize {
    self.0.len
  }

  /// Returns whether the region is empty or not.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.0.len == 0
  }

  /// Returns whether `address` falls inside `[base, base + len)`.
  #[inline]
  pub fn in_range(&self, address: usize) -> bool {
    self.0.in_range(address)
  }

  /// Arms write capture: the working mapping becomes private and read-only,
  /// so the first write to each page traps and enrolls it.
  pub fn open_protection(&mut self) {
    self.0.open_protection()
  }

  /// Disarms write capture: the working mapping becomes shared and writable,
  /// and writes land in the backing file directly.
  pub fn close_protection(&mut self) {
    self.0.close_protection()
  }

  /// Starts a transaction: discards the private copies of previously dirtied
  /// pages, reprotects them, and empties the write-set.
  pub fn begin(&mut self) {
    self.0.begin()
  }

  /// Ends a transaction: merges the byte-level diffs of all dirty pages into
  /// the master and updates the sharing counters.
  ///
  /// The write-set survives the commit; the caller invokes [`begin`] to start
  /// the next transaction.
  ///
  /// [`begin`]: Region::begin
  pub fn commit(&mut self) {
    self.0.commit_with(true)
  }

  /// Like [`commit`], but when `check` is false the word and cache line
  /// instrumentation is skipped for pages no other process dirtied
  /// concurrently.
  ///
  /// [`commit`]: Region::commit
  pub fn commit_with(&mut self, check: bool) {
    self.0.commit_with(check)
  }

  /// Samples every shared dirty page, tallying word-level deltas and
  /// cache-line interleavings observed since the previous pass.
  pub fn periodic_check(&mut self) {
    self.0.periodic_check()
  }

  /// Clears the counters covering a freed heap object about to be reused.
  ///
  /// Returns `false`, leaving every counter intact, when a covered cache
  /// line has accumulated enough invalidations to matter to the reporter.
  pub fn cleanup_heap_object(&mut self, address: *const u8, size: usize) -> bool {
    self.0.cleanup_heap_object(address, size)
  }

  /// Reads a word from the master, bypassing the process-private view.
  pub fn read_shared_word(&self, address: usize) -> usize {
    self.0.read_shared_word(address)
  }

  /// Writes a word to the master, bypassing the process-private view.
  pub fn write_shared_word(&mut self, address: usize, value: usize) {
    self.0.write_shared_word(address, value)
  }

  /// Returns an iterator over the current write-set as
  /// `(page_no, working, pristine)` page views.
  pub fn dirty_pages(&self) -> impl Iterator<Item = (usize, &[u8], &[u8])> {
    let page_size = page::size();
    self.0.write_set.iter().map(move |info| {
      let working = unsafe { slice::from_raw_parts(info.page_start as *const u8, page_size) };
      let pristine = unsafe { slice::from_raw_parts(info.orig_twin as *const u8, page_size) };
      (info.page_no, working, pristine)
    })
  }

  /// Returns a read-only view of the committed bytes.
  pub fn master(&self) -> &[u8] {
    unsafe { slice::from_raw_parts(self.0.master as *const u8, self.0.len) }
  }

  /// Cross-process invalidation counts, one per cache line.
  pub fn cache_invalidates(&self) -> &[std::sync::atomic::AtomicU32] {
    self.0.counters.cache_invalidates()
  }

  /// Packed (owner, version) change cells, one per machine word.
  pub fn word_changes(&self) -> &[std::sync::atomic::AtomicU64] {
    self.0.counters.word_changes()
  }

  /// Hands the region's bytes and counters to the attribution reporter.
  ///
  /// `end` is one past the last address in use, letting the reporter stop at
  /// the heap break instead of scanning the whole region.
  pub fn finalize(&self, end: usize, reporter: &mut dyn Reporter) {
    let view = RegionView {
      kind: self.0.kind,
      base: self.0.base,
      len: self.0.len,
      end,
      master: self.master(),
      cache_invalidates: self.0.counters.cache_invalidates(),
      word_changes: self.0.counters.word_changes(),
    };

    reporter.check_objects(&view);
  }
}

impl Drop for Region {
  fn drop(&mut self) {
    let inner = self.0 as *mut RegionInner;
    fault::unregister(inner);
    unsafe { drop(Box::from_raw(inner)) };
  }
}

impl RegionInner {
  fn in_range(&self, address: usize) -> bool {
    address >= self.base && address < self.base + self.len
  }

  fn open_protection(&mut self) {
    let remapped =
      unsafe { os::map_file(Some(self.base), self.len, Protection::READ, false, self.fd) };
    if remapped.is_err() {
      os::fatal("twinmap: failed to arm write capture");
    }

    log::trace!("armed write capture at {:#x}", self.base);
  }

  fn close_protection(&mut self) {
    let remapped =
      unsafe { os::map_file(Some(self.base), self.len, Protection::READ_WRITE, true, self.fd) };
    if remapped.is_err() {
      os::fatal("twinmap: failed to disarm write capture");
    }

    log::trace!("disarmed write capture at {:#x}", self.base);
  }

  /// Enrolls the page containing `address` into the write-set.
  ///
  /// Runs inside the fault handler: nothing here may allocate, lock, or fail
  /// in a recoverable way.
  pub(crate) fn handle_write(&mut self, address: usize) {
    if !self.in_range(address) {
      os::fatal("twinmap: fault address outside the region");
    }

    let page_size = page::size();
    let page_no = (address - self.base) / page_size;
    let page_start = (self.base + page_no * page_size) as *mut u8;

    if unsafe { os::protect(page_start as usize, page_size, Protection::READ_WRITE) }.is_err() {
      os::fatal("twinmap: failed to unprotect a faulted page");
    }

    // Touch the page so the kernel materializes the private copy before the
    // snapshot below; the fences keep the dummy store from being elided.
    unsafe {
      compiler_fence(Ordering::SeqCst);
      let first = ptr::read_volatile(page_start);
      ptr::write_volatile(page_start, first);
      compiler_fence(Ordering::SeqCst);
    }

    let orig_twin = match self.twins.acquire() {
      Some(buffer) => buffer,
      None => os::fatal("twinmap: twin pool exhausted; shorten the transaction"),
    };
    unsafe { ptr::copy_nonoverlapping(page_start as *const u8, orig_twin, page_size) };

    let previous = self.counters.note_writer(page_no);

    let info = PageInfo {
      page_no,
      page_start,
      orig_twin,
      temp_twin: ptr::null_mut(),
      deltas: ptr::null_mut(),
      shared: previous != 0,
      alloced: false,
    };

    match self.write_set.binary_search_by_key(&page_no, |info| info.page_no) {
      Ok(position) => {
        // Spurious re-enrollment: keep the fresh snapshot, recycle the old
        // one, and retract the writer count the re-enrollment just added.
        let stale = mem::replace(&mut self.write_set[position], info);
        recycle(&mut self.twins, &stale);
        self.counters.drop_writer(page_no);
      }
      Err(position) => {
        if self.write_set.len() == MAX_DIRTY_PAGES {
          os::fatal("twinmap: write-set capacity exceeded; shorten the transaction");
        }
        self.write_set.insert(position, info);
      }
    }
  }

  fn periodic_check(&mut self) {
    let tid = process::id();
    let words = page::words();

    let counters = &self.counters;
    let twins = &mut self.twins;

    for info in self.write_set.iter_mut() {
      if !info.shared {
        if counters.writers(info.page_no) > 1 {
          info.shared = true;
        } else {
          continue;
        }
      }

      let mut first_pass = false;
      if !info.alloced {
        info.temp_twin = match twins.acquire() {
          Some(buffer) => buffer,
          None => os::fatal("twinmap: twin pool exhausted; shorten the transaction"),
        };
        info.deltas = match twins.acquire() {
          Some(buffer) => buffer as *mut u32,
          None => os::fatal("twinmap: twin pool exhausted; shorten the transaction"),
        };
        unsafe { ptr::write_bytes(info.deltas, 0, words) };
        info.alloced = true;
        first_pass = true;
      }

      unsafe { sample_page(counters, info, first_pass, tid, words) };
    }
  }

  fn commit_with(&mut self, check: bool) {
    let tid = process::id();
    let page_size = page::size();
    let words = page::words();

    let counters = &self.counters;
    let master = self.master;

    for info in self.write_set.iter() {
      let destination = unsafe { master.add(info.page_no * page_size) };

      if check || (info.shared && info.alloced) {
        unsafe { commit_checked(counters, info, destination, tid, words) };
      } else {
        unsafe {
          diff::merge(
            destination,
            info.page_start as *const u8,
            info.orig_twin as *const u8,
            page_size,
          )
        };
      }
    }

    log::trace!("committed {} dirty pages", self.write_set.len());
  }

  fn begin(&mut self) {
    let page_size = page::size();

    let pages: Vec<usize> = self.write_set.iter().map(|info| info.page_no).collect();
    let runs = contiguous_runs(&pages);

    for &(start, count) in &runs {
      let address = self.base + start * page_size;
      let len = count * page_size;

      let discarded = unsafe { os::discard(address, len) };
      let protected = unsafe { os::protect(address, len, Protection::READ) };
      if discarded.is_err() || protected.is_err() {
        os::fatal("twinmap: failed to refresh dirty pages");
      }
    }

    let counters = &self.counters;
    let twins = &mut self.twins;
    for info in self.write_set.iter() {
      counters.drop_writer(info.page_no);
      recycle(twins, info);
    }
    self.write_set.clear();

    log::trace!("refreshed {} pages in {} runs", pages.len(), runs.len());
  }

  fn cleanup_heap_object(&mut self, address: *const u8, size: usize) -> bool {
    let address = address as usize;
    if size == 0 || !self.in_range(address) || !self.in_range(address + size - 1) {
      debug_assert!(false, "heap object outside the region");
      return false;
    }

    let offset = address - self.base;
    let first_line = offset / page::CACHE_LINE_SIZE;
    let last_line = (offset + size - 1) / page::CACHE_LINE_SIZE;
    let first_word = offset / page::WORD_SIZE;
    let last_word = (offset + size - 1) / page::WORD_SIZE;

    self.counters.reset_range(first_line, last_line, first_word, last_word)
  }

  fn read_shared_word(&self, address: usize) -> usize {
    assert!(self.in_range(address));
    unsafe { ptr::read_volatile(self.master.add(address - self.base) as *const usize) }
  }

  fn write_shared_word(&mut self, address: usize, value: usize) {
    assert!(self.in_range(address));
    unsafe { ptr::write_volatile(self.master.add(address - self.base) as *mut usize, value) }
  }
}

impl Drop for RegionInner {
  fn drop(&mut self) {
    unsafe {
      let _ = os::unmap(self.master, self.len);
      let _ = os::unmap(self.base as *mut u8, self.len);
    }
    os::close(self.fd);
  }
}

fn recycle(twins: &mut PagePool, info: &PageInfo) {
  twins.release(info.orig_twin);
  if !info.temp_twin.is_null() {
    twins.release(info.temp_twin);
  }
  if !info.deltas.is_null() {
    twins.release(info.deltas as *mut u8);
  }
}

/// Splits a sorted page list into maximal runs of consecutive numbers.
fn contiguous_runs(pages: &[usize]) -> Vec<(usize, usize)> {
  let mut runs = Vec::new();
  let mut index = 0;

  while index < pages.len() {
    let start = pages[index];
    let mut count = 1;
    while index + count < pages.len() && pages[index + count] == start + count {
      count += 1;
    }

    runs.push((start, count));
    index += count;
  }

  runs
}

/// Tallies the word-level deltas of one shared page since the last pass.
///
/// The first pass diffs the working page against the original twin and then
/// copies it wholesale into the freshly bound temporary twin; later passes
/// diff against the temporary twin and update it word by word. The original
/// twin is never written.
unsafe fn sample_page(
  counters: &Counters,
  info: &mut PageInfo,
  first_pass: bool,
  tid: u32,
  words: usize,
) {
  let local = info.page_start as *const usize;
  let twin = if first_pass { info.orig_twin } else { info.temp_twin } as *const usize;
  let temp = info.temp_twin as *mut usize;

  let lines_base = info.page_no * (page::size() / page::CACHE_LINE_SIZE);
  let mut last_line = usize::max_value();

  for word in 0..words {
    let local_word = local.add(word).read();
    if local_word == twin.add(word).read() {
      continue;
    }

    let delta = info.deltas.add(word);
    *delta = (*delta).saturating_add(1);

    let line = word / page::WORDS_PER_CACHE_LINE;
    if line != last_line {
      counters.record_invalidate(tid, lines_base + line);
      last_line = line;
    }

    if !first_pass {
      temp.add(word).write(local_word);
    }
  }

  if first_pass {
    ptr::copy_nonoverlapping(info.page_start as *const u8, info.temp_twin, page::size());
  }
}

/// Commits one page with full word and cache line instrumentation.
unsafe fn commit_checked(
  counters: &Counters,
  info: &PageInfo,
  destination: *mut u8,
  tid: u32,
  words: usize,
) {
  let local = info.page_start as *const usize;
  let orig = info.orig_twin as *const usize;

  let words_base = info.page_no * words;
  let lines_base = info.page_no * (page::size() / page::CACHE_LINE_SIZE);
  let mut last_line = usize::max_value();

  for word in 0..words {
    let local_word = local.add(word).read();
    let orig_word = orig.add(word).read();
    let delta = if info.deltas.is_null() { 0 } else { *info.deltas.add(word) };

    if local_word == orig_word {
      // The word returned to its pristine value; transient changes seen by
      // sampling still count.
      if delta != 0 {
        counters.record_word_changes(words_base + word, tid, delta);
      }
      continue;
    }

    let line = word / page::WORDS_PER_CACHE_LINE;
    if line != last_line {
      counters.record_invalidate(tid, lines_base + line);
      last_line = line;
    }

    // The final state differs from the last sampled one when the page was
    // never sampled or changed again after the last pass; that difference is
    // the one change sampling could not have seen.
    let unseen = info.temp_twin.is_null()
      || (info.temp_twin as *const usize).add(word).read() != local_word;
    let total = if unseen { delta.saturating_add(1) } else { delta };
    counters.record_word_changes(words_base + word, tid, total);

    diff::merge_word(
      destination,
      info.page_start as *const u8,
      info.orig_twin as *const u8,
      word,
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::counters::{word_owner, word_version, MIN_INVALIDATES_CARE};

  fn heap(pages: usize) -> Region {
    Region::heap(pages * page::size()).expect("creating heap region")
  }

  unsafe fn write_byte(address: *mut u8, value: u8) {
    ptr::write_volatile(address, value);
  }

  unsafe fn write_word(address: *mut u8, value: usize) {
    ptr::write_volatile(address as *mut usize, value);
  }

  impl Region {
    /// Pretends another worker dirtied `page_no` in its current transaction.
    fn fake_remote_enroll(&self, page_no: usize) {
      self.0.counters.note_writer(page_no);
    }

    fn fake_remote_retract(&self, page_no: usize) {
      self.0.counters.drop_writer(page_no);
    }

    fn twin_slots_available(&self) -> usize {
      self.0.twins.available()
    }
  }

  #[test]
  fn contiguous_runs_batches_neighbors() {
    assert_eq!(contiguous_runs(&[5, 6, 7, 9]), vec![(5, 3), (9, 1)]);
    assert_eq!(contiguous_runs(&[2]), vec![(2, 1)]);
    assert_eq!(contiguous_runs(&[1, 3, 5]), vec![(1, 1), (3, 1), (5, 1)]);
    assert_eq!(contiguous_runs(&[]), vec![]);
  }

  #[test]
  fn rejects_empty_regions() {
    assert!(matches!(Region::heap(0), Err(Error::InvalidParameter(_))));
  }

  #[test]
  fn heap_region_starts_zeroed() {
    let region = heap(2);
    assert!(region.master().iter().all(|byte| *byte == 0));
    assert_eq!(region.len(), 2 * page::size());
    assert_eq!(region.dirty_pages().count(), 0);
  }

  #[test]
  fn single_writer_commit_merges_and_instruments() {
    let mut region = heap(2);
    let base = region.base();

    region.open_protection();
    unsafe { write_byte(base, 0xAA) };

    assert_eq!(region.dirty_pages().count(), 1);
    assert!(region.in_range(base as usize));

    region.commit();

    assert_eq!(region.master()[0], 0xAA);
    assert_eq!(region.cache_invalidates()[0].load(Ordering::Acquire), 0);

    let cell = region.word_changes()[0].load(Ordering::Acquire);
    assert_eq!(word_owner(cell), process::id());
    assert_eq!(word_version(cell), 1);

    region.begin();
    assert_eq!(region.dirty_pages().count(), 0);
  }

  #[test]
  fn unchecked_commit_merges_without_instrumenting() {
    let mut region = heap(2);
    let base = region.base();

    region.open_protection();
    unsafe { write_byte(base, 0xBD) };

    region.commit_with(false);

    // The diff still lands in the master, but a lone writer's page skips the
    // word and cache line accounting entirely.
    assert_eq!(region.master()[0], 0xBD);
    assert!(region
      .word_changes()
      .iter()
      .all(|cell| cell.load(Ordering::Acquire) == 0));
    assert!(region
      .cache_invalidates()
      .iter()
      .all(|line| line.load(Ordering::Acquire) == 0));

    region.begin();
  }

  #[test]
  fn commit_preserves_bytes_written_by_others() {
    let mut region = heap(2);
    let base = region.base();

    region.open_protection();
    unsafe { write_byte(base, 0xAA) };

    // Another process committing to a byte this transaction never touched.
    region.write_shared_word(base as usize + 8, 0x4242);

    region.commit();

    assert_eq!(region.master()[0], 0xAA);
    assert_eq!(region.read_shared_word(base as usize + 8), 0x4242);

    region.begin();
  }

  #[test]
  fn refresh_discards_uncommitted_writes() {
    let mut region = heap(2);
    let base = region.base();

    region.open_protection();
    unsafe { write_byte(base, 0x77) };
    region.begin();

    assert_eq!(region.dirty_pages().count(), 0);
    assert_eq!(unsafe { ptr::read_volatile(base) }, 0);
    assert_eq!(region.master()[0], 0);
  }

  #[test]
  fn refreshed_pages_fault_again() {
    let mut region = heap(16);
    let base = region.base();
    let page_size = page::size();

    region.open_protection();
    for page_no in &[5usize, 6, 7, 9] {
      unsafe { write_byte(base.add(page_no * page_size), 0x11) };
    }
    assert_eq!(region.dirty_pages().count(), 4);

    region.begin();
    assert_eq!(region.dirty_pages().count(), 0);

    unsafe { write_byte(base.add(5 * page_size), 0x22) };
    assert_eq!(region.dirty_pages().count(), 1);

    region.begin();
  }

  #[test]
  fn consecutive_refreshes_are_idempotent() {
    let mut region = heap(2);
    let base = region.base();

    region.open_protection();
    unsafe { write_byte(base, 0x33) };
    region.commit();
    region.begin();

    let snapshot: Vec<u8> = region.master().to_vec();
    region.begin();

    assert_eq!(region.master(), &snapshot[..]);
    assert_eq!(region.dirty_pages().count(), 0);
  }

  #[test]
  fn sampling_skips_pages_with_a_single_writer() {
    let mut region = heap(2);
    let base = region.base();

    region.open_protection();
    unsafe { write_byte(base, 0x55) };

    let twins_after_enroll = region.twin_slots_available();
    region.periodic_check();

    // No temporary twin or delta buffer was bound.
    assert_eq!(region.twin_slots_available(), twins_after_enroll);
    region.begin();
  }

  #[test]
  fn sampling_binds_twins_once_a_page_becomes_shared() {
    let mut region = heap(2);
    let base = region.base();

    region.open_protection();
    unsafe { write_byte(base, 0x55) };

    let twins_after_enroll = region.twin_slots_available();

    region.fake_remote_enroll(0);
    region.periodic_check();
    assert_eq!(region.twin_slots_available(), twins_after_enroll - 2);

    // A later pass reuses the bound buffers.
    region.periodic_check();
    assert_eq!(region.twin_slots_available(), twins_after_enroll - 2);

    region.fake_remote_retract(0);
    region.begin();
  }

  #[test]
  fn aba_word_counts_its_transient_change() {
    let mut region = heap(2);
    let base = region.base();

    region.open_protection();
    unsafe { write_word(base, 1) };

    region.fake_remote_enroll(0);
    region.periodic_check();
    unsafe { write_word(base, 0) };

    region.commit();

    // Nothing to merge, but the transient flip was observed.
    assert!(region.master().iter().all(|byte| *byte == 0));
    let cell = region.word_changes()[0].load(Ordering::Acquire);
    assert_eq!(word_owner(cell), process::id());
    assert_eq!(word_version(cell), 1);

    // The pristine snapshot stayed pristine throughout.
    let (_, _, pristine) = region.dirty_pages().next().unwrap();
    assert!(pristine.iter().all(|byte| *byte == 0));

    region.fake_remote_retract(0);
    region.begin();
  }

  #[test]
  fn sampled_change_is_not_recounted_at_commit() {
    let mut region = heap(2);
    let base = region.base();

    region.open_protection();
    unsafe { write_word(base, 1) };

    region.fake_remote_enroll(0);
    region.periodic_check();
    region.periodic_check();

    region.commit();

    assert_eq!(region.read_shared_word(base as usize), 1);
    let cell = region.word_changes()[0].load(Ordering::Acquire);
    assert_eq!(word_version(cell), 1);

    region.fake_remote_retract(0);
    region.begin();
  }

  #[test]
  fn commit_counts_changes_sampling_never_saw() {
    let mut region = heap(2);
    let base = region.base();

    region.open_protection();
    unsafe { write_word(base, 1) };

    region.fake_remote_enroll(0);
    region.periodic_check();
    unsafe { write_word(base, 2) };

    region.commit();

    assert_eq!(region.read_shared_word(base as usize), 2);
    let cell = region.word_changes()[0].load(Ordering::Acquire);
    assert_eq!(word_version(cell), 2);

    region.fake_remote_retract(0);
    region.begin();
  }

  #[test]
  fn close_protection_stops_write_capture() {
    let mut region = heap(2);
    let base = region.base();

    region.open_protection();
    region.close_protection();

    unsafe { write_byte(base, 0x99) };

    assert_eq!(region.dirty_pages().count(), 0);
    assert_eq!(region.master()[0], 0x99);
  }

  #[test]
  fn globals_region_preserves_existing_contents() {
    let len = 2 * page::size();

    unsafe {
      let buffer = os::map_anon(len, false).expect("allocating globals buffer");
      ptr::write_bytes(buffer, 0x5C, 100);

      let mut region = Region::globals(buffer, len, len).expect("overlaying globals");

      assert_eq!(region.master()[0], 0x5C);
      assert_eq!(region.master()[99], 0x5C);
      assert_eq!(region.master()[100], 0);
      assert_eq!(ptr::read_volatile(buffer), 0x5C);

      region.open_protection();
      write_byte(buffer, 0x7D);
      region.commit();

      assert_eq!(region.master()[0], 0x7D);
      assert_eq!(region.master()[99], 0x5C);
      region.begin();
    }
  }

  #[test]
  fn globals_rejects_unaligned_bases() {
    let result = unsafe { Region::globals(1 as *mut u8, page::size(), 0) };
    assert!(matches!(result, Err(Error::InvalidParameter(_))));
  }

  #[test]
  fn faults_route_to_the_owning_region() {
    let mut first = heap(2);
    let mut second = heap(2);

    first.open_protection();
    second.open_protection();

    unsafe {
      write_byte(first.base(), 0x01);
      write_byte(second.base().add(page::size()), 0x02);
    }

    assert_eq!(first.dirty_pages().count(), 1);
    assert_eq!(second.dirty_pages().count(), 1);
    assert_eq!(second.dirty_pages().next().unwrap().0, 1);

    first.begin();
    second.begin();
  }

  #[test]
  fn heap_cleanup_zeroes_uninteresting_counters() {
    let mut region = heap(1);
    let base = region.base();

    // An object spanning cache lines 3..=5.
    let object = unsafe { base.add(3 * page::CACHE_LINE_SIZE) };
    let size = 3 * page::CACHE_LINE_SIZE;

    let first_word = 3 * page::WORDS_PER_CACHE_LINE;
    region.word_changes()[first_word].store(0x1_0000_0007, Ordering::Release);

    assert!(region.cleanup_heap_object(object, size));
    assert_eq!(region.word_changes()[first_word].load(Ordering::Acquire), 0);
  }

  #[test]
  fn heap_cleanup_refuses_interesting_lines() {
    let mut region = heap(1);
    let base = region.base();

    let object = unsafe { base.add(3 * page::CACHE_LINE_SIZE) };
    let size = 3 * page::CACHE_LINE_SIZE;

    let first_word = 3 * page::WORDS_PER_CACHE_LINE;
    region.word_changes()[first_word].store(0x1_0000_0007, Ordering::Release);
    region.cache_invalidates()[4].store(MIN_INVALIDATES_CARE, Ordering::Release);

    assert!(!region.cleanup_heap_object(object, size));
    assert_ne!(region.word_changes()[first_word].load(Ordering::Acquire), 0);
    assert_eq!(
      region.cache_invalidates()[4].load(Ordering::Acquire),
      MIN_INVALIDATES_CARE
    );
  }

  #[test]
  fn finalize_exposes_the_region_to_the_reporter() {
    struct Probe {
      lines: usize,
      words: usize,
      end: usize,
      first_byte: u8,
    }

    impl Reporter for Probe {
      fn check_objects(&mut self, view: &RegionView<'_>) {
        assert_eq!(view.kind, RegionKind::Heap);
        self.lines = view.cache_invalidates.len();
        self.words = view.word_changes.len();
        self.end = view.end;
        self.first_byte = view.master[0];
      }
    }

    let mut region = heap(2);
    let base = region.base();

    region.open_protection();
    unsafe { write_byte(base, 0xC3) };
    region.commit();

    let mut probe = Probe {
      lines: 0,
      words: 0,
      end: 0,
      first_byte: 0,
    };
    region.finalize(base as usize + 128, &mut probe);

    assert_eq!(probe.lines, region.len() / page::CACHE_LINE_SIZE);
    assert_eq!(probe.words, region.len() / page::WORD_SIZE);
    assert_eq!(probe.end, base as usize + 128);
    assert_eq!(probe.first_byte, 0xC3);

    region.begin();
  }
}
