//! Attribution reporter interface.

use std::sync::atomic::{AtomicU32, AtomicU64};

/// Origin of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
  /// Created empty, backing dynamic allocations.
  Heap,
  /// Overlaid on an existing address range holding program globals.
  Globals,
}

/// Read-only view of one region handed to the attribution reporter.
///
/// The byte view reflects the shared master, not any process-private working
/// copy. Counter cells may still move while a report runs; a reporter that
/// wants a stable picture runs after the workers have quiesced.
pub struct RegionView<'a> {
  /// Origin of the region.
  pub kind: RegionKind,
  /// Public base address of the region.
  pub base: usize,
  /// Region length in bytes.
  pub len: usize,
  /// One past the last address in use (heap break, or end of the globals).
  pub end: usize,
  /// The committed bytes of the region.
  pub master: &'a [u8],
  /// Cross-process invalidation counts, one per cache line.
  pub cache_invalidates: &'a [AtomicU32],
  /// Packed (owner, version) change cells, one per machine word.
  pub word_changes: &'a [AtomicU64],
}

/// Consumer of per-region sharing reports.
///
/// Implementations own all attribution heuristics; the runtime only promises
/// the counter arrays and the byte view handed over here.
pub trait Reporter {
  /// Inspects a finalized region.
  fn check_objects(&mut self, view: &RegionView<'_>);
}
