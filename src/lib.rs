#![deny(missing_docs, nonstandard_style)]
//! Page-protected shared memory regions with false-sharing instrumentation.
//!
//! This crate provides the memory substrate for running the "threads" of a
//! program as isolated processes that share a common backing file. A
//! [`Region`] maps that file twice: a *master* view holding the committed
//! state, and a *working* view the program actually reads and writes. While
//! write capture is armed, the working view is private and read-only, so the
//! first write to each page traps, gets snapshotted against a pristine twin
//! page, and joins the transaction's write-set. At the next synchronization
//! boundary the byte-level diff of every dirty page is merged back into the
//! master, and the pages are discarded and reprotected for the next
//! transaction.
//!
//! Alongside the merge, the runtime keeps per-word change cells and
//! per-cache-line invalidation counts shared by all worker processes. Cache
//! lines that keep bouncing between different writers are exactly the ones a
//! false-sharing [`Reporter`] wants to hear about.
//!
//! # Examples
//!
//! ```no_run
//! # fn main() -> twinmap::Result<()> {
//! let mut region = twinmap::Region::heap(0x10000)?;
//!
//! // Arm write capture; the program now works through region.base().
//! region.open_protection();
//!
//! // ... at every synchronization boundary:
//! region.periodic_check();
//! region.commit();
//! region.begin();
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//!
//! This crate only builds for Unix targets, since the write-capture
//! discipline is built from `mmap`, `mprotect`, `madvise` and SIGSEGV
//! semantics. Regions are shared across cooperating processes but are not
//! durable; the backing file is unlinked at creation and vanishes with the
//! last process.

#[macro_use]
extern crate bitflags;

pub use crate::counters::{word_owner, word_version, MIN_INVALIDATES_CARE, SHARED_MARK};
pub use crate::error::{Error, Result};
pub use crate::region::Region;
pub use crate::tracker::{RegionKind, RegionView, Reporter};

mod counters;
mod diff;
mod error;
mod fault;
mod os;
pub mod page;
mod pool;
mod region;
mod tracker;

bitflags! {
  /// A bitflag of zero or more protection attributes.
  ///
  /// Determines the access rights for the pages of a mapping. Execute
  /// permission never applies to data regions, so it is not represented.
  pub struct Protection: usize {
    /// No access allowed at all.
    const NONE = 0;
    /// Read access; writing data will fault.
    const READ = (1 << 1);
    /// Write access.
    const WRITE = (1 << 2);
    /// Read and write shorthand.
    const READ_WRITE = (Self::READ.bits | Self::WRITE.bits);
  }
}
