//! Write-capture fault wiring.
//!
//! Installs a process-wide SIGSEGV action that routes faults landing inside a
//! registered region to that region's write-capture path, and forwards
//! everything else to whichever action was installed before ours.

use crate::region::RegionInner;
use crate::{os, Error, Result};
use libc::{c_int, c_void, siginfo_t};
use std::mem::{self, MaybeUninit};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

/// Upper bound on concurrently registered regions.
const MAX_REGIONS: usize = 32;

struct Slot {
  base: AtomicUsize,
  end: AtomicUsize,
  inner: AtomicUsize,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: Slot = Slot {
  base: AtomicUsize::new(0),
  end: AtomicUsize::new(0),
  inner: AtomicUsize::new(0),
};

/// Region lookup table walked by the fault handler.
///
/// Plain atomics instead of a locked map: the handler must never block, and a
/// half-registered slot is harmless since its empty address range matches no
/// fault.
static SLOTS: [Slot; MAX_REGIONS] = [EMPTY_SLOT; MAX_REGIONS];

static INSTALL: Once = Once::new();
static mut OLD_ACTION: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();

/// Installs the fault handler, once per process.
pub(crate) fn init() {
  INSTALL.call_once(|| unsafe {
    let mut action: libc::sigaction = mem::zeroed();
    libc::sigemptyset(&mut action.sa_mask);
    action.sa_sigaction = capture_fault as usize;
    action.sa_flags = libc::SA_SIGINFO;

    if libc::sigaction(libc::SIGSEGV, &action, OLD_ACTION.as_mut_ptr()) != 0 {
      os::fatal("twinmap: failed to install the fault handler");
    }

    // Apple Silicon reports faults on protected mappings as SIGBUS.
    #[cfg(target_os = "macos")]
    if libc::sigaction(libc::SIGBUS, &action, std::ptr::null_mut()) != 0 {
      os::fatal("twinmap: failed to install the fault handler");
    }
  });
}

/// Makes `[base, base + len)` route write faults to `inner`.
pub(crate) fn register(inner: *mut RegionInner, base: usize, len: usize) -> Result<()> {
  for slot in &SLOTS {
    if slot
      .inner
      .compare_exchange(0, inner as usize, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      slot.base.store(base, Ordering::Release);
      slot.end.store(base + len, Ordering::Release);
      return Ok(());
    }
  }

  Err(Error::RegistryFull)
}

/// Retracts a region from fault routing.
pub(crate) fn unregister(inner: *mut RegionInner) {
  for slot in &SLOTS {
    if slot.inner.load(Ordering::Acquire) == inner as usize {
      // Empty the range before freeing the slot, so the handler can never
      // observe a claimed slot with a stale range.
      slot.base.store(0, Ordering::Release);
      slot.end.store(0, Ordering::Release);
      slot.inner.store(0, Ordering::Release);
      return;
    }
  }
}

unsafe extern "C" fn capture_fault(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
  let address = (*info).si_addr() as usize;

  for slot in &SLOTS {
    let base = slot.base.load(Ordering::Acquire);
    let end = slot.end.load(Ordering::Acquire);

    if address < base || address >= end {
      continue;
    }

    let inner = slot.inner.load(Ordering::Acquire) as *mut RegionInner;
    if !inner.is_null() {
      (*inner).handle_write(address);
      return;
    }
  }

  forward(signal, info, context);
}

/// Forwards a fault we do not own to the previously installed action.
unsafe fn forward(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
  let action = OLD_ACTION.assume_init();
  let handler = action.sa_sigaction;

  if handler == libc::SIG_DFL {
    // Restore the default action; the kernel re-raises when we return.
    let mut default: libc::sigaction = mem::zeroed();
    libc::sigemptyset(&mut default.sa_mask);
    default.sa_sigaction = libc::SIG_DFL;
    libc::sigaction(signal, &default, std::ptr::null_mut());
    return;
  }

  if handler == libc::SIG_IGN {
    return;
  }

  if action.sa_flags & libc::SA_SIGINFO != 0 {
    let callback: unsafe extern "C" fn(c_int, *mut siginfo_t, *mut c_void) = mem::transmute(handler);
    callback(signal, info, context);
  } else {
    let callback: unsafe extern "C" fn(c_int) = mem::transmute(handler);
    callback(signal);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // The registry is pure bookkeeping until `init` installs the handler, so
  // placeholder pointers and ranges are safe here as long as nothing faults
  // inside them.
  #[test]
  fn registry_recycles_slots() -> Result<()> {
    let first = 0x1000 as *mut RegionInner;
    let second = 0x2000 as *mut RegionInner;

    register(first, 0x1000, 0x1000)?;
    register(second, 0x2000, 0x1000)?;

    unregister(first);
    register(first, 0x1000, 0x1000)?;

    unregister(first);
    unregister(second);
    Ok(())
  }

  #[test]
  fn unregistering_an_unknown_region_is_harmless() {
    unregister(0x3000 as *mut RegionInner);
  }
}
