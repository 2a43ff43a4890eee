use crate::{Error, Protection, Result};
use libc::{c_char, c_int, c_void};
use std::os::unix::io::RawFd;

impl Protection {
  fn to_native(self) -> c_int {
    let mut result = libc::PROT_NONE;

    if self.contains(Protection::READ) {
      result |= libc::PROT_READ;
    }

    if self.contains(Protection::WRITE) {
      result |= libc::PROT_WRITE;
    }

    result
  }
}

pub fn page_size() -> usize {
  unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Creates an unlinked temporary file of exactly `len` bytes.
///
/// The file has no name by the time this function returns; the descriptor is
/// the only handle to it, and the kernel reclaims it once every mapping and
/// descriptor referring to it is gone.
pub fn temp_file(len: usize) -> Result<RawFd> {
  let mut template = *b"/tmp/twinmap.XXXXXX\0";

  unsafe {
    let fd = libc::mkstemp(template.as_mut_ptr() as *mut c_char);
    if fd < 0 {
      return Err(Error::SystemCall(errno::errno()));
    }

    libc::unlink(template.as_ptr() as *const c_char);

    if libc::ftruncate(fd, len as libc::off_t) != 0 {
      let error = errno::errno();
      libc::close(fd);
      return Err(Error::SystemCall(error));
    }

    Ok(fd)
  }
}

/// Maps `len` bytes of `fd`, optionally at a fixed address.
///
/// A fixed mapping silently replaces whatever was mapped at the target range
/// before, which is exactly what the protection toggles rely upon.
pub unsafe fn map_file(
  address: Option<usize>,
  len: usize,
  protection: Protection,
  shared: bool,
  fd: RawFd,
) -> Result<*mut u8> {
  let mut flags = if shared { libc::MAP_SHARED } else { libc::MAP_PRIVATE };
  if address.is_some() {
    flags |= libc::MAP_FIXED;
  }

  let address = libc::mmap(
    address.unwrap_or(0) as *mut c_void,
    len,
    protection.to_native(),
    flags,
    fd,
    0,
  );

  if address == libc::MAP_FAILED {
    Err(Error::SystemCall(errno::errno()))
  } else {
    Ok(address as *mut u8)
  }
}

/// Maps `len` bytes of zero-initialized anonymous memory.
pub unsafe fn map_anon(len: usize, shared: bool) -> Result<*mut u8> {
  let visibility = if shared { libc::MAP_SHARED } else { libc::MAP_PRIVATE };

  let address = libc::mmap(
    std::ptr::null_mut(),
    len,
    libc::PROT_READ | libc::PROT_WRITE,
    visibility | libc::MAP_ANON,
    -1,
    0,
  );

  if address == libc::MAP_FAILED {
    Err(Error::SystemCall(errno::errno()))
  } else {
    Ok(address as *mut u8)
  }
}

pub unsafe fn unmap(address: *mut u8, len: usize) -> Result<()> {
  match libc::munmap(address as *mut c_void, len) {
    0 => Ok(()),
    _ => Err(Error::SystemCall(errno::errno())),
  }
}

pub unsafe fn protect(address: usize, len: usize, protection: Protection) -> Result<()> {
  match libc::mprotect(address as *mut c_void, len, protection.to_native()) {
    0 => Ok(()),
    _ => Err(Error::SystemCall(errno::errno())),
  }
}

/// Discards the process-private contents of `[address, address + len)`.
///
/// Subsequent reads observe the backing object's current state instead.
pub unsafe fn discard(address: usize, len: usize) -> Result<()> {
  match libc::madvise(address as *mut c_void, len, libc::MADV_DONTNEED) {
    0 => Ok(()),
    _ => Err(Error::SystemCall(errno::errno())),
  }
}

pub fn close(fd: RawFd) {
  unsafe { libc::close(fd) };
}

/// Writes a diagnostic to stderr and aborts the process.
///
/// Restricted to async-signal-safe calls so it may run from a fault handler.
pub fn fatal(message: &str) -> ! {
  unsafe {
    let _ = libc::write(2, message.as_ptr() as *const c_void, message.len());
    let _ = libc::write(2, b"\n".as_ptr() as *const c_void, 1);
    libc::abort();
  }
}
