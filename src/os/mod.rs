#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use self::unix::*;

#[cfg(not(unix))]
compile_error!("this crate is built on mmap/mprotect/madvise semantics and requires a Unix target");
