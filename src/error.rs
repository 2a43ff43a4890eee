//! Error types and utilities.

use failure::Fail;

/// The result type used by this library.
pub type Result<T> = std::result::Result<T, Error>;

/// A collection of possible errors.
#[derive(Debug, Fail)]
pub enum Error {
  /// A supplied parameter is invalid.
  #[fail(display = "invalid parameter: {}", _0)]
  InvalidParameter(&'static str),
  /// No free slot is left in the process-wide region registry.
  #[fail(display = "region registry is full")]
  RegistryFull,
  /// A system call failed.
  #[fail(display = "system call failed with: {}", _0)]
  SystemCall(::errno::Errno),
}
