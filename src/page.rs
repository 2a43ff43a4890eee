//! Page, word and cache line arithmetic.

use crate::os;
use std::sync::Once;

/// Size in bytes of a machine word.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Span in bytes of one cache line.
pub const CACHE_LINE_SIZE: usize = 64;

/// Number of machine words covered by one cache line.
pub const WORDS_PER_CACHE_LINE: usize = CACHE_LINE_SIZE / WORD_SIZE;

/// Returns the operating system's page size.
///
/// This function uses an internally cached page size, and can be called
/// repeatedly without incurring a significant performance penalty.
///
/// # Examples
///
/// ```
/// # use twinmap::page;
/// let size = page::size(); // Most likely 4096
/// ```
#[inline]
pub fn size() -> usize {
  static INIT: Once = Once::new();
  static mut PAGE_SIZE: usize = 0;

  unsafe {
    INIT.call_once(|| PAGE_SIZE = os::page_size());
    PAGE_SIZE
  }
}

/// Rounds an address down to its closest page boundary.
#[inline]
pub fn floor(address: usize) -> usize {
  address & !(size() - 1)
}

/// Rounds an address up to its closest page boundary.
#[inline]
pub fn ceil(address: usize) -> usize {
  let page_size = size();
  address
    .checked_add(page_size - 1)
    .map(|address| address & !(page_size - 1))
    .unwrap_or_else(|| floor(address))
}

/// Returns the number of machine words spanned by one page.
#[inline]
pub fn words() -> usize {
  size() / WORD_SIZE
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn page_size_is_reasonable() {
    let pz = size();

    assert!(pz > 0);
    assert_eq!(pz % 2, 0);
    assert_eq!(pz, size());
  }

  #[test]
  fn page_rounding_works() {
    let pz = size();

    assert_eq!(floor(1), 0);
    assert_eq!(floor(pz), pz);
    assert_eq!(floor(pz + 1), pz);

    assert_eq!(ceil(0), 0);
    assert_eq!(ceil(1), pz);
    assert_eq!(ceil(pz), pz);
    assert_eq!(ceil(pz + 1), pz * 2);
    assert_eq!(ceil(usize::max_value()) % pz, 0);
  }

  #[test]
  fn line_arithmetic_is_consistent() {
    assert_eq!(WORDS_PER_CACHE_LINE * WORD_SIZE, CACHE_LINE_SIZE);
    assert_eq!(words() * WORD_SIZE, size());
    assert_eq!(size() % CACHE_LINE_SIZE, 0);
  }
}
