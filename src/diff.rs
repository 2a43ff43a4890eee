//! Byte-masked merging of modified pages into their backing store.
//!
//! The merge primitives copy a byte from the local copy into the destination
//! only where it differs from the twin snapshot. Bytes that match the twin
//! are never stored, so concurrent merges by other processes into the same
//! destination page survive as long as the processes modified disjoint bytes.

use crate::page::WORD_SIZE;

/// Merges every byte of `local` that differs from `twin` into `dest`.
///
/// # Safety
///
/// All three pointers must reference `len` readable bytes, `dest` writable.
pub unsafe fn merge(dest: *mut u8, local: *const u8, twin: *const u8, len: usize) {
  #[cfg(target_arch = "x86_64")]
  merge_sse2(dest, local, twin, len);

  #[cfg(not(target_arch = "x86_64"))]
  merge_scalar(dest, local, twin, len);
}

/// Lane-at-a-time merge: a byte-wise equality compare yields a mask of
/// differing bytes, and a masked store writes only those.
#[cfg(target_arch = "x86_64")]
unsafe fn merge_sse2(dest: *mut u8, local: *const u8, twin: *const u8, len: usize) {
  use std::arch::x86_64::*;

  const LANE: usize = 16;

  let mut offset = 0;
  while offset + LANE <= len {
    let local_lane = _mm_loadu_si128(local.add(offset) as *const __m128i);
    let twin_lane = _mm_loadu_si128(twin.add(offset) as *const __m128i);

    let equal = _mm_cmpeq_epi8(local_lane, twin_lane);
    let differs = _mm_xor_si128(equal, _mm_set1_epi8(-1));

    if _mm_movemask_epi8(differs) != 0 {
      _mm_maskmoveu_si128(local_lane, differs, dest.add(offset) as *mut i8);
    }

    offset += LANE;
  }

  merge_scalar(dest.add(offset), local.add(offset), twin.add(offset), len - offset);
}

/// Word-scan fallback: whole words are compared first so unmodified words
/// cost a single load each, and only the differing bytes of a modified word
/// are stored.
unsafe fn merge_scalar(dest: *mut u8, local: *const u8, twin: *const u8, len: usize) {
  let words = len / WORD_SIZE;

  for word in 0..words {
    let local_word = (local as *const usize).add(word).read_unaligned();
    let twin_word = (twin as *const usize).add(word).read_unaligned();

    if local_word != twin_word {
      let offset = word * WORD_SIZE;
      merge_bytes(dest.add(offset), local.add(offset), twin.add(offset), WORD_SIZE);
    }
  }

  let tail = words * WORD_SIZE;
  merge_bytes(dest.add(tail), local.add(tail), twin.add(tail), len - tail);
}

/// Merges one machine word at word index `word` of a page.
///
/// A fully rewritten word is published with a single word-wide store, so
/// readers never observe a half-merged word in that case.
pub unsafe fn merge_word(dest: *mut u8, local: *const u8, twin: *const u8, word: usize) {
  let offset = word * WORD_SIZE;
  let local_word = (local.add(offset) as *const usize).read_unaligned();
  let twin_word = (twin.add(offset) as *const usize).read_unaligned();

  if local_word == twin_word {
    return;
  }

  let differing = (0..WORD_SIZE)
    .filter(|index| local.add(offset + index).read() != twin.add(offset + index).read())
    .count();

  if differing == WORD_SIZE {
    (dest.add(offset) as *mut usize).write_unaligned(local_word);
  } else {
    merge_bytes(dest.add(offset), local.add(offset), twin.add(offset), WORD_SIZE);
  }
}

unsafe fn merge_bytes(dest: *mut u8, local: *const u8, twin: *const u8, len: usize) {
  for index in 0..len {
    let byte = local.add(index).read();
    if byte != twin.add(index).read() {
      dest.add(index).write(byte);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // Deterministic byte patterns without pulling in an RNG.
  fn pattern(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed;
    (0..len)
      .map(|_| {
        state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        (state >> 56) as u8
      })
      .collect()
  }

  fn scalar_merge(dest: &mut [u8], local: &[u8], twin: &[u8]) {
    unsafe { merge_scalar(dest.as_mut_ptr(), local.as_ptr(), twin.as_ptr(), dest.len()) };
  }

  #[test]
  fn merge_copies_only_differing_bytes() {
    let twin = pattern(1, 256);
    let mut local = twin.clone();
    local[0] = !local[0];
    local[17] = !local[17];
    local[255] = !local[255];

    // A destination deliberately different from the twin: positions the
    // merge has no business writing must keep their sentinel value.
    let mut dest = vec![0xEE; 256];
    unsafe { merge(dest.as_mut_ptr(), local.as_ptr(), twin.as_ptr(), 256) };

    for index in 0..256 {
      if local[index] != twin[index] {
        assert_eq!(dest[index], local[index], "byte {} must be merged", index);
      } else {
        assert_eq!(dest[index], 0xEE, "byte {} must not be written", index);
      }
    }
  }

  #[test]
  fn merge_handles_unaligned_tails() {
    for len in &[8, 24, 40, 100, 120] {
      let twin = pattern(2, *len);
      let local = pattern(3, *len);

      let mut dest = vec![0xEE; *len];
      unsafe { merge(dest.as_mut_ptr(), local.as_ptr(), twin.as_ptr(), *len) };

      for index in 0..*len {
        let expected = if local[index] != twin[index] { local[index] } else { 0xEE };
        assert_eq!(dest[index], expected);
      }
    }
  }

  #[cfg(target_arch = "x86_64")]
  #[test]
  fn vector_and_scalar_merges_agree() {
    let twin = pattern(4, 4096);
    let mut local = twin.clone();
    for index in (0..4096).step_by(7) {
      local[index] = local[index].wrapping_add(1);
    }

    let mut vector_dest = pattern(5, 4096);
    let mut scalar_dest = vector_dest.clone();

    unsafe { merge_sse2(vector_dest.as_mut_ptr(), local.as_ptr(), twin.as_ptr(), 4096) };
    scalar_merge(&mut scalar_dest, &local, &twin);

    assert_eq!(vector_dest, scalar_dest);
  }

  #[test]
  fn fully_rewritten_word_is_stored_whole() {
    let twin = vec![0u8; 64];
    let mut local = vec![0u8; 64];
    for byte in local.iter_mut().take(WORD_SIZE) {
      *byte = 0xAB;
    }

    let mut dest = vec![0xEE; 64];
    unsafe { merge_word(dest.as_mut_ptr(), local.as_ptr(), twin.as_ptr(), 0) };

    assert_eq!(&dest[..WORD_SIZE], &local[..WORD_SIZE]);
    assert!(dest[WORD_SIZE..].iter().all(|byte| *byte == 0xEE));
  }

  #[test]
  fn unchanged_word_is_left_alone() {
    let twin = pattern(6, 64);
    let local = twin.clone();

    let mut dest = vec![0xEE; 64];
    unsafe { merge_word(dest.as_mut_ptr(), local.as_ptr(), twin.as_ptr(), 2) };

    assert!(dest.iter().all(|byte| *byte == 0xEE));
  }
}
