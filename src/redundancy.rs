//! Redundancy predicates for deterministic-stage deduplication
//!
//! The deterministic stages run in a fixed order: walking bit flips, then
//! ± arithmetics, then interesting-value substitutions. Later stages prune
//! any candidate an earlier stage already produced, so every executed
//! candidate is unique modulo the finite windows these predicates model.
//! All three predicates are pure and operate on values already loaded from
//! the buffer, in native (little-endian) order.

/// Values worth planting in a single byte.
pub const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];

/// Values worth planting in a 16-bit word (includes the 8-bit set).
pub const INTERESTING_16: [i16; 19] = [
    -128, -1, 0, 1, 16, 32, 64, 100, 127, -32768, -129, 128, 255, 256, 512, 1000, 1024, 4096,
    32767,
];

/// Values worth planting in a 32-bit word (includes the 16-bit set).
pub const INTERESTING_32: [i32; 27] = [
    -128,
    -1,
    0,
    1,
    16,
    32,
    64,
    100,
    127,
    -32768,
    -129,
    128,
    255,
    256,
    512,
    1000,
    1024,
    4096,
    32767,
    -2147483648,
    -100663046,
    -32769,
    32768,
    65535,
    65536,
    100663045,
    2147483647,
];

use crate::ARITH_MAX;

/// True if `xor` (old ^ new) could be the product of a walking bit flip.
///
/// 1-, 2- and 4-bit runs match at any bit position; 8/16/32-bit runs only
/// at byte-aligned positions, matching the stepover of the byte-wide flips.
/// `xor == 0` also returns true: the values are identical and executing
/// the candidate would be a waste.
pub fn could_be_bitflip(xor: u32) -> bool {
    if xor == 0 {
        return true;
    }

    let sh = xor.trailing_zeros();
    let val = xor >> sh;

    if val == 1 || val == 3 || val == 15 {
        return true;
    }

    if sh & 7 != 0 {
        return false;
    }

    val == 0xff || val == 0xffff || val == 0xffff_ffff
}

/// True if `new` is reachable from `old` by a ± adjustment of at most
/// [`ARITH_MAX`] on one byte, word or dword window of `byte_len` bytes
/// (both endian orderings for widths of two and four).
pub fn could_be_arith(old: u32, new: u32, byte_len: usize) -> bool {
    if old == new {
        return true;
    }

    // One-byte adjustments anywhere in the window.
    let mut diffs = 0u32;
    let mut ov = 0u8;
    let mut nv = 0u8;
    for i in 0..byte_len {
        let a = (old >> (8 * i)) as u8;
        let b = (new >> (8 * i)) as u8;
        if a != b {
            diffs += 1;
            ov = a;
            nv = b;
        }
    }

    if diffs == 1 && (ov.wrapping_sub(nv) as u32 <= ARITH_MAX || nv.wrapping_sub(ov) as u32 <= ARITH_MAX)
    {
        return true;
    }

    if byte_len == 1 {
        return false;
    }

    // Two-byte adjustments, both endians.
    let mut diffs = 0u32;
    let mut ov = 0u16;
    let mut nv = 0u16;
    for i in 0..byte_len / 2 {
        let a = (old >> (16 * i)) as u16;
        let b = (new >> (16 * i)) as u16;
        if a != b {
            diffs += 1;
            ov = a;
            nv = b;
        }
    }

    if diffs == 1 {
        if ov.wrapping_sub(nv) as u32 <= ARITH_MAX || nv.wrapping_sub(ov) as u32 <= ARITH_MAX {
            return true;
        }
        let (ov, nv) = (ov.swap_bytes(), nv.swap_bytes());
        if ov.wrapping_sub(nv) as u32 <= ARITH_MAX || nv.wrapping_sub(ov) as u32 <= ARITH_MAX {
            return true;
        }
    }

    // Dword adjustments, both endians.
    if byte_len == 4 {
        if old.wrapping_sub(new) <= ARITH_MAX || new.wrapping_sub(old) <= ARITH_MAX {
            return true;
        }
        let (old, new) = (old.swap_bytes(), new.swap_bytes());
        if old.wrapping_sub(new) <= ARITH_MAX || new.wrapping_sub(old) <= ARITH_MAX {
            return true;
        }
    }

    false
}

/// True if `new` equals `old` with an aligned overwrite by one of the
/// interesting-value tables over a `byte_len`-byte window.
///
/// `check_be` is set when the caller already executed the little-endian
/// substitution for this width and is asking about the byte-swapped
/// variant; the scan then also covers the wider windows that only the BE
/// pass would reach.
pub fn could_be_interest(old: u32, new: u32, byte_len: usize, check_be: bool) -> bool {
    if old == new {
        return true;
    }

    // One-byte plants anywhere in the window.
    for i in 0..byte_len {
        for &v in INTERESTING_8.iter() {
            let tval = (old & !(0xffu32 << (i * 8))) | ((v as u8 as u32) << (i * 8));
            if new == tval {
                return true;
            }
        }
    }

    // The two-byte scan below only matters as preparation for BE attempts
    // when the window itself is two bytes wide.
    if byte_len == 2 && !check_be {
        return false;
    }

    for i in 0..byte_len.saturating_sub(1) {
        for &v in INTERESTING_16.iter() {
            let tval = (old & !(0xffffu32 << (i * 8))) | ((v as u16 as u32) << (i * 8));
            if new == tval {
                return true;
            }

            if byte_len > 2 {
                let tval =
                    (old & !(0xffffu32 << (i * 8))) | (((v as u16).swap_bytes() as u32) << (i * 8));
                if new == tval {
                    return true;
                }
            }
        }
    }

    if byte_len == 4 && check_be {
        for &v in INTERESTING_32.iter() {
            if new == v as u32 {
                return true;
            }
        }
    }

    false
}
