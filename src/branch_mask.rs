//! Per-byte branch mask: which positions a mutation may touch
//!
//! In rare-branch mode every mutation must leave the target branch on the
//! execution path. The deterministic stage classifies each byte of the
//! input by probing the target (flip it, delete it, insert before it) and
//! records the verdicts here; havoc then samples its mutation positions
//! only from the permitted set.
//!
//! The mask is a first-class value: three parallel flag vectors instead of
//! a packed bitfield array. `overwrite` and `delete` cover the data bytes
//! `0..len`; `insert` has one extra slot so appending at `len` stays
//! expressible. Size-changing mutations resize all three in lockstep:
//! regions inserted by havoc default to fully permissive, and removal
//! keeps the trailing insert slot alive.

use rand::Rng;

/// What a mutation wants to do at a position.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MaskKind {
    /// Replace bytes in place.
    Overwrite,
    /// Remove bytes.
    Delete,
    /// Insert before the position.
    Insert,
}

/// Three-flag per-byte mask over an input buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchMask {
    overwrite: Vec<bool>,
    delete: Vec<bool>,
    /// One slot longer than the data; the last slot permits appending.
    insert: Vec<bool>,
}

impl BranchMask {
    /// A mask that permits everything: all flags set, with the trailing
    /// slot insert-only by construction.
    pub fn permissive(len: usize) -> Self {
        Self {
            overwrite: vec![true; len],
            delete: vec![true; len],
            insert: vec![true; len + 1],
        }
    }

    /// A mask with no permissions yet; the deterministic stage fills it in
    /// by probing the target branch.
    pub fn building(len: usize) -> Self {
        Self {
            overwrite: vec![false; len],
            delete: vec![false; len],
            insert: vec![false; len + 1],
        }
    }

    /// Data length covered (the insert vector is one longer).
    #[inline]
    pub fn len(&self) -> usize {
        self.overwrite.len()
    }

    /// True when no data bytes are covered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.overwrite.is_empty()
    }

    /// Grant a permission at `idx`.
    pub fn set(&mut self, kind: MaskKind, idx: usize) {
        match kind {
            MaskKind::Overwrite => self.overwrite[idx] = true,
            MaskKind::Delete => self.delete[idx] = true,
            MaskKind::Insert => self.insert[idx] = true,
        }
    }

    /// Check a permission at `idx`.
    #[inline]
    pub fn allows(&self, kind: MaskKind, idx: usize) -> bool {
        match kind {
            MaskKind::Overwrite => self.overwrite[idx],
            MaskKind::Delete => self.delete[idx],
            MaskKind::Insert => self.insert[idx],
        }
    }

    /// True if every byte of `start..start + width` may be overwritten.
    pub fn allows_overwrite_run(&self, start: usize, width: usize) -> bool {
        start + width <= self.len() && self.overwrite[start..start + width].iter().all(|&b| b)
    }

    /// Collect every byte position that starts a `width`-byte window lying
    /// entirely inside one permitted run.
    fn window_starts(&self, kind: MaskKind, width: usize) -> Vec<usize> {
        debug_assert!(width >= 1);
        let flags = match kind {
            MaskKind::Overwrite => &self.overwrite,
            MaskKind::Delete => &self.delete,
            MaskKind::Insert => unreachable!("insert positions are slots, not windows"),
        };

        let mut out = Vec::new();
        let mut run_start = None;
        for i in 0..=flags.len() {
            let set = i < flags.len() && flags[i];
            match (set, run_start) {
                (true, None) => run_start = Some(i),
                (false, Some(start)) => {
                    if i >= start + width {
                        out.extend(start..=i - width);
                    }
                    run_start = None;
                }
                _ => {}
            }
        }
        out
    }

    /// Uniformly pick a byte position where a `width`-byte write or
    /// deletion fits inside one permitted run. `None` if no window fits.
    pub fn random_window_position<R: Rng>(
        &self,
        rng: &mut R,
        kind: MaskKind,
        width: usize,
    ) -> Option<usize> {
        let starts = self.window_starts(kind, width);
        if starts.is_empty() {
            None
        } else {
            Some(starts[rng.gen_range(0..starts.len())])
        }
    }

    /// Uniformly pick a bit position inside an overwrite-permitted byte.
    pub fn random_bit_position<R: Rng>(&self, rng: &mut R) -> Option<usize> {
        let byte = self.random_window_position(rng, MaskKind::Overwrite, 1)?;
        Some(byte * 8 + rng.gen_range(0..8))
    }

    /// Uniformly pick an insert slot in `0..=len`. `None` if insertion is
    /// nowhere permitted.
    pub fn random_insert_position<R: Rng>(&self, rng: &mut R) -> Option<usize> {
        let slots: Vec<usize> = (0..self.insert.len()).filter(|&i| self.insert[i]).collect();
        if slots.is_empty() {
            None
        } else {
            Some(slots[rng.gen_range(0..slots.len())])
        }
    }

    /// Grow the mask for `n` bytes inserted at `at`; the new region is
    /// fully permissive, the old flags (sentinel included) shift right.
    pub fn splice_in(&mut self, at: usize, n: usize) {
        debug_assert!(at <= self.len());
        self.overwrite.splice(at..at, std::iter::repeat(true).take(n));
        self.delete.splice(at..at, std::iter::repeat(true).take(n));
        self.insert.splice(at..at, std::iter::repeat(true).take(n));
    }

    /// Shrink the mask for `n` bytes removed at `at`; the tail (sentinel
    /// included) shifts left.
    pub fn remove(&mut self, at: usize, n: usize) {
        debug_assert!(at + n <= self.len());
        self.overwrite.drain(at..at + n);
        self.delete.drain(at..at + n);
        self.insert.drain(at..at + n);
    }
}
