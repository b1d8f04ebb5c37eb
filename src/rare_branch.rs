//! Rare-branch selection over the campaign-wide hit counters
//!
//! A branch is *rare* when the most significant bit of its cumulative hit
//! count sits below `rare_branch_exp`. The exponent adapts in both
//! directions: it drops when strictly rarer branches appear (so only the
//! rarest tier is kept) and rises when nothing qualifies anymore. Branches
//! for which a whole mutation cycle produced no branch-preserving input
//! are blacklisted and never offered again.

use tracing::debug;

use crate::BranchId;

/// Floor of log2 for a non-zero count.
#[inline]
fn highest_order_bit(hits: u64) -> u32 {
    debug_assert!(hits > 0);
    63 - hits.leading_zeros()
}

/// Selector state: the adaptive rarity exponent and the blacklist.
#[derive(Clone, Debug)]
pub struct RareBranchState {
    /// Branches with `floor(log2(hits)) < exp` are rare.
    exp: u32,
    /// Cap on the candidate list per scan.
    max_rare_branches: usize,
    blacklist: Vec<BranchId>,
}

impl RareBranchState {
    /// Start with the configured exponent and an empty blacklist.
    pub fn new(initial_exp: u32, max_rare_branches: usize) -> Self {
        Self {
            exp: initial_exp,
            max_rare_branches: max_rare_branches.max(2),
            blacklist: Vec::new(),
        }
    }

    /// Current rarity exponent.
    #[inline]
    pub fn exponent(&self) -> u32 {
        self.exp
    }

    /// Branches given up on.
    pub fn blacklist(&self) -> &[BranchId] {
        &self.blacklist
    }

    /// Record a branch as hopeless; skipped by every later scan.
    pub fn blacklist_add(&mut self, branch: BranchId) {
        if !self.is_blacklisted(branch) {
            debug!(branch = branch.as_usize(), "blacklisting branch");
            self.blacklist.push(branch);
        }
    }

    /// True if `branch` was given up on.
    pub fn is_blacklisted(&self, branch: BranchId) -> bool {
        self.blacklist.contains(&branch)
    }

    /// Scan the hit counters for the rarest tier of branches.
    ///
    /// Adjusts the exponent as described in the module docs. The retry
    /// after raising the exponent is a loop bounded by the bitwidth of the
    /// hit counter, so termination is structural.
    pub fn lowest_hit_branches(&mut self, hit_bits: &[u64]) -> Vec<BranchId> {
        for _ in 0..=u64::BITS {
            let mut out: Vec<BranchId> = Vec::new();
            let mut lowest_hob: Option<u32> = None;

            for (i, &hits) in hit_bits.iter().enumerate() {
                if out.len() + 1 >= self.max_rare_branches {
                    break;
                }
                if hits == 0 || self.is_blacklisted(BranchId(i)) {
                    continue;
                }

                let hob = highest_order_bit(hits);
                lowest_hob = Some(lowest_hob.map_or(hob, |l| l.min(hob)));

                if hob < self.exp {
                    if hob + 1 < self.exp {
                        // A strictly rarer branch demotes everything seen
                        // so far and tightens the exponent.
                        self.exp = hob + 1;
                        out.clear();
                    }
                    out.push(BranchId(i));
                }
            }

            if !out.is_empty() {
                return out;
            }

            match lowest_hob {
                Some(l) => {
                    self.exp = l + 1;
                    debug_assert!(self.exp <= u64::BITS);
                    debug!(exp = self.exp, "raised rarity exponent");
                }
                // No branch has been hit at all; nothing to offer.
                None => return Vec::new(),
            }
        }
        Vec::new()
    }

    /// The rare branches actually hit by one input's compact trace,
    /// ordered by hit count ascending (ties by id). Empty when the input
    /// touches no rare branch; the caller then skips the input.
    pub fn rare_hits(&mut self, hit_bits: &[u64], trace_mini: &[u8]) -> Vec<BranchId> {
        let rarest = self.lowest_hit_branches(hit_bits);
        if rarest.is_empty() {
            return Vec::new();
        }

        let mut hit: Vec<BranchId> = rarest
            .into_iter()
            .filter(|b| {
                let i = b.as_usize();
                i / 8 < trace_mini.len() && trace_mini[i / 8] & (1 << (i % 8)) != 0
            })
            .collect();

        hit.sort_by_key(|b| (hit_bits[b.as_usize()], b.as_usize()));
        hit.truncate(self.max_rare_branches);
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mini_with(bits: &[usize], map_size: usize) -> Vec<u8> {
        let mut v = vec![0u8; (map_size + 7) / 8];
        for &b in bits {
            v[b / 8] |= 1 << (b % 8);
        }
        v
    }

    #[test]
    fn rarer_branches_tighten_the_exponent() {
        let mut st = RareBranchState::new(12, 64);
        // Branch 3 has been hit 2000 times, branch 7 only twice.
        let mut hits = vec![0u64; 16];
        hits[3] = 2000;
        hits[7] = 2;

        let out = st.lowest_hit_branches(&hits);
        assert_eq!(out, vec![BranchId(7)]);
        // floor(log2(2)) == 1, so the exponent tightened to 2.
        assert_eq!(st.exponent(), 2);
    }

    #[test]
    fn exponent_rises_when_nothing_qualifies() {
        let mut st = RareBranchState::new(2, 64);
        let mut hits = vec![0u64; 8];
        hits[1] = 4096;
        hits[5] = 100_000;

        let out = st.lowest_hit_branches(&hits);
        assert_eq!(out, vec![BranchId(1)]);
        assert_eq!(st.exponent(), highest_order_bit(4096) + 1);
        assert!(st.exponent() <= u64::BITS);
    }

    #[test]
    fn blacklisted_branches_never_return() {
        let mut st = RareBranchState::new(8, 64);
        let mut hits = vec![0u64; 8];
        hits[2] = 3;
        hits[4] = 3;
        st.blacklist_add(BranchId(2));

        let out = st.lowest_hit_branches(&hits);
        assert_eq!(out, vec![BranchId(4)]);
    }

    #[test]
    fn rare_hits_filters_by_trace_and_sorts_by_count() {
        let mut st = RareBranchState::new(8, 64);
        // All four branches sit in the same rarity tier.
        let mut hits = vec![0u64; 32];
        hits[10] = 3;
        hits[11] = 2;
        hits[12] = 3;
        hits[20] = 2;

        // The input reaches 10, 12 and 20 but not 11.
        let mini = mini_with(&[10, 12, 20], 32);
        let out = st.rare_hits(&hits, &mini);
        assert_eq!(out, vec![BranchId(20), BranchId(10), BranchId(12)]);
    }

    #[test]
    fn strictly_rarer_branch_evicts_the_whole_tier() {
        let mut st = RareBranchState::new(8, 64);
        let mut hits = vec![0u64; 16];
        hits[3] = 9;
        hits[5] = 2;

        // Branch 3 enters first, then the strictly rarer branch 5 resets
        // the list; an input hitting only branch 3 has nothing to offer.
        let mini = mini_with(&[3], 16);
        assert!(st.rare_hits(&hits, &mini).is_empty());
        assert_eq!(st.exponent(), 2);
    }

    #[test]
    fn input_missing_all_rare_branches_yields_empty() {
        let mut st = RareBranchState::new(8, 64);
        let mut hits = vec![0u64; 16];
        hits[3] = 2;

        let mini = mini_with(&[9], 16);
        assert!(st.rare_hits(&hits, &mini).is_empty());
    }

    #[test]
    fn untouched_map_yields_empty() {
        let mut st = RareBranchState::new(8, 64);
        let hits = vec![0u64; 16];
        assert!(st.lowest_hit_branches(&hits).is_empty());
    }
}
