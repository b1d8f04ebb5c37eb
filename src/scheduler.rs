//! The fuzz-one driver
//!
//! One call works through one queue entry: skip policy, rare-branch
//! selection, recalibration, trimming, scoring, then the mutation
//! pipeline (deterministic stage, custom-mutator extension point, havoc,
//! splicing). Every stage is a function returning an [`Outcome`] and the
//! driver is a linear match over them; all paths converge on one cleanup
//! block that updates the entry's bookkeeping and returns.
//!
//! In shadow mode the pipeline runs twice over the same input: a baseline
//! pass with a fully permissive mask whose discoveries are rolled back,
//! then the rare-branch-guided pass. The two `debug!` summaries give the
//! attribution data; nothing else depends on the baseline pass.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::branch_mask::BranchMask;
use crate::deterministic::{deterministic_stage, DetCtx};
use crate::exec::{Calibration, Campaign, ExecError, Verdict};
use crate::havoc::{havoc_stage, BanditSet, HavocCtx};
use crate::queue::QueueEntry;
use crate::rare_branch::RareBranchState;
use crate::splice::try_splice;
use crate::stats::{StageId, StageStats};
use crate::trim::trim_for_branch;
use crate::{
    BranchId, FuzzParams, Outcome, CAL_CHANCES, SKIP_NFAV_NEW_PROB, SKIP_NFAV_OLD_PROB,
    SKIP_TO_NEW_PROB, SPLICE_CYCLES,
};

/// Fatal failures of the core; everything else is an [`Outcome`].
#[derive(Debug, thiserror::Error)]
pub enum FuzzError {
    /// The executor collaborator failed; the session must stop.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// What happened to the entry handed to [`FuzzOne::fuzz_one`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FuzzOneStatus {
    /// The entry went through the pipeline.
    Fuzzed,
    /// The entry was skipped or bailed on.
    Skipped,
}

/// Per-stage accumulator: how many executions were tried against the
/// target branch and how many still hit it.
#[derive(Clone, Debug, Default)]
pub(crate) struct BranchTries {
    pub total: u64,
    pub successful: u64,
}

impl BranchTries {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Borrowed driver state handed into the stage functions.
pub(crate) struct DriverCtx<'a> {
    pub params: &'a FuzzParams,
    pub rng: &'a mut StdRng,
    pub stats: &'a mut StageStats,
    pub bandits: &'a mut BanditSet,
}

/// Arguments one pipeline pass runs under.
struct PassArgs<'a> {
    entry_idx: usize,
    in_buf: &'a [u8],
    rb_target: Option<BranchId>,
    shadow: bool,
    skip_simple_bitflip: bool,
    rb_skip_deterministic: bool,
    orig_perf: f64,
}

/// The mutation and scheduling core, persistent across queue entries.
pub struct FuzzOne {
    params: FuzzParams,
    rng: StdRng,
    stats: StageStats,
    rare: RareBranchState,
    bandits: BanditSet,
    /// Plain mode; starts from the configured flag and flips back and
    /// forth under the bootstrap policy.
    vanilla_afl: bool,
    skip_det_bootstrap: bool,
    /// No entry has produced new coverage in the current queue cycle.
    cycle_wo_new: bool,
    prev_cycle_wo_new: bool,
}

impl FuzzOne {
    /// Build a driver with a seeded RNG handle.
    pub fn new(params: FuzzParams, seed: u64) -> Self {
        let bandits = BanditSet::new(&params);
        let rare = RareBranchState::new(params.rare_branch_exp, params.max_rare_branches);
        let vanilla_afl = params.vanilla_afl;
        Self {
            params,
            rng: StdRng::seed_from_u64(seed),
            stats: StageStats::new(),
            rare,
            bandits,
            vanilla_afl,
            skip_det_bootstrap: false,
            cycle_wo_new: true,
            prev_cycle_wo_new: false,
        }
    }

    /// Per-stage accounting so far.
    pub fn stats(&self) -> &StageStats {
        &self.stats
    }

    /// Rare-branch selector state (exponent and blacklist).
    pub fn rare_state(&self) -> &RareBranchState {
        &self.rare
    }

    /// Tell the driver a full pass over the queue ended; feeds the
    /// bootstrap fallback.
    pub fn end_of_cycle(&mut self) {
        self.prev_cycle_wo_new = self.cycle_wo_new;
        self.cycle_wo_new = true;
    }

    /// Fuzz one checked-out queue entry.
    ///
    /// `entry_idx` is the entry's index in the corpus, used to avoid
    /// splicing an input with itself. Returns whether the entry was
    /// actually fuzzed; executor failure is the only error.
    pub fn fuzz_one(
        &mut self,
        campaign: &mut dyn Campaign,
        entry: &mut QueueEntry,
        entry_idx: usize,
    ) -> Result<FuzzOneStatus, FuzzError> {
        let orig_with_cov = campaign.queued_with_cov();

        // Bootstrap fallback: a whole cycle without new coverage sends
        // the core back to plain behavior.
        if !self.vanilla_afl && self.prev_cycle_wo_new && self.params.bootstrap > 0 {
            debug!("bootstrap fallback to plain mode");
            self.vanilla_afl = true;
            if self.params.bootstrap == 2 {
                self.skip_det_bootstrap = true;
            }
        }

        let mut skip_simple_bitflip = false;
        let mut rb_skip_deterministic = false;
        if self.params.skip_deterministic {
            skip_simple_bitflip = true;
            rb_skip_deterministic = true;
        }

        // Plain-mode skip policy: favored fresh arrivals get priority.
        if self.vanilla_afl {
            if campaign.pending_favored() > 0 {
                if (entry.was_fuzzed || entry.fuzz_level > 0 || !entry.favored)
                    && self.rng.gen_range(0..100) < SKIP_TO_NEW_PROB
                {
                    return Ok(FuzzOneStatus::Skipped);
                }
            } else if !self.params.non_instrumented
                && !entry.favored
                && campaign.queued_paths() > 10
            {
                let fresh = campaign.queue_cycle() > 1 && (entry.fuzz_level == 0 || entry.was_fuzzed);
                let prob = if fresh {
                    SKIP_NFAV_NEW_PROB
                } else {
                    SKIP_NFAV_OLD_PROB
                };
                if self.rng.gen_range(0..100) < prob {
                    return Ok(FuzzOneStatus::Skipped);
                }
            }
        }

        // Rare-branch selection: pick the rarest branch this input hits
        // that it has not been fuzzed against yet.
        let mut rb_target: Option<BranchId> = None;
        if !self.vanilla_afl {
            self.skip_det_bootstrap = false;

            let candidates = self.rare.rare_hits(campaign.hit_bits(), &entry.trace_mini);
            if candidates.is_empty() {
                return Ok(FuzzOneStatus::Skipped);
            }

            let mut chosen = None;
            for &b in &candidates {
                if entry.fuzzed_branch(b) {
                    continue;
                }
                if entry.any_branch_fuzzed() {
                    // This input already went through the cheap walk for
                    // another branch.
                    skip_simple_bitflip = true;
                }
                entry.mark_fuzzed_branch(b);
                chosen = Some(b);
                break;
            }

            let target = match chosen {
                Some(b) => b,
                None => {
                    // Every rare branch was fuzzed already; reuse the
                    // rarest and keep only the mask-building part.
                    skip_simple_bitflip = true;
                    rb_skip_deterministic = true;
                    candidates[0]
                }
            };

            if !skip_simple_bitflip {
                self.cycle_wo_new = false;
            }

            debug!(
                branch = target.as_usize(),
                hits = campaign.hit_bits()[target.as_usize()],
                "fuzzing entry against rare branch"
            );
            rb_target = Some(target);
        }

        // Recalibration, bounded.
        if entry.cal_failed > 0 {
            let mut res = Calibration::Failed;
            if entry.cal_failed < CAL_CHANCES {
                entry.exec_cksum = 0;
                res = campaign.calibrate(entry)?;
            }
            if campaign.stop_soon() || res != Calibration::Passed {
                return self.finish(campaign, entry, FuzzOneStatus::Skipped, orig_with_cov);
            }
        }

        let mut in_buf = campaign.entry_bytes(entry_idx);

        // Standard trim, once per entry.
        if !self.params.non_instrumented && !entry.trim_done && !self.params.disable_trim {
            campaign.trim(entry_idx, entry)?;
            if campaign.stop_soon() {
                return self.finish(campaign, entry, FuzzOneStatus::Skipped, orig_with_cov);
            }
            entry.trim_done = true;
            in_buf = campaign.entry_bytes(entry_idx);
            entry.len = in_buf.len();
        }

        // Branch-preserving trim; its effect on the working buffer is
        // real, its effect on the entry's timing is temporary and only
        // feeds the score below.
        let orig_bitmap_size = entry.bitmap_size;
        let orig_exec_us = entry.exec_us;
        let mut rb_trimmed = false;
        if let Some(target) = rb_target {
            if self.params.trim_for_branch {
                if let Some(buf) = trim_for_branch(campaign, &mut self.stats, &in_buf, target)? {
                    in_buf = buf;
                    let (exec_us, bitmap_size) = campaign.measure(&in_buf)?;
                    entry.exec_us = exec_us;
                    entry.bitmap_size = bitmap_size;
                    rb_trimmed = true;
                }
                if campaign.stop_soon() {
                    return self.finish(campaign, entry, FuzzOneStatus::Skipped, orig_with_cov);
                }
            }
        }

        let perf_score = campaign.performance_score(entry);
        entry.perf_score = perf_score;
        if rb_trimmed {
            entry.bitmap_size = orig_bitmap_size;
            entry.exec_us = orig_exec_us;
        }
        if perf_score <= 0.0 {
            return self.finish(campaign, entry, FuzzOneStatus::Skipped, orig_with_cov);
        }

        // One real pass, optionally preceded by a rolled-back baseline
        // pass for attribution.
        let shadowing = rb_target.is_some() && self.params.run_with_shadow;
        let mut status = FuzzOneStatus::Fuzzed;
        let passes: &[bool] = if shadowing { &[true, false] } else { &[false] };
        let mut snapshot = None;

        for &shadow in passes {
            if shadow {
                snapshot = Some(campaign.shadow_snapshot());
                campaign.set_shadow(true);
            } else if let Some(snap) = snapshot.take() {
                campaign.set_shadow(false);
                campaign.shadow_rollback(snap);
            }

            let args = PassArgs {
                entry_idx,
                in_buf: &in_buf,
                rb_target,
                shadow,
                skip_simple_bitflip,
                rb_skip_deterministic,
                orig_perf: perf_score,
            };
            let outcome = self.pipeline(campaign, entry, args)?;

            status = match outcome {
                Outcome::Abandon | Outcome::Skip => FuzzOneStatus::Skipped,
                Outcome::Continue => FuzzOneStatus::Fuzzed,
            };
            if outcome == Outcome::Abandon && campaign.stop_soon() {
                break;
            }
        }

        self.finish(campaign, entry, status, orig_with_cov)
    }

    /// One pass of the mutation pipeline.
    fn pipeline(
        &mut self,
        campaign: &mut dyn Campaign,
        entry: &mut QueueEntry,
        args: PassArgs<'_>,
    ) -> Result<Outcome, FuzzError> {
        let len = args.in_buf.len();
        let build_mask = args.rb_target.is_some() && !args.shadow && self.params.use_branch_mask;

        let mut mask = if build_mask {
            BranchMask::building(len)
        } else {
            BranchMask::permissive(len)
        };
        let mut out_buf = args.in_buf.to_vec();
        let mut tries = BranchTries::default();

        let vanilla = self.vanilla_afl;
        let havoc_cap = (self.params.havoc_max_mult * 100) as f64;
        let skip_det = (args.rb_target.is_none() && self.params.skip_deterministic)
            || self.skip_det_bootstrap
            || (vanilla && entry.was_fuzzed)
            || (vanilla && entry.passed_det)
            || (vanilla && args.orig_perf < (entry.depth as f64 * 30.0).min(havoc_cap));

        let mut drv = DriverCtx {
            params: &self.params,
            rng: &mut self.rng,
            stats: &mut self.stats,
            bandits: &mut self.bandits,
        };

        let mut doing_det = false;
        if !skip_det {
            doing_det = !args.skip_simple_bitflip;

            let mut det_ctx = DetCtx {
                entry: &mut *entry,
                in_buf: args.in_buf,
                out_buf: &mut out_buf,
                rb_target: args.rb_target,
                build_mask,
                mask: &mut mask,
                skip_simple_bitflip: args.skip_simple_bitflip,
                rb_skip_deterministic: args.rb_skip_deterministic,
                tries: &mut tries,
            };
            let det = deterministic_stage(&mut drv, &mut det_ctx, campaign)?;
            if det.outcome == Outcome::Abandon {
                return Ok(Outcome::Abandon);
            }
            if det.completed && !entry.passed_det {
                entry.passed_det = true;
            }

            // A branch no mutation could preserve is not worth more
            // cycles; skip it from now on.
            if build_mask && tries.successful == 0 {
                if let Some(target) = args.rb_target {
                    self.rare.blacklist_add(target);
                }
            }
            debug!(
                total = tries.total,
                successful = tries.successful,
                shadow = args.shadow,
                "mask build tries"
            );
        }

        let mut orig_mask = mask.clone();
        let mut perf_score = args.orig_perf;
        let mut cur_in = args.in_buf.to_vec();
        let mut splice_cycle: u32 = 0;

        loop {
            out_buf.clear();
            out_buf.extend_from_slice(&cur_in);

            // External custom mutators slot in between the deterministic
            // and havoc stages, and again after every splice.
            if campaign.has_custom_mutators() {
                let start = campaign.queued_paths() + campaign.unique_crashes();
                if campaign.custom_mutator_stage(&out_buf)? == Verdict::Abandon {
                    return Ok(Outcome::Abandon);
                }
                let finds = campaign.queued_paths() + campaign.unique_crashes() - start;
                drv.stats.record(StageId::CustomMutator, finds, 0);
                if drv.params.custom_only {
                    return Ok(Outcome::Continue);
                }
            }

            let pass_start = campaign.queued_paths() + campaign.unique_crashes();
            let mut havoc_ctx = HavocCtx {
                entry_idx: args.entry_idx,
                in_buf: &cur_in,
                out_buf: &mut out_buf,
                mask: &mut mask,
                orig_mask: &orig_mask,
                perf_score: &mut perf_score,
                doing_det,
                splice_cycle,
            };
            if havoc_stage(&mut drv, &mut havoc_ctx, campaign)? == Outcome::Abandon {
                return Ok(Outcome::Abandon);
            }

            // Splicing is a last resort: only a dry havoc pass reaches it.
            let found = campaign.queued_paths() + campaign.unique_crashes() > pass_start;
            if found
                || !drv.params.use_splicing
                || campaign.ready_for_splicing_count() <= 1
                || entry.len < 4
            {
                break;
            }

            let mut next = None;
            while splice_cycle < SPLICE_CYCLES {
                splice_cycle += 1;
                if let Some(buf) = try_splice(&mut *drv.rng, campaign, args.entry_idx, args.in_buf)
                {
                    next = Some(buf);
                    break;
                }
            }

            match next {
                Some(buf) => {
                    // Fresh permissive mask sized for the blend; havoc
                    // re-runs with the splice budget.
                    mask = BranchMask::permissive(buf.len());
                    orig_mask = mask.clone();
                    perf_score = args.orig_perf;
                    doing_det = false;
                    cur_in = buf;
                }
                None => break,
            }
        }

        Ok(Outcome::Continue)
    }

    /// The single cleanup block every post-calibration path converges on.
    fn finish(
        &mut self,
        campaign: &mut dyn Campaign,
        entry: &mut QueueEntry,
        status: FuzzOneStatus,
        orig_with_cov: u64,
    ) -> Result<FuzzOneStatus, FuzzError> {
        if !campaign.stop_soon() && entry.cal_failed == 0 && !entry.disabled && !entry.was_fuzzed {
            entry.was_fuzzed = true;
            campaign.note_first_fuzz(entry.favored);
        }

        if campaign.queued_with_cov() > orig_with_cov {
            // New coverage re-arms rare-branch targeting and resets the
            // dry-cycle tracking.
            self.prev_cycle_wo_new = false;
            self.cycle_wo_new = false;
            self.vanilla_afl = false;
        }

        entry.fuzz_level += 1;
        Ok(status)
    }
}

#[cfg(test)]
pub(crate) mod testhooks {
    use super::DriverCtx;
    use crate::havoc::BanditSet;
    use crate::stats::StageStats;
    use crate::FuzzParams;
    use rand::rngs::StdRng;

    pub(crate) fn driver_ctx_for_tests<'a>(
        params: &'a FuzzParams,
        rng: &'a mut StdRng,
        stats: &'a mut StageStats,
        bandits: &'a mut BanditSet,
    ) -> DriverCtx<'a> {
        DriverCtx {
            params,
            rng,
            stats,
            bandits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockCampaign;
    use crate::BatchEncoding;

    fn rb_params() -> FuzzParams {
        FuzzParams {
            use_splicing: false,
            trim_for_branch: true,
            batch_encoding: BatchEncoding::PowerOfTwo,
            ..FuzzParams::default()
        }
    }

    /// A campaign whose branch 7 depends on the first input byte.
    fn guarded_campaign() -> MockCampaign {
        let mut c = MockCampaign::new(16);
        c.oracle = Box::new(|data: &[u8]| {
            if !data.is_empty() && data[0] == 0xaa {
                vec![crate::BranchId(7)]
            } else {
                vec![crate::BranchId(1)]
            }
        });
        c
    }

    #[test]
    fn stop_before_first_exec_leaves_queue_untouched() {
        let params = FuzzParams {
            vanilla_afl: true,
            disable_trim: true,
            ..FuzzParams::default()
        };
        let mut fo = FuzzOne::new(params, 1);

        let mut c = MockCampaign::new(16);
        c.entries = vec![vec![5u8; 32]];
        c.stop_after = Some(0);

        let mut entry = QueueEntry::new(32, 16);
        let before = c.queued;

        let status = fo.fuzz_one(&mut c, &mut entry, 0).unwrap();
        assert_eq!(status, FuzzOneStatus::Skipped);
        assert_eq!(c.queued, before);
        assert!(!entry.was_fuzzed);
    }

    #[test]
    fn rare_branch_entry_is_fuzzed_and_marked() {
        let mut fo = FuzzOne::new(rb_params(), 2);

        let mut c = guarded_campaign();
        let mut input = vec![0u8; 8];
        input[0] = 0xaa;
        c.entries = vec![input.clone()];
        c.hit_bits[7] = 2;
        c.hit_bits[1] = 5000;

        let mut entry = QueueEntry::new(input.len(), 16);
        entry.set_trace_mini(crate::BranchId(7));

        let status = fo.fuzz_one(&mut c, &mut entry, 0).unwrap();
        assert_eq!(status, FuzzOneStatus::Fuzzed);
        assert!(entry.fuzzed_branch(crate::BranchId(7)));
        assert_eq!(entry.fuzz_level, 1);
        // Mutations of the tail preserved the branch, so it stays usable.
        assert!(!fo.rare_state().is_blacklisted(crate::BranchId(7)));
        assert!(c.execs > 100);
    }

    #[test]
    fn entry_missing_every_rare_branch_is_skipped() {
        let mut fo = FuzzOne::new(rb_params(), 3);

        let mut c = guarded_campaign();
        c.entries = vec![vec![0u8; 8]];
        c.hit_bits[7] = 2;

        // The trace bitmap does not cover branch 7.
        let mut entry = QueueEntry::new(8, 16);
        entry.set_trace_mini(crate::BranchId(1));

        let status = fo.fuzz_one(&mut c, &mut entry, 0).unwrap();
        assert_eq!(status, FuzzOneStatus::Skipped);
        assert_eq!(c.execs, 0);
        assert_eq!(entry.fuzz_level, 0);
    }

    #[test]
    fn hopeless_branch_gets_blacklisted() {
        let mut fo = FuzzOne::new(rb_params(), 4);

        // Branch 9 is hit only by one exact input; every mutation loses it.
        let magic = b"exactly-this".to_vec();
        let magic_for_oracle = magic.clone();
        let mut c = MockCampaign::new(16);
        c.oracle = Box::new(move |data: &[u8]| {
            if data == &magic_for_oracle[..] {
                vec![crate::BranchId(9)]
            } else {
                vec![crate::BranchId(0)]
            }
        });
        c.entries = vec![magic.clone()];
        c.hit_bits[9] = 1;
        c.hit_bits[0] = 100_000;

        let mut entry = QueueEntry::new(magic.len(), 16);
        entry.set_trace_mini(crate::BranchId(9));

        fo.fuzz_one(&mut c, &mut entry, 0).unwrap();
        assert!(fo.rare_state().is_blacklisted(crate::BranchId(9)));
    }

    #[test]
    fn shadow_mode_rolls_back_the_baseline_pass() {
        let params = FuzzParams {
            run_with_shadow: true,
            use_splicing: false,
            ..FuzzParams::default()
        };
        let mut fo = FuzzOne::new(params, 5);

        let mut c = guarded_campaign();
        let mut input = vec![0u8; 8];
        input[0] = 0xaa;
        c.entries = vec![input.clone()];
        c.hit_bits[7] = 2;

        let mut entry = QueueEntry::new(input.len(), 16);
        entry.set_trace_mini(crate::BranchId(7));

        let status = fo.fuzz_one(&mut c, &mut entry, 0).unwrap();
        assert_eq!(status, FuzzOneStatus::Fuzzed);
        // Both passes toggled the shadow flag.
        assert_eq!(c.shadow_calls, vec![true, false]);
    }

    #[test]
    fn bootstrap_falls_back_to_plain_mode_after_dry_cycle() {
        let params = FuzzParams {
            bootstrap: 2,
            disable_trim: true,
            skip_deterministic: true,
            use_splicing: false,
            ..FuzzParams::default()
        };
        let mut fo = FuzzOne::new(params, 6);

        let mut c = guarded_campaign();
        c.entries = vec![vec![0u8; 8]];
        c.hit_bits[7] = 2;

        // A full dry cycle.
        fo.end_of_cycle();
        fo.end_of_cycle();
        assert!(fo.prev_cycle_wo_new);

        // Rare-branch selection would skip this entry (trace misses the
        // branch), but the bootstrap fallback turns plain mode on first.
        let mut entry = QueueEntry::new(8, 16);
        let status = fo.fuzz_one(&mut c, &mut entry, 0).unwrap();
        assert!(fo.vanilla_afl);
        assert_eq!(status, FuzzOneStatus::Fuzzed);
        assert!(c.execs > 0);
    }
}
