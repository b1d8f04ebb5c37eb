//! Crate root: public surface, core aliases, and scheduling-wide invariants
//!
//! This crate is the mutation and scheduling core of a coverage-guided
//! greybox fuzzer. Given a corpus of test inputs and an instrumented target
//! that reports a coverage map after every execution, the core decides which
//! input to mutate, applies layered mutation stages (deterministic, havoc,
//! splicing), steers its operator and batch-size choices with multi-armed
//! bandits, and preferentially works on branches that few queue inputs
//! reach, constraining mutations to byte positions that leave the chosen
//! rare branch intact.
//!
//! ## Invariants
//!
//! - **Single-threaded, cooperative.** The core never spawns threads; the
//!   only blocking points are the synchronous calls into the
//!   [`Campaign`] collaborator (target execution, corpus I/O). A
//!   caller-owned stop flag is polled at every executor boundary.
//! - **Mask discipline.** Every havoc mutation touches only byte positions
//!   whose [`BranchMask`] flags permit it; size-changing operators resize
//!   the mask in lockstep and the trailing sentinel stays insert-only.
//! - **Bandit accounting.** Selector state is updated before the next
//!   selection; trust and weight vectors renormalise to 1 within 1e-6
//!   after every update. A masked pick on a weight-based selector is a
//!   no-op skip: no reward, no time step.
//! - **No owned persistence.** Everything on disk belongs to the outer
//!   system; the core only mutates the bookkeeping fields of the queue
//!   entry it is currently fuzzing.
//!
//! Failure modes are precise errors (never UB): executor failure is fatal
//! and surfaces as [`FuzzError`]; entry-level abandonment and per-iteration
//! skips are ordinary values, not errors.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Redundancy predicates pruning duplicate deterministic candidates.
pub mod redundancy;
/// ADWIN adaptive-window change detector over a binary reward stream.
pub mod adwin;
/// Index-based bandit policies and the tagged selector type.
pub mod bandit;
/// Weight-based bandit policies (Exp3-PP, Exp3-IX).
pub mod exp3;
/// Per-byte branch mask constraining mutations to branch-preserving
/// positions.
pub mod branch_mask;
/// Rare-branch selection over the campaign-wide hit counters.
pub mod rare_branch;
/// Branch-preserving input trimming.
pub mod trim;
/// Collaborator seam: execution, coverage counters, corpus, dictionary.
pub mod exec;
/// Queue-entry data model and dictionary tokens.
pub mod queue;
/// Deterministic stage: walking flips, arithmetics, interesting values,
/// dictionary stages, effector map, branch-mask construction.
pub mod deterministic;
/// Stacked random havoc stage driven by the bandit selectors.
pub mod havoc;
/// Crossover between queue inputs, feeding back into havoc.
pub mod splice;
/// The fuzz-one driver orchestrating all stages for one queue entry.
pub mod scheduler;
/// Per-stage discovery/execution accounting.
pub mod stats;

#[cfg(test)]
pub(crate) mod testutil;

// ============================================================================
// Canonical aliases and root-level re-exports
// ============================================================================

/// Index of a branch (edge) in the coverage map, `0..map_size`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BranchId(pub usize);

impl BranchId {
    /// Access the underlying index.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Result of a stage: keep going, skip the rest of this entry cleanly, or
/// abandon the entry (interrupt, resource cap, calibration failure).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Proceed to the next stage.
    Continue,
    /// Stop fuzzing this entry; the entry counts as skipped.
    Skip,
    /// Drop straight to the cleanup path; the entry counts as bailed.
    Abandon,
}

pub use crate::branch_mask::BranchMask;
pub use crate::exec::{Campaign, ExecError, Verdict};
pub use crate::queue::{Extra, QueueEntry};
pub use crate::scheduler::{FuzzError, FuzzOne, FuzzOneStatus};
pub use crate::stats::{StageId, StageStats};

// ============================================================================
// Tuning constants
// ============================================================================

/// Maximum delta for the ± arithmetic stages and havoc arithmetic arms.
pub const ARITH_MAX: u32 = 35;

/// Small block-size tier for havoc block operators.
pub const HAVOC_BLK_SMALL: usize = 32;
/// Medium block-size tier.
pub const HAVOC_BLK_MEDIUM: usize = 128;
/// Large block-size tier.
pub const HAVOC_BLK_LARGE: usize = 1500;
/// Extra-large block-size tier; also the headroom checked against
/// [`MAX_FILE`] before size-growing operators.
pub const HAVOC_BLK_XL: usize = 32768;

/// Havoc iteration budget multiplier after a non-deterministic entry.
pub const HAVOC_CYCLES: u32 = 256;
/// Havoc iteration budget multiplier right after a deterministic pass.
pub const HAVOC_CYCLES_INIT: u32 = 1024;
/// Floor on the havoc iteration budget.
pub const HAVOC_MIN: u32 = 16;

/// Splicing retry budget per queue entry.
pub const SPLICE_CYCLES: u32 = 15;
/// Havoc budget multiplier when re-entered from the splice stage.
pub const SPLICE_HAVOC: u32 = 32;

/// Hard cap on generated input size.
pub const MAX_FILE: usize = 1 << 20;

/// Trim schedule: the first pass removes `next_pow2(len)/TRIM_START_STEPS`
/// bytes per window.
pub const TRIM_START_STEPS: usize = 16;
/// Trim schedule: passes stop once the window is below
/// `next_pow2(len)/TRIM_END_STEPS`.
pub const TRIM_END_STEPS: usize = 1024;
/// Smallest trim window.
pub const TRIM_MIN_BYTES: usize = 4;

/// Shortest auto-dictionary token worth keeping.
pub const MIN_AUTO_EXTRA: usize = 3;
/// Longest auto-dictionary token collected.
pub const MAX_AUTO_EXTRA: usize = 32;
/// Above this many user tokens, the deterministic stage samples them.
pub const MAX_DET_EXTRAS: usize = 256;
/// Cap on auto tokens consulted per deterministic pass.
pub const USE_AUTO_EXTRAS: usize = 4096;

/// Effector map granularity: log2 of bytes covered per flag.
pub const EFF_MAP_SCALE2: usize = 3;
/// Effector density (percent) above which the whole map is flagged.
pub const EFF_MAX_PERC: usize = 90;
/// Inputs shorter than this skip checksum-based effector classification.
pub const EFF_MIN_LEN: usize = 128;

/// Seed for the stable trace checksum.
pub const HASH_SEED: u64 = 0xa5b3_5705;

/// Percent chance of skipping to favored entries in vanilla mode.
pub const SKIP_TO_NEW_PROB: u32 = 99;
/// Percent chance of skipping fuzzed non-favored entries in vanilla mode.
pub const SKIP_NFAV_OLD_PROB: u32 = 95;
/// Percent chance of skipping fresh non-favored entries in vanilla mode.
pub const SKIP_NFAV_NEW_PROB: u32 = 75;

/// Bounded recalibration attempts before an entry is given up on.
pub const CAL_CHANCES: u8 = 3;

/// Number of batch-size arms; arm `t` stacks `2^t` mutations in the
/// power-of-two encoding.
pub const BATCH_ARMS: usize = 7;

/// Input-length buckets for the batch-size bandits: ≤1e2, ≤1e3, ≤1e4,
/// ≤1e5, larger.
pub const NUM_LEN_BUCKETS: usize = 5;

/// Below this input length, havoc restores by full copy instead of
/// positional replay.
pub const MIN_LEN_FOR_OPTIMIZED_RESTORE: usize = 64;

/// Stable 64-bit checksum of a byte buffer under a seed.
///
/// BLAKE3 keyed by the seed, truncated to the first eight bytes. Drives the
/// effector map and dictionary induction, where only equality and stability
/// matter.
pub fn hash64(bytes: &[u8], seed: u64) -> u64 {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&seed.to_le_bytes());
    let digest = blake3::keyed_hash(&key, bytes);
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(out)
}

// ============================================================================
// Session parameters
// ============================================================================

/// Which selector drives a bandit decision point.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BanditAlgo {
    /// Uniform random choice among unmasked arms.
    Uniform,
    /// UCB1.
    Ucb,
    /// KL-UCB with Newton iteration.
    KlUcb,
    /// Thompson sampling with Beta posteriors.
    Thompson,
    /// Discounted Thompson sampling.
    DiscountedThompson,
    /// Discounted Bayes exploration (exponential weighting).
    DiscountedBayes,
    /// Thompson sampling over ADWIN reward estimators.
    AdwinThompson,
    /// Exp3++ with gap estimation.
    Exp3Pp,
    /// Exp3-IX.
    Exp3Ix,
}

/// Encoding of a batch-size arm index into a stacking count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BatchEncoding {
    /// Arm `t` stacks `2^t` mutations.
    PowerOfTwo,
    /// Arm `t` stacks `t + 1` mutations.
    Linear,
}

/// Static configuration for a fuzzing session.
///
/// These mirror the mode flags the outer system reads from its CLI and
/// environment; the core only consults them. Dynamic campaign state (cycle
/// counters, bootstrap fallback) lives inside [`FuzzOne`].
#[derive(Clone, Debug)]
pub struct FuzzParams {
    /// Skip the deterministic stage.
    pub skip_deterministic: bool,
    /// Skip the ± arithmetic stages.
    pub no_arith: bool,
    /// Skip the standard queue trim.
    pub disable_trim: bool,
    /// Allow the splice stage.
    pub use_splicing: bool,
    /// Start in plain mode, without rare-branch targeting.
    pub vanilla_afl: bool,
    /// Bootstrap fallback: after a cycle without new coverage, revert to
    /// plain behavior. `2` also skips the deterministic stage there.
    pub bootstrap: u8,
    /// Run every entry twice, baseline first, for attribution logging.
    pub run_with_shadow: bool,
    /// Constrain mutations with the branch mask in rare-branch mode.
    pub use_branch_mask: bool,
    /// Run the branch-preserving trimmer on rare-branch entries.
    pub trim_for_branch: bool,
    /// Cap on the rare-branch candidate list.
    pub max_rare_branches: usize,
    /// Initial rarity exponent; branches whose hit count has
    /// `floor(log2(hits))` below it are rare.
    pub rare_branch_exp: u32,
    /// The outer system runs only custom mutators; the core stops after
    /// its extension point.
    pub custom_only: bool,
    /// Enable the expensive havoc operators once a full cycle went dry.
    pub expand_havoc: bool,
    /// Target is not instrumented; checksum-driven classification is off.
    pub non_instrumented: bool,
    /// Divisor applied to the havoc budget.
    pub havoc_div: u32,
    /// Cap (×100 units of perf score) for the doubling on new finds.
    pub havoc_max_mult: u32,
    /// Operator-selector algorithm.
    pub mutation_algo: BanditAlgo,
    /// Batch-size selector algorithm.
    pub batch_algo: BanditAlgo,
    /// Batch arm encoding.
    pub batch_encoding: BatchEncoding,
}

impl Default for FuzzParams {
    fn default() -> Self {
        Self {
            skip_deterministic: false,
            no_arith: false,
            disable_trim: false,
            use_splicing: true,
            vanilla_afl: false,
            bootstrap: 0,
            run_with_shadow: false,
            use_branch_mask: true,
            trim_for_branch: true,
            max_rare_branches: 1024,
            rare_branch_exp: 12,
            custom_only: false,
            expand_havoc: false,
            non_instrumented: false,
            havoc_div: 1,
            havoc_max_mult: 16,
            mutation_algo: BanditAlgo::Thompson,
            batch_algo: BanditAlgo::Thompson,
            batch_encoding: BatchEncoding::PowerOfTwo,
        }
    }
}
