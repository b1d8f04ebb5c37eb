//! Collaborator seam between the core and the outer fuzzer
//!
//! The core never talks to the target, the queue files, or the coverage
//! bookkeeping directly; everything flows through the [`Campaign`] trait.
//! One `run` call corresponds to the outer system's execute-and-decide
//! wrapper: it runs the candidate, folds the trace into the campaign-wide
//! coverage state, decides whether the candidate enters the queue, updates
//! global statistics, and reports whether the user interrupted. The core
//! only ever observes the *effects* (counter deltas, trace bits) between
//! executions, which is what makes the single-threaded cooperative model
//! sound.

use crate::queue::{Extra, QueueEntry};
use crate::BranchId;

/// Fatal executor failure; aborts the whole fuzzing session upstream.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The instrumented target could not be executed at all.
    #[error("unable to execute target application: {0}")]
    Target(String),
}

/// Per-execution verdict of the execute-and-decide wrapper.
///
/// Timeouts and crashes are *not* surfaced here; the wrapper accounts for
/// them internally and the core treats the execution as ordinary. Abandon
/// means the entry must be dropped to its cleanup path (user interrupt,
/// resource cap).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Keep fuzzing this entry.
    Continue,
    /// Stop working on this entry now.
    Abandon,
}

/// Result of a (re)calibration request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Calibration {
    /// The entry behaves; fuzzing may proceed.
    Passed,
    /// Calibration failed again; skip the entry.
    Failed,
}

/// Everything the rollback of a shadow baseline pass must restore.
#[derive(Clone, Debug)]
pub struct ShadowSnapshot {
    /// Copy of the campaign's virgin bits.
    pub virgin_bits: Vec<u8>,
    /// Discovery counter at snapshot time.
    pub queued_discovered: u64,
    /// Coverage-credited discovery counter at snapshot time.
    pub queued_with_cov: u64,
    /// Execution counter at snapshot time.
    pub total_execs: u64,
}

/// The outer fuzzer as seen from the mutation core.
pub trait Campaign {
    // --- execution ---------------------------------------------------------

    /// Execute a candidate through the outer wrapper: run the target,
    /// decide queue insertion, update statistics, poll for interrupts.
    fn run(&mut self, input: &[u8]) -> Result<Verdict, ExecError>;

    /// Coverage bits of the most recent execution.
    fn trace_bits(&self) -> &[u8];

    /// One raw measured execution, without queue decisions: wall time in
    /// microseconds and the number of branches hit. Used to refresh an
    /// entry's timing after a branch-preserving trim.
    fn measure(&mut self, input: &[u8]) -> Result<(u64, u32), ExecError>;

    /// Caller-owned stop flag, polled at every executor boundary.
    fn stop_soon(&self) -> bool;

    /// Total executions so far, over the whole campaign.
    fn total_execs(&self) -> u64;

    /// True if the last execution hit `branch`.
    fn hits_branch(&self, branch: BranchId) -> bool {
        self.trace_bits()
            .get(branch.as_usize())
            .map_or(false, |&b| b > 0)
    }

    // --- campaign-wide counters -------------------------------------------

    /// Queue entries (paths) known so far.
    fn queued_paths(&self) -> u64;

    /// Unique crashes found so far.
    fn unique_crashes(&self) -> u64;

    /// Inputs queued for carrying genuinely new coverage.
    fn queued_with_cov(&self) -> u64;

    /// Inputs queued for any discovery reason.
    fn queued_discovered(&self) -> u64;

    /// Enter or leave the shadow baseline pass. While enabled, the
    /// wrapper accounts for discoveries but must not persist queue
    /// additions; everything it counted is rolled back afterwards.
    fn set_shadow(&mut self, _enabled: bool) {}

    /// Capture everything a shadow baseline pass may clobber.
    fn shadow_snapshot(&self) -> ShadowSnapshot;

    /// Roll the campaign back to a snapshot taken before the baseline
    /// pass; its discoveries are forgotten.
    fn shadow_rollback(&mut self, snapshot: ShadowSnapshot);

    // --- coverage map ------------------------------------------------------

    /// Number of branches in the coverage map.
    fn map_size(&self) -> usize;

    /// Per-branch cumulative hit counters, updated by the executor after
    /// every successful run. The core only reads them.
    fn hit_bits(&self) -> &[u64];

    // --- corpus ------------------------------------------------------------

    /// Length of the stored input at `idx`.
    fn entry_input_len(&self, idx: usize) -> usize;

    /// Bytes of the stored input at `idx`.
    fn entry_bytes(&mut self, idx: usize) -> Vec<u8>;

    /// Queue entries long enough to be splice partners.
    fn ready_for_splicing_count(&self) -> usize;

    /// Recalibrate a misbehaving entry.
    fn calibrate(&mut self, entry: &mut QueueEntry) -> Result<Calibration, ExecError>;

    /// Standard (coverage-preserving) trim of the stored testcase.
    fn trim(&mut self, idx: usize, entry: &mut QueueEntry) -> Result<(), ExecError>;

    /// Score how many havoc cycles this entry deserves.
    fn performance_score(&mut self, entry: &QueueEntry) -> f64;

    /// Bookkeeping hook fired the first time an entry is fuzzed.
    fn note_first_fuzz(&mut self, favored: bool);

    // --- scheduling signals ------------------------------------------------

    /// Favored, never-fuzzed entries still pending.
    fn pending_favored(&self) -> u64;

    /// Which pass over the queue this is.
    fn queue_cycle(&self) -> u32;

    /// The campaign has been running for a while; block-length tiers may
    /// open up.
    fn run_over_10m(&self) -> bool;

    /// No finds for several seconds; the expensive havoc operators become
    /// worth their price.
    fn dry_spell(&self) -> bool;

    // --- dictionary ---------------------------------------------------------

    /// User-supplied tokens, sorted by length ascending.
    fn extras(&self) -> &[Extra];

    /// Automatically collected tokens.
    fn auto_extras(&self) -> &[Extra];

    /// Offer a token candidate discovered by dictionary induction.
    fn maybe_add_auto(&mut self, token: &[u8]);

    // --- custom mutators ----------------------------------------------------

    /// Whether the outer system has custom mutators registered.
    fn has_custom_mutators(&self) -> bool {
        false
    }

    /// Ordered extension point between the deterministic and havoc
    /// stages. The default does nothing.
    fn custom_mutator_stage(&mut self, _input: &[u8]) -> Result<Verdict, ExecError> {
        Ok(Verdict::Continue)
    }
}
