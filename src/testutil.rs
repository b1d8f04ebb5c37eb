//! Deterministic in-memory collaborators for stage and driver tests
//!
//! `MockCampaign` scripts the executor seam with a closure oracle mapping
//! an input to the branches it covers, so tests can state coverage
//! behavior declaratively ("branch 3 is taken iff byte 10 is 'A'") and
//! observe exactly what the core executed.

use crate::exec::{Calibration, Campaign, ExecError, ShadowSnapshot, Verdict};
use crate::queue::{Extra, QueueEntry};
use crate::BranchId;

pub(crate) struct MockCampaign {
    pub map_size: usize,
    pub trace: Vec<u8>,
    pub hit_bits: Vec<u64>,
    pub virgin: Vec<u8>,
    pub execs: u64,
    pub queued: u64,
    pub crashes: u64,
    pub with_cov: u64,
    pub discovered: u64,
    /// `stop_soon` turns true once `execs` reaches this.
    pub stop_after: Option<u64>,
    /// `run` verdicts become Abandon once `execs` reaches this.
    pub abandon_after: Option<u64>,
    pub entries: Vec<Vec<u8>>,
    pub extras: Vec<Extra>,
    pub auto_extras: Vec<Extra>,
    pub added_autos: Vec<Vec<u8>>,
    /// Every input passed to `run`, in order (only with `record_executions`).
    pub executed: Vec<Vec<u8>>,
    pub record_executions: bool,
    /// Input → branches covered by that execution.
    pub oracle: Box<dyn FnMut(&[u8]) -> Vec<BranchId>>,
    /// Input → whether the wrapper would queue it as a find.
    pub is_find: Box<dyn FnMut(&[u8]) -> bool>,
    pub perf: f64,
    pub cal_result: Calibration,
    pub pending_favored: u64,
    pub cycle: u32,
    pub shadow_calls: Vec<bool>,
}

impl MockCampaign {
    pub fn new(map_size: usize) -> Self {
        Self {
            map_size,
            trace: vec![0; map_size],
            hit_bits: vec![0; map_size],
            virgin: vec![0xff; map_size],
            execs: 0,
            queued: 1,
            crashes: 0,
            with_cov: 0,
            discovered: 0,
            stop_after: None,
            abandon_after: None,
            entries: Vec::new(),
            extras: Vec::new(),
            auto_extras: Vec::new(),
            added_autos: Vec::new(),
            executed: Vec::new(),
            record_executions: false,
            oracle: Box::new(|_| vec![BranchId(0)]),
            is_find: Box::new(|_| false),
            perf: 100.0,
            cal_result: Calibration::Passed,
            pending_favored: 0,
            cycle: 1,
            shadow_calls: Vec::new(),
        }
    }

    fn branches_for(&mut self, input: &[u8]) -> Vec<BranchId> {
        let branches = (self.oracle)(input);
        self.trace = vec![0; self.map_size];
        for b in &branches {
            self.trace[b.as_usize()] = 1;
        }
        branches
    }
}

impl Campaign for MockCampaign {
    fn run(&mut self, input: &[u8]) -> Result<Verdict, ExecError> {
        self.execs += 1;
        if self.record_executions {
            self.executed.push(input.to_vec());
        }

        let branches = self.branches_for(input);
        for b in &branches {
            self.hit_bits[b.as_usize()] += 1;
        }
        if (self.is_find)(input) {
            self.queued += 1;
            self.with_cov += 1;
            self.discovered += 1;
        }

        let abandon = self.stop_soon() || self.abandon_after.map_or(false, |n| self.execs >= n);
        Ok(if abandon {
            Verdict::Abandon
        } else {
            Verdict::Continue
        })
    }

    fn measure(&mut self, input: &[u8]) -> Result<(u64, u32), ExecError> {
        let branches = self.branches_for(input);
        Ok((100, branches.len() as u32))
    }

    fn trace_bits(&self) -> &[u8] {
        &self.trace
    }

    fn stop_soon(&self) -> bool {
        self.stop_after.map_or(false, |n| self.execs >= n)
    }

    fn total_execs(&self) -> u64 {
        self.execs
    }

    fn queued_paths(&self) -> u64 {
        self.queued
    }

    fn unique_crashes(&self) -> u64 {
        self.crashes
    }

    fn queued_with_cov(&self) -> u64 {
        self.with_cov
    }

    fn queued_discovered(&self) -> u64 {
        self.discovered
    }

    fn set_shadow(&mut self, enabled: bool) {
        self.shadow_calls.push(enabled);
    }

    fn shadow_snapshot(&self) -> ShadowSnapshot {
        ShadowSnapshot {
            virgin_bits: self.virgin.clone(),
            queued_discovered: self.discovered,
            queued_with_cov: self.with_cov,
            total_execs: self.execs,
        }
    }

    fn shadow_rollback(&mut self, snapshot: ShadowSnapshot) {
        self.virgin = snapshot.virgin_bits;
        self.discovered = snapshot.queued_discovered;
        self.with_cov = snapshot.queued_with_cov;
        self.execs = snapshot.total_execs;
    }

    fn map_size(&self) -> usize {
        self.map_size
    }

    fn hit_bits(&self) -> &[u64] {
        &self.hit_bits
    }

    fn entry_input_len(&self, idx: usize) -> usize {
        self.entries[idx].len()
    }

    fn entry_bytes(&mut self, idx: usize) -> Vec<u8> {
        self.entries[idx].clone()
    }

    fn ready_for_splicing_count(&self) -> usize {
        self.entries.iter().filter(|e| e.len() >= 4).count()
    }

    fn calibrate(&mut self, entry: &mut QueueEntry) -> Result<Calibration, ExecError> {
        if self.cal_result == Calibration::Passed {
            entry.cal_failed = 0;
        } else {
            entry.cal_failed = entry.cal_failed.saturating_add(1);
        }
        Ok(self.cal_result)
    }

    fn trim(&mut self, _idx: usize, entry: &mut QueueEntry) -> Result<(), ExecError> {
        entry.trim_done = true;
        Ok(())
    }

    fn performance_score(&mut self, _entry: &QueueEntry) -> f64 {
        self.perf
    }

    fn note_first_fuzz(&mut self, favored: bool) {
        if favored && self.pending_favored > 0 {
            self.pending_favored -= 1;
        }
    }

    fn pending_favored(&self) -> u64 {
        self.pending_favored
    }

    fn queue_cycle(&self) -> u32 {
        self.cycle
    }

    fn run_over_10m(&self) -> bool {
        true
    }

    fn dry_spell(&self) -> bool {
        false
    }

    fn extras(&self) -> &[Extra] {
        &self.extras
    }

    fn auto_extras(&self) -> &[Extra] {
        &self.auto_extras
    }

    fn maybe_add_auto(&mut self, token: &[u8]) {
        self.added_autos.push(token.to_vec());
    }
}
