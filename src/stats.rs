//! Per-stage discovery and execution accounting

/// The stages whose yield is tracked separately.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StageId {
    /// Walking single-bit flip.
    Flip1,
    /// Walking two-bit flip.
    Flip2,
    /// Walking four-bit flip.
    Flip4,
    /// Walking byte flip (also builds the effector map / branch mask).
    Flip8,
    /// Walking word flip.
    Flip16,
    /// Walking dword flip.
    Flip32,
    /// Byte-removal probes of the branch-mask builder.
    RbRemove8,
    /// Byte-insertion probes of the branch-mask builder.
    RbInsert8,
    /// ± arithmetic on bytes.
    Arith8,
    /// ± arithmetic on words.
    Arith16,
    /// ± arithmetic on dwords.
    Arith32,
    /// Interesting 8-bit values.
    Interest8,
    /// Interesting 16-bit values.
    Interest16,
    /// Interesting 32-bit values.
    Interest32,
    /// User dictionary, overwrite.
    ExtrasOverwrite,
    /// User dictionary, insert.
    ExtrasInsert,
    /// Auto dictionary, overwrite.
    AutoExtrasOverwrite,
    /// External custom mutators.
    CustomMutator,
    /// Stacked random havoc.
    Havoc,
    /// Havoc re-entered after a splice.
    Splice,
    /// Branch-preserving trim.
    RbTrim,
}

const STAGE_COUNT: usize = 21;

impl StageId {
    #[inline]
    fn idx(self) -> usize {
        self as usize
    }
}

/// `(new_coverage_found, executions)` per stage, accumulated across the
/// whole session.
#[derive(Clone, Debug, Default)]
pub struct StageStats {
    finds: [u64; STAGE_COUNT],
    execs: [u64; STAGE_COUNT],
}

impl StageStats {
    /// Fresh, all-zero accounting.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one stage pass into the totals.
    pub fn record(&mut self, stage: StageId, finds: u64, execs: u64) {
        self.finds[stage.idx()] += finds;
        self.execs[stage.idx()] += execs;
    }

    /// Discoveries credited to `stage` so far.
    pub fn finds(&self, stage: StageId) -> u64 {
        self.finds[stage.idx()]
    }

    /// Executions spent in `stage` so far.
    pub fn execs(&self, stage: StageId) -> u64 {
        self.execs[stage.idx()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_per_stage() {
        let mut s = StageStats::new();
        s.record(StageId::Havoc, 2, 100);
        s.record(StageId::Havoc, 1, 50);
        s.record(StageId::Flip1, 0, 8);

        assert_eq!(s.finds(StageId::Havoc), 3);
        assert_eq!(s.execs(StageId::Havoc), 150);
        assert_eq!(s.execs(StageId::Flip1), 8);
        assert_eq!(s.finds(StageId::Splice), 0);
    }
}
