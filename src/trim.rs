//! Branch-preserving trimming
//!
//! Ordinary trimming shrinks an input while preserving its whole trace
//! checksum; this trimmer only insists that one branch, the rare branch
//! currently being worked on, is still taken. The schedule mirrors the
//! standard trimmer: start with windows of `next_pow2(len) /
//! TRIM_START_STEPS` bytes, halve until the window drops under
//! `next_pow2(len) / TRIM_END_STEPS`, and on every successful removal keep
//! the window position fixed so runs of removable data collapse quickly.
//!
//! The candidate is always built in a scratch buffer, so the input under
//! trim and the executed buffer never alias.

use tracing::debug;

use crate::exec::{Campaign, ExecError, Verdict};
use crate::stats::{StageId, StageStats};
use crate::{BranchId, TRIM_END_STEPS, TRIM_MIN_BYTES, TRIM_START_STEPS};

/// Shrink `input` while the target branch stays on the execution path.
///
/// Returns `None` for inputs too short to bother with (under 5 bytes);
/// otherwise the surviving buffer, which may equal the input when nothing
/// was removable. The caller re-measures timing afterwards. An abandon
/// verdict or the stop flag ends trimming early with whatever has been
/// achieved so far; executor failure is fatal.
pub fn trim_for_branch(
    campaign: &mut dyn Campaign,
    stats: &mut StageStats,
    input: &[u8],
    branch: BranchId,
) -> Result<Option<Vec<u8>>, ExecError> {
    if input.len() < 5 {
        return Ok(None);
    }

    let mut buf = input.to_vec();
    let mut len_p2 = buf.len().next_power_of_two();
    let mut remove_len = (len_p2 / TRIM_START_STEPS).max(TRIM_MIN_BYTES);
    let mut execs = 0u64;

    while remove_len >= (len_p2 / TRIM_END_STEPS).max(TRIM_MIN_BYTES) {
        let mut pos = 0usize;

        while pos < buf.len() {
            let trim_avail = remove_len.min(buf.len() - pos);

            let mut candidate = Vec::with_capacity(buf.len() - trim_avail);
            candidate.extend_from_slice(&buf[..pos]);
            candidate.extend_from_slice(&buf[pos + trim_avail..]);

            let verdict = campaign.run(&candidate)?;
            execs += 1;
            if campaign.stop_soon() || verdict == Verdict::Abandon {
                stats.record(StageId::RbTrim, 0, execs);
                return Ok(Some(buf));
            }

            if campaign.hits_branch(branch) {
                buf = candidate;
                len_p2 = buf.len().next_power_of_two();
                // Keep `pos` where it is: the bytes that slid into place
                // may be removable too.
            } else {
                pos += remove_len;
            }
        }

        remove_len >>= 1;
    }

    debug!(
        from = input.len(),
        to = buf.len(),
        branch = branch.as_usize(),
        "branch-preserving trim done"
    );
    stats.record(StageId::RbTrim, 0, execs);
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockCampaign;

    #[test]
    fn short_inputs_are_left_alone() {
        let mut c = MockCampaign::new(16);
        let mut stats = StageStats::new();
        let out = trim_for_branch(&mut c, &mut stats, b"abcd", BranchId(0)).unwrap();
        assert!(out.is_none());
        assert_eq!(c.execs, 0);
    }

    #[test]
    fn trim_preserves_the_guarded_branch() {
        // Branch 3 is taken iff byte 10 is 'A'; everything after it is
        // ballast the trimmer should shed.
        let mut c = MockCampaign::new(16);
        c.oracle = Box::new(|data: &[u8]| {
            if data.len() > 10 && data[10] == b'A' {
                vec![BranchId(3)]
            } else {
                vec![BranchId(0)]
            }
        });

        let mut input = vec![b'x'; 64];
        input[10] = b'A';

        let mut stats = StageStats::new();
        let out = trim_for_branch(&mut c, &mut stats, &input, BranchId(3))
            .unwrap()
            .expect("long input gets trimmed");

        assert!(out.len() <= 16, "trimmed len {}", out.len());
        assert_eq!(out[10], b'A');
        assert!(stats.execs(StageId::RbTrim) > 0);
    }

    #[test]
    fn abandon_keeps_partial_progress() {
        let mut c = MockCampaign::new(8);
        c.oracle = Box::new(|_| vec![BranchId(1)]);
        c.abandon_after = Some(3);

        let input = vec![9u8; 40];
        let mut stats = StageStats::new();
        let out = trim_for_branch(&mut c, &mut stats, &input, BranchId(1))
            .unwrap()
            .expect("trim ran");
        // Three executions happened, then the campaign called it off.
        assert_eq!(c.execs, 3);
        assert!(out.len() <= input.len());
    }
}
