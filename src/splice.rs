//! Last-resort crossover between queue inputs
//!
//! When a whole havoc pass over an entry comes up dry, the entry is
//! crossed with another queue input: both are kept up to a split point
//! drawn between their first and last differing byte, and havoc re-runs
//! on the blend. Inputs that differ in fewer than two positions cannot
//! produce a meaningful blend and are retried with another partner.

use rand::rngs::StdRng;
use rand::Rng;

use crate::exec::Campaign;

/// First and last differing offsets over the common prefix of two
/// buffers.
pub(crate) fn locate_diffs(a: &[u8], b: &[u8]) -> (Option<usize>, Option<usize>) {
    let mut first = None;
    let mut last = None;
    for (pos, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        if x != y {
            if first.is_none() {
                first = Some(pos);
            }
            last = Some(pos);
        }
    }
    (first, last)
}

/// One splice attempt: pick a partner, find a usable split window, blend.
///
/// Returns `None` when no partner of useful length exists or the inputs
/// are too similar; the caller retries against its splice budget.
pub(crate) fn try_splice(
    rng: &mut StdRng,
    campaign: &mut dyn Campaign,
    entry_idx: usize,
    orig_in: &[u8],
) -> Option<Vec<u8>> {
    let n = campaign.queued_paths() as usize;
    if n < 2 {
        return None;
    }

    let mut tid = None;
    for _ in 0..32 {
        let cand = rng.gen_range(0..n);
        if cand != entry_idx && campaign.entry_input_len(cand) >= 4 {
            tid = Some(cand);
            break;
        }
    }
    let partner = campaign.entry_bytes(tid?);

    // Split somewhere between the first and last differing byte; a
    // difference of a byte or two is not worth blending.
    let common = orig_in.len().min(partner.len());
    let (first, last) = locate_diffs(&orig_in[..common], &partner[..common]);
    let (f, l) = (first?, last?);
    if l < 2 || f == l {
        return None;
    }

    let split = f + rng.gen_range(0..l - f);

    let mut blended = Vec::with_capacity(partner.len());
    blended.extend_from_slice(&orig_in[..split]);
    blended.extend_from_slice(&partner[split..]);
    Some(blended)
}
