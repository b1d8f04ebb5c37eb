//! Stacked random havoc driven by the bandit selectors
//!
//! Each iteration asks the operator bandit which mutation to apply and the
//! batch-size bandit how many times to stack it, applies the batch at
//! mask-permitted positions, executes, and pays both bandits the same
//! binary reward: did the queue grow. Operators that are currently
//! illegal (no dictionary, input too short, queue too small to splice,
//! file-size cap) are masked out of the selection.
//!
//! Restoration is the hot path: for bit- and word-sized operators the
//! recorded positions are replayed in reverse, avoiding any reallocation;
//! size-changing operators fall back to copying the input and the saved
//! mask back in.

use rand::rngs::StdRng;
use rand::Rng;
use tracing::debug;

use crate::bandit::Bandit;
use crate::branch_mask::{BranchMask, MaskKind};
use crate::deterministic::{flip_bit, read_u16_le, read_u32_le, write_u16_le, write_u32_le};
use crate::exec::{Campaign, Verdict};
use crate::redundancy::{INTERESTING_16, INTERESTING_32, INTERESTING_8};
use crate::scheduler::DriverCtx;
use crate::stats::StageId;
use crate::{
    BanditAlgo, BatchEncoding, FuzzError, FuzzParams, Outcome, ARITH_MAX, BATCH_ARMS,
    HAVOC_BLK_LARGE, HAVOC_BLK_MEDIUM, HAVOC_BLK_SMALL, HAVOC_BLK_XL, HAVOC_CYCLES,
    HAVOC_CYCLES_INIT, HAVOC_MIN, MAX_FILE, MIN_LEN_FOR_OPTIMIZED_RESTORE, NUM_LEN_BUCKETS,
    SPLICE_HAVOC,
};

/// The atomic havoc operators, one bandit arm each.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HavocOp {
    FlipBit1,
    Interesting8,
    Interesting16,
    Interesting16Be,
    Interesting32,
    Interesting32Be,
    Arith8Minus,
    Arith8Plus,
    Arith16Minus,
    Arith16BeMinus,
    Arith16Plus,
    Arith16BePlus,
    Arith32Minus,
    Arith32BeMinus,
    Arith32Plus,
    Arith32BePlus,
    Rand8,
    CloneBytes,
    InsertSameByte,
    OverwriteWithChunk,
    OverwriteWithSameByte,
    DeleteBytes,
    OverwriteWithExtra,
    InsertExtra,
    OverwriteWithAutoExtra,
    InsertAutoExtra,
    SpliceOverwrite,
    SpliceInsert,
}

pub(crate) const N_OPS: usize = 28;

pub(crate) const HAVOC_OPS: [HavocOp; N_OPS] = [
    HavocOp::FlipBit1,
    HavocOp::Interesting8,
    HavocOp::Interesting16,
    HavocOp::Interesting16Be,
    HavocOp::Interesting32,
    HavocOp::Interesting32Be,
    HavocOp::Arith8Minus,
    HavocOp::Arith8Plus,
    HavocOp::Arith16Minus,
    HavocOp::Arith16BeMinus,
    HavocOp::Arith16Plus,
    HavocOp::Arith16BePlus,
    HavocOp::Arith32Minus,
    HavocOp::Arith32BeMinus,
    HavocOp::Arith32Plus,
    HavocOp::Arith32BePlus,
    HavocOp::Rand8,
    HavocOp::CloneBytes,
    HavocOp::InsertSameByte,
    HavocOp::OverwriteWithChunk,
    HavocOp::OverwriteWithSameByte,
    HavocOp::DeleteBytes,
    HavocOp::OverwriteWithExtra,
    HavocOp::InsertExtra,
    HavocOp::OverwriteWithAutoExtra,
    HavocOp::InsertAutoExtra,
    HavocOp::SpliceOverwrite,
    HavocOp::SpliceInsert,
];

/// Both bandit decision points of the havoc loop: one operator selector,
/// and a batch-size selector per (input-length bucket, operator).
pub(crate) struct BanditSet {
    pub op: Bandit,
    pub batch: Vec<Vec<Bandit>>,
}

impl BanditSet {
    pub(crate) fn new(params: &FuzzParams) -> Self {
        Self {
            op: Bandit::new(params.mutation_algo, N_OPS),
            batch: (0..NUM_LEN_BUCKETS)
                .map(|_| {
                    (0..N_OPS)
                        .map(|_| Bandit::new(params.batch_algo, BATCH_ARMS))
                        .collect()
                })
                .collect(),
        }
    }
}

/// Bucket inputs by length so batch-size statistics do not mix regimes.
pub(crate) fn len_bucket(len: usize) -> usize {
    match len {
        0..=100 => 0,
        101..=1_000 => 1,
        1_001..=10_000 => 2,
        10_001..=100_000 => 3,
        _ => 4,
    }
}

fn stacking(encoding: BatchEncoding, arm: usize) -> u32 {
    match encoding {
        BatchEncoding::PowerOfTwo => 1 << arm,
        BatchEncoding::Linear => arm as u32 + 1,
    }
}

/// Tiered random block length, never zero. Early in a campaign only the
/// small tier is open; later the tier is drawn per call with a 10% chance
/// of the largest one.
pub(crate) fn choose_block_len(rng: &mut StdRng, limit: usize, campaign: &dyn Campaign) -> usize {
    let limit = limit.max(1);
    let mut rlim = campaign.queue_cycle().min(3).max(1) as usize;
    if !campaign.run_over_10m() {
        rlim = 1;
    }

    let (mut min_value, max_value) = match rng.gen_range(0..rlim) {
        0 => (1, HAVOC_BLK_SMALL),
        1 => (HAVOC_BLK_SMALL, HAVOC_BLK_MEDIUM),
        _ => {
            if rng.gen_range(0..10) != 0 {
                (HAVOC_BLK_MEDIUM, HAVOC_BLK_LARGE)
            } else {
                (HAVOC_BLK_LARGE, HAVOC_BLK_XL)
            }
        }
    };

    if min_value >= limit {
        min_value = 1;
    }

    min_value + rng.gen_range(0..max_value.min(limit) - min_value + 1)
}

/// Disable the arms whose preconditions do not hold right now.
fn op_mask(params: &FuzzParams, campaign: &dyn Campaign, temp_len: usize) -> [bool; N_OPS] {
    let mut mask = [false; N_OPS];
    let short2 = temp_len < 2;
    let short4 = temp_len < 4;
    let full = temp_len + HAVOC_BLK_XL >= MAX_FILE;
    let no_extras = campaign.extras().is_empty();
    let no_autos = campaign.auto_extras().is_empty();
    let ready = campaign.ready_for_splicing_count();

    for (i, op) in HAVOC_OPS.iter().enumerate() {
        mask[i] = match op {
            HavocOp::Interesting16
            | HavocOp::Interesting16Be
            | HavocOp::Arith16Minus
            | HavocOp::Arith16BeMinus
            | HavocOp::Arith16Plus
            | HavocOp::Arith16BePlus
            | HavocOp::OverwriteWithChunk
            | HavocOp::OverwriteWithSameByte
            | HavocOp::DeleteBytes => short2,
            HavocOp::Interesting32
            | HavocOp::Interesting32Be
            | HavocOp::Arith32Minus
            | HavocOp::Arith32BeMinus
            | HavocOp::Arith32Plus
            | HavocOp::Arith32BePlus => short4,
            HavocOp::CloneBytes | HavocOp::InsertSameByte => full,
            HavocOp::OverwriteWithExtra | HavocOp::InsertExtra => no_extras,
            HavocOp::OverwriteWithAutoExtra | HavocOp::InsertAutoExtra => no_autos,
            HavocOp::SpliceOverwrite => ready <= 1 || short2,
            HavocOp::SpliceInsert => ready <= 1 || full,
            _ => false,
        };
    }

    // With a uniform operator draw the expensive splice cases only join
    // the pool after the cheap ones went dry, as their yield rarely
    // justifies them earlier.
    if params.mutation_algo == BanditAlgo::Uniform && !params.expand_havoc && !campaign.dry_spell()
    {
        mask[HavocOp::SpliceOverwrite as usize] = true;
        mask[HavocOp::SpliceInsert as usize] = true;
    }

    mask
}

/// What it takes to undo one stacked batch.
enum Undo {
    Bit(Vec<usize>),
    Byte1(Vec<(usize, u8)>),
    Byte2(Vec<(usize, u16)>),
    Byte4(Vec<(usize, u32)>),
    Full,
}

/// Mutable state one havoc pass works on.
pub(crate) struct HavocCtx<'a> {
    /// Queue index of the entry under fuzz (excluded from splicing).
    pub entry_idx: usize,
    /// Restore source; equals the (possibly spliced) input of this pass.
    pub in_buf: &'a [u8],
    pub out_buf: &'a mut Vec<u8>,
    pub mask: &'a mut BranchMask,
    /// Mask restore source after size-changing batches.
    pub orig_mask: &'a BranchMask,
    pub perf_score: &'a mut f64,
    /// A full deterministic pass just ran; spend a bigger budget.
    pub doing_det: bool,
    /// Non-zero when re-entered from the splice stage.
    pub splice_cycle: u32,
}

/// Run one havoc pass. The buffer and mask are back to their pass-entry
/// state on return.
pub(crate) fn havoc_stage(
    drv: &mut DriverCtx<'_>,
    ctx: &mut HavocCtx<'_>,
    campaign: &mut dyn Campaign,
) -> Result<Outcome, FuzzError> {
    debug_assert_eq!(ctx.in_buf, &ctx.out_buf[..], "pass starts clean");

    let len = ctx.in_buf.len();
    let cycles = if ctx.splice_cycle > 0 {
        SPLICE_HAVOC
    } else if ctx.doing_det {
        HAVOC_CYCLES_INIT
    } else {
        HAVOC_CYCLES
    };
    let stage = if ctx.splice_cycle > 0 {
        StageId::Splice
    } else {
        StageId::Havoc
    };

    let mut stage_max = ((cycles as f64 * *ctx.perf_score / drv.params.havoc_div as f64 / 100.0)
        as u64)
        .max(HAVOC_MIN as u64);

    let start_hits = campaign.queued_paths() + campaign.unique_crashes();
    let mut havoc_queued = campaign.queued_paths();
    let mut execs = 0u64;
    let bucket = len_bucket(len);

    let mut stage_cur = 0u64;
    while stage_cur < stage_max {
        stage_cur += 1;

        let arm_mask = op_mask(drv.params, campaign, ctx.out_buf.len());
        let op_idx = match drv.bandits.op.select_arm(&mut *drv.rng, Some(&arm_mask)) {
            Some(i) => i,
            // A weight-based selector landed on a masked arm: skip the
            // iteration without reward or time step.
            None => continue,
        };
        let op = HAVOC_OPS[op_idx];

        let batch_arm = match drv.bandits.batch[bucket][op_idx].select_arm(&mut *drv.rng, None) {
            Some(a) => a,
            None => continue,
        };
        let use_stacking = stacking(drv.params.batch_encoding, batch_arm);

        #[cfg(feature = "detailed-havoc-tracing")]
        tracing::trace!(?op, use_stacking, len = ctx.out_buf.len(), "havoc iteration");

        let undo = apply_stacked(&mut *drv.rng, campaign, ctx, op, use_stacking)?;

        let verdict = campaign.run(ctx.out_buf)?;
        execs += 1;
        if verdict == Verdict::Abandon {
            drv.bandits.batch[bucket][op_idx].add_reward(batch_arm, false);
            drv.bandits.op.add_reward(op_idx, false);
            return Ok(Outcome::Abandon);
        }

        restore(ctx, undo);

        let reward = campaign.queued_paths() != havoc_queued;
        drv.bandits.batch[bucket][op_idx].add_reward(batch_arm, reward);
        drv.bandits.op.add_reward(op_idx, reward);

        if reward {
            // Finding things buys more budget, within the global cap.
            if *ctx.perf_score <= (drv.params.havoc_max_mult * 100) as f64 {
                stage_max *= 2;
                *ctx.perf_score *= 2.0;
            }
            havoc_queued = campaign.queued_paths();
        }
    }

    let finds = campaign.queued_paths() + campaign.unique_crashes() - start_hits;
    if finds > 0 {
        debug!(finds, execs, stage = ?stage, "havoc pass found new inputs");
    }
    drv.stats.record(stage, finds, execs);
    Ok(Outcome::Continue)
}

/// Undo one batch; below the optimization threshold everything is a full
/// copy restore.
fn restore(ctx: &mut HavocCtx<'_>, undo: Undo) {
    if ctx.in_buf.len() >= MIN_LEN_FOR_OPTIMIZED_RESTORE {
        match undo {
            Undo::Bit(positions) => {
                for &p in positions.iter().rev() {
                    flip_bit(ctx.out_buf, p);
                }
            }
            Undo::Byte1(writes) => {
                for &(p, v) in writes.iter().rev() {
                    ctx.out_buf[p] = v;
                }
            }
            Undo::Byte2(writes) => {
                for &(p, v) in writes.iter().rev() {
                    write_u16_le(ctx.out_buf, p, v);
                }
            }
            Undo::Byte4(writes) => {
                for &(p, v) in writes.iter().rev() {
                    write_u32_le(ctx.out_buf, p, v);
                }
            }
            Undo::Full => {
                ctx.out_buf.clear();
                ctx.out_buf.extend_from_slice(ctx.in_buf);
                *ctx.mask = ctx.orig_mask.clone();
            }
        }
    } else {
        ctx.out_buf.clear();
        ctx.out_buf.extend_from_slice(ctx.in_buf);
        *ctx.mask = ctx.orig_mask.clone();
    }
}

/// Apply `op` up to `n` times; a position query with no legal answer ends
/// the batch early.
fn apply_stacked(
    rng: &mut StdRng,
    campaign: &mut dyn Campaign,
    ctx: &mut HavocCtx<'_>,
    op: HavocOp,
    n: u32,
) -> Result<Undo, FuzzError> {
    let out = &mut *ctx.out_buf;
    let mask = &mut *ctx.mask;

    macro_rules! window {
        ($kind:expr, $width:expr) => {
            match mask.random_window_position(rng, $kind, $width) {
                Some(p) => p,
                None => break,
            }
        };
    }

    let undo = match op {
        HavocOp::FlipBit1 => {
            let mut log = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let bit = match mask.random_bit_position(rng) {
                    Some(b) => b,
                    None => break,
                };
                log.push(bit);
                flip_bit(out, bit);
            }
            Undo::Bit(log)
        }

        HavocOp::Interesting8 => {
            let mut log = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let pos = window!(MaskKind::Overwrite, 1);
                log.push((pos, out[pos]));
                out[pos] = INTERESTING_8[rng.gen_range(0..INTERESTING_8.len())] as u8;
            }
            Undo::Byte1(log)
        }

        HavocOp::Interesting16 | HavocOp::Interesting16Be => {
            let mut log = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let pos = window!(MaskKind::Overwrite, 2);
                log.push((pos, read_u16_le(out, pos)));
                let v = INTERESTING_16[rng.gen_range(0..INTERESTING_16.len())] as u16;
                let v = if op == HavocOp::Interesting16Be {
                    v.swap_bytes()
                } else {
                    v
                };
                write_u16_le(out, pos, v);
            }
            Undo::Byte2(log)
        }

        HavocOp::Interesting32 | HavocOp::Interesting32Be => {
            let mut log = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let pos = window!(MaskKind::Overwrite, 4);
                log.push((pos, read_u32_le(out, pos)));
                let v = INTERESTING_32[rng.gen_range(0..INTERESTING_32.len())] as u32;
                let v = if op == HavocOp::Interesting32Be {
                    v.swap_bytes()
                } else {
                    v
                };
                write_u32_le(out, pos, v);
            }
            Undo::Byte4(log)
        }

        HavocOp::Arith8Minus | HavocOp::Arith8Plus => {
            let mut log = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let pos = window!(MaskKind::Overwrite, 1);
                log.push((pos, out[pos]));
                let delta = 1 + rng.gen_range(0..ARITH_MAX) as u8;
                out[pos] = if op == HavocOp::Arith8Plus {
                    out[pos].wrapping_add(delta)
                } else {
                    out[pos].wrapping_sub(delta)
                };
            }
            Undo::Byte1(log)
        }

        HavocOp::Arith16Minus
        | HavocOp::Arith16BeMinus
        | HavocOp::Arith16Plus
        | HavocOp::Arith16BePlus => {
            let plus = matches!(op, HavocOp::Arith16Plus | HavocOp::Arith16BePlus);
            let be = matches!(op, HavocOp::Arith16BeMinus | HavocOp::Arith16BePlus);
            let mut log = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let pos = window!(MaskKind::Overwrite, 2);
                let orig = read_u16_le(out, pos);
                log.push((pos, orig));
                let delta = 1 + rng.gen_range(0..ARITH_MAX) as u16;
                let v = if be {
                    let x = orig.swap_bytes();
                    let x = if plus {
                        x.wrapping_add(delta)
                    } else {
                        x.wrapping_sub(delta)
                    };
                    x.swap_bytes()
                } else if plus {
                    orig.wrapping_add(delta)
                } else {
                    orig.wrapping_sub(delta)
                };
                write_u16_le(out, pos, v);
            }
            Undo::Byte2(log)
        }

        HavocOp::Arith32Minus
        | HavocOp::Arith32BeMinus
        | HavocOp::Arith32Plus
        | HavocOp::Arith32BePlus => {
            let plus = matches!(op, HavocOp::Arith32Plus | HavocOp::Arith32BePlus);
            let be = matches!(op, HavocOp::Arith32BeMinus | HavocOp::Arith32BePlus);
            let mut log = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let pos = window!(MaskKind::Overwrite, 4);
                let orig = read_u32_le(out, pos);
                log.push((pos, orig));
                let delta = 1 + rng.gen_range(0..ARITH_MAX);
                let v = if be {
                    let x = orig.swap_bytes();
                    let x = if plus {
                        x.wrapping_add(delta)
                    } else {
                        x.wrapping_sub(delta)
                    };
                    x.swap_bytes()
                } else if plus {
                    orig.wrapping_add(delta)
                } else {
                    orig.wrapping_sub(delta)
                };
                write_u32_le(out, pos, v);
            }
            Undo::Byte4(log)
        }

        HavocOp::Rand8 => {
            let mut log = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let pos = window!(MaskKind::Overwrite, 1);
                log.push((pos, out[pos]));
                // XOR with 1..255 so the write is never a no-op.
                out[pos] ^= 1 + rng.gen_range(0..255u8);
            }
            Undo::Byte1(log)
        }

        HavocOp::CloneBytes => {
            for _ in 0..n {
                if out.len() + HAVOC_BLK_XL >= MAX_FILE {
                    break;
                }
                let temp_len = out.len();
                let clone_len = choose_block_len(rng, temp_len, campaign);
                let clone_from = rng.gen_range(0..temp_len - clone_len + 1);
                let clone_to = match mask.random_insert_position(rng) {
                    Some(p) => p,
                    None => break,
                };
                let chunk = out[clone_from..clone_from + clone_len].to_vec();
                out.splice(clone_to..clone_to, chunk);
                mask.splice_in(clone_to, clone_len);
            }
            Undo::Full
        }

        HavocOp::InsertSameByte => {
            for _ in 0..n {
                if out.len() + HAVOC_BLK_XL >= MAX_FILE {
                    break;
                }
                let temp_len = out.len();
                let clone_len = choose_block_len(rng, HAVOC_BLK_XL, campaign);
                let clone_to = match mask.random_insert_position(rng) {
                    Some(p) => p,
                    None => break,
                };
                let byte = if rng.gen_range(0..2) == 1 {
                    rng.gen::<u8>()
                } else {
                    out[rng.gen_range(0..temp_len)]
                };
                out.splice(clone_to..clone_to, std::iter::repeat(byte).take(clone_len));
                mask.splice_in(clone_to, clone_len);
            }
            Undo::Full
        }

        HavocOp::OverwriteWithChunk => {
            for _ in 0..n {
                let temp_len = out.len();
                if temp_len < 2 {
                    break;
                }
                let copy_len = choose_block_len(rng, temp_len - 1, campaign);
                let copy_from = rng.gen_range(0..temp_len - copy_len + 1);
                let copy_to = window!(MaskKind::Overwrite, copy_len);
                if copy_from != copy_to {
                    out.copy_within(copy_from..copy_from + copy_len, copy_to);
                }
            }
            Undo::Full
        }

        HavocOp::OverwriteWithSameByte => {
            for _ in 0..n {
                let temp_len = out.len();
                if temp_len < 2 {
                    break;
                }
                let copy_len = choose_block_len(rng, temp_len - 1, campaign);
                let copy_to = window!(MaskKind::Overwrite, copy_len);
                let byte = if rng.gen_range(0..2) == 1 {
                    rng.gen::<u8>()
                } else {
                    out[rng.gen_range(0..temp_len)]
                };
                out[copy_to..copy_to + copy_len]
                    .iter_mut()
                    .for_each(|b| *b = byte);
            }
            Undo::Full
        }

        HavocOp::DeleteBytes => {
            for _ in 0..n {
                let temp_len = out.len();
                if temp_len < 2 {
                    break;
                }
                let del_len = choose_block_len(rng, temp_len - 1, campaign);
                let del_from = window!(MaskKind::Delete, del_len);
                out.drain(del_from..del_from + del_len);
                mask.remove(del_from, del_len);
            }
            Undo::Full
        }

        HavocOp::OverwriteWithExtra | HavocOp::OverwriteWithAutoExtra => {
            let extras = if op == HavocOp::OverwriteWithExtra {
                campaign.extras().to_vec()
            } else {
                campaign.auto_extras().to_vec()
            };
            for _ in 0..n {
                if extras.is_empty() {
                    break;
                }
                let extra = &extras[rng.gen_range(0..extras.len())];
                let elen = extra.len();
                if elen == 0 || elen > out.len() {
                    break;
                }
                let pos = window!(MaskKind::Overwrite, elen);
                out[pos..pos + elen].copy_from_slice(&extra.data);
            }
            Undo::Full
        }

        HavocOp::InsertExtra | HavocOp::InsertAutoExtra => {
            let extras = if op == HavocOp::InsertExtra {
                campaign.extras().to_vec()
            } else {
                campaign.auto_extras().to_vec()
            };
            for _ in 0..n {
                if extras.is_empty() {
                    break;
                }
                let extra = &extras[rng.gen_range(0..extras.len())];
                let elen = extra.len();
                if elen == 0 || out.len() + elen >= MAX_FILE {
                    break;
                }
                let at = match mask.random_insert_position(rng) {
                    Some(p) => p,
                    None => break,
                };
                out.splice(at..at, extra.data.iter().copied());
                mask.splice_in(at, elen);
            }
            Undo::Full
        }

        HavocOp::SpliceOverwrite => {
            for _ in 0..n {
                let temp_len = out.len();
                if temp_len < 2 {
                    break;
                }
                let (_, partner) = match pick_partner(rng, campaign, ctx.entry_idx) {
                    Some(p) => p,
                    None => break,
                };
                let mut copy_len = choose_block_len(rng, partner.len() - 1, campaign);
                copy_len = copy_len.min(temp_len);
                let copy_from = rng.gen_range(0..partner.len() - copy_len + 1);
                let copy_to = window!(MaskKind::Overwrite, copy_len);
                out[copy_to..copy_to + copy_len]
                    .copy_from_slice(&partner[copy_from..copy_from + copy_len]);
            }
            Undo::Full
        }

        HavocOp::SpliceInsert => {
            for _ in 0..n {
                if out.len() + HAVOC_BLK_XL >= MAX_FILE {
                    break;
                }
                let (_, partner) = match pick_partner(rng, campaign, ctx.entry_idx) {
                    Some(p) => p,
                    None => break,
                };
                let clone_len = choose_block_len(rng, partner.len(), campaign);
                let clone_from = rng.gen_range(0..partner.len() - clone_len + 1);
                let clone_to = match mask.random_insert_position(rng) {
                    Some(p) => p,
                    None => break,
                };
                out.splice(
                    clone_to..clone_to,
                    partner[clone_from..clone_from + clone_len].iter().copied(),
                );
                mask.splice_in(clone_to, clone_len);
            }
            Undo::Full
        }
    };

    Ok(undo)
}

/// A random other queue entry of splice-worthy length.
fn pick_partner(
    rng: &mut StdRng,
    campaign: &mut dyn Campaign,
    entry_idx: usize,
) -> Option<(usize, Vec<u8>)> {
    let n = campaign.queued_paths() as usize;
    if n < 2 {
        return None;
    }
    for _ in 0..32 {
        let tid = rng.gen_range(0..n);
        if tid == entry_idx || campaign.entry_input_len(tid) < 4 {
            continue;
        }
        return Some((tid, campaign.entry_bytes(tid)));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::testhooks::driver_ctx_for_tests;
    use crate::testutil::MockCampaign;
    use crate::StageStats;
    use rand::SeedableRng;

    fn run_havoc(
        params: &FuzzParams,
        campaign: &mut MockCampaign,
        input: &[u8],
        mask: BranchMask,
        perf: f64,
    ) -> (Vec<u8>, BranchMask) {
        let mut rng = StdRng::seed_from_u64(77);
        let mut stats = StageStats::new();
        let mut bandits = BanditSet::new(params);
        let mut drv = driver_ctx_for_tests(params, &mut rng, &mut stats, &mut bandits);

        let mut out = input.to_vec();
        let mut work_mask = mask.clone();
        let orig_mask = mask;
        let mut perf_score = perf;

        let mut ctx = HavocCtx {
            entry_idx: 0,
            in_buf: input,
            out_buf: &mut out,
            mask: &mut work_mask,
            orig_mask: &orig_mask,
            perf_score: &mut perf_score,
            doing_det: false,
            splice_cycle: 0,
        };
        let outcome = havoc_stage(&mut drv, &mut ctx, campaign).unwrap();
        assert_eq!(outcome, Outcome::Continue);
        (out, work_mask)
    }

    #[test]
    fn havoc_mutations_respect_the_overwrite_window() {
        // Only bytes 5..15 may be overwritten; nothing may be deleted or
        // inserted. Every executed candidate must differ from the input
        // only inside that window.
        let input: Vec<u8> = (0u8..20).collect();
        let mut mask = BranchMask::building(input.len());
        for i in 5..15 {
            mask.set(MaskKind::Overwrite, i);
        }

        let mut c = MockCampaign::new(8);
        c.record_executions = true;

        // perf 4000 → about ten thousand iterations.
        let (out, _) = run_havoc(&FuzzParams::default(), &mut c, &input, mask, 4000.0);

        assert!(c.executed.len() > 9_000);
        for cand in &c.executed {
            assert_eq!(cand.len(), input.len(), "size changed under a no-resize mask");
            for (i, (a, b)) in cand.iter().zip(input.iter()).enumerate() {
                if a != b {
                    assert!(
                        (5..15).contains(&i),
                        "byte {i} mutated outside the permitted window"
                    );
                }
            }
        }
        // The pass restores its working buffer.
        assert_eq!(out, input);
    }

    #[test]
    fn fine_grained_restore_round_trips() {
        let input: Vec<u8> = (0u8..=255).cycle().take(128).collect();
        let mask = BranchMask::permissive(input.len());

        let mut c = MockCampaign::new(8);
        let (out, final_mask) = run_havoc(&FuzzParams::default(), &mut c, &input, mask, 400.0);

        assert_eq!(out, input);
        assert_eq!(final_mask, BranchMask::permissive(input.len()));
    }

    #[test]
    fn abandon_mid_pass_propagates() {
        let input = vec![3u8; 80];
        let mask = BranchMask::permissive(input.len());

        let mut c = MockCampaign::new(8);
        c.abandon_after = Some(5);

        let params = FuzzParams::default();
        let mut rng = StdRng::seed_from_u64(1);
        let mut stats = StageStats::new();
        let mut bandits = BanditSet::new(&params);
        let mut drv = driver_ctx_for_tests(&params, &mut rng, &mut stats, &mut bandits);

        let mut out = input.clone();
        let mut work_mask = mask.clone();
        let orig_mask = mask;
        let mut perf = 100.0;
        let mut ctx = HavocCtx {
            entry_idx: 0,
            in_buf: &input,
            out_buf: &mut out,
            mask: &mut work_mask,
            orig_mask: &orig_mask,
            perf_score: &mut perf,
            doing_det: false,
            splice_cycle: 0,
        };
        let outcome = havoc_stage(&mut drv, &mut ctx, &mut c).unwrap();
        assert_eq!(outcome, Outcome::Abandon);
        assert_eq!(c.execs, 5);
    }

    #[test]
    fn finds_double_the_budget_once() {
        let input = vec![9u8; 100];
        let mask = BranchMask::permissive(input.len());

        let mut c = MockCampaign::new(8);
        // The third execution "finds" something.
        let mut countdown = 3;
        c.is_find = Box::new(move |_| {
            countdown -= 1;
            countdown == 0
        });

        let params = FuzzParams::default();
        let (out, _) = run_havoc(&params, &mut c, &input, mask, 100.0);
        assert_eq!(out, input);
        // Budget doubling: 256 base iterations became 512.
        assert!(c.execs >= 512, "execs: {}", c.execs);
    }

    #[test]
    fn block_lengths_stay_in_bounds() {
        let mut rng = StdRng::seed_from_u64(5);
        let c = MockCampaign::new(8);
        for limit in [1usize, 2, 7, 100, 5000] {
            for _ in 0..200 {
                let l = choose_block_len(&mut rng, limit, &c);
                assert!(l >= 1 && l <= limit.max(1), "len {l} for limit {limit}");
            }
        }
    }
}
