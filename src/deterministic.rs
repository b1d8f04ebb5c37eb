//! Deterministic stage: walking flips, arithmetics, interesting values,
//! dictionary stages
//!
//! The sub-stages run in a fixed order so the redundancy predicates can
//! prune duplicates cheaply: every arithmetic candidate that a bit flip
//! would also produce is skipped, every interesting-value candidate that a
//! flip or an arithmetic step would produce is skipped, and so on. Two
//! classifications fall out of the walking flips for free:
//!
//! - the **effector map** (during the walking-byte flip): bytes whose full
//!   flip does not move the trace checksum are skipped by the expensive
//!   later sub-stages;
//! - the **branch mask** (rare-branch mode only): the walking-byte flip
//!   probes OVERWRITE safety, then two dedicated probe passes test DELETE
//!   and INSERT safety per position.
//!
//! Dictionary induction also rides along on the single-bit walk: runs of
//! bytes whose LSB flip keeps producing one distinctive trace checksum are
//! collected as candidate tokens.

use crate::branch_mask::MaskKind;
use crate::exec::{Campaign, Verdict};
use crate::queue::QueueEntry;
use crate::redundancy::{
    could_be_arith, could_be_bitflip, could_be_interest, INTERESTING_16, INTERESTING_32,
    INTERESTING_8,
};
use crate::scheduler::{BranchTries, DriverCtx};
use crate::stats::StageId;
use crate::{
    hash64, BranchMask, FuzzError, Outcome, ARITH_MAX, EFF_MAP_SCALE2, EFF_MAX_PERC, EFF_MIN_LEN,
    HASH_SEED, MAX_AUTO_EXTRA, MAX_DET_EXTRAS, MAX_FILE, MIN_AUTO_EXTRA, USE_AUTO_EXTRAS,
};

use rand::Rng;

/// Flip one bit, MSB-first within each byte.
#[inline]
pub(crate) fn flip_bit(buf: &mut [u8], bit: usize) {
    buf[bit >> 3] ^= 128 >> (bit & 7);
}

#[inline]
pub(crate) fn read_u16_le(buf: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([buf[i], buf[i + 1]])
}

#[inline]
pub(crate) fn write_u16_le(buf: &mut [u8], i: usize, v: u16) {
    buf[i..i + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn read_u32_le(buf: &[u8], i: usize) -> u32 {
    u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]])
}

#[inline]
pub(crate) fn write_u32_le(buf: &mut [u8], i: usize, v: u32) {
    buf[i..i + 4].copy_from_slice(&v.to_le_bytes());
}

/// Queue entries plus crashes: the signal that a stage found something.
#[inline]
fn hits_now(campaign: &dyn Campaign) -> u64 {
    campaign.queued_paths() + campaign.unique_crashes()
}

// ============================================================================
// Effector map
// ============================================================================

/// One flag per 8-byte block of the input; a set flag means flipping bytes
/// in the block changed the trace, so the block is worth the expensive
/// sub-stages.
#[derive(Clone, Debug)]
pub(crate) struct EffectorMap {
    flags: Vec<bool>,
    count: usize,
}

impl EffectorMap {
    /// Flag the first and last block unconditionally, as anchors.
    pub(crate) fn new(len: usize) -> Self {
        debug_assert!(len > 0);
        let blocks = (len >> EFF_MAP_SCALE2) + usize::from(len & ((1 << EFF_MAP_SCALE2) - 1) != 0);
        let mut flags = vec![false; blocks.max(1)];
        let mut count = 1;
        flags[0] = true;
        let last = (len - 1) >> EFF_MAP_SCALE2;
        if last != 0 {
            flags[last] = true;
            count += 1;
        }
        Self { flags, count }
    }

    #[inline]
    pub(crate) fn is_set(&self, byte: usize) -> bool {
        self.flags[byte >> EFF_MAP_SCALE2]
    }

    pub(crate) fn mark(&mut self, byte: usize) {
        let p = byte >> EFF_MAP_SCALE2;
        if !self.flags[p] {
            self.flags[p] = true;
            self.count += 1;
        }
    }

    /// Any flag set over the blocks spanned by `span_len` bytes at `start`?
    pub(crate) fn span_any(&self, start: usize, span_len: usize) -> bool {
        debug_assert!(span_len > 0);
        let first = start >> EFF_MAP_SCALE2;
        let last = (start + span_len - 1) >> EFF_MAP_SCALE2;
        self.flags[first..=last.min(self.flags.len() - 1)]
            .iter()
            .any(|&f| f)
    }

    /// Above the density threshold, skipping saves nothing; flag it all.
    pub(crate) fn maybe_collapse(&mut self) {
        if self.count != self.flags.len() && self.count * 100 / self.flags.len() > EFF_MAX_PERC {
            self.flags.iter_mut().for_each(|f| *f = true);
            self.count = self.flags.len();
        }
    }
}

// ============================================================================
// Stage context
// ============================================================================

/// Mutable state one deterministic pass works on.
pub(crate) struct DetCtx<'a> {
    pub entry: &'a mut QueueEntry,
    pub in_buf: &'a [u8],
    pub out_buf: &'a mut Vec<u8>,
    /// The rare branch being protected, if any.
    pub rb_target: Option<crate::BranchId>,
    /// Probe the target branch and record verdicts into `mask`.
    pub build_mask: bool,
    pub mask: &'a mut BranchMask,
    /// The single-bit walk already ran for this entry.
    pub skip_simple_bitflip: bool,
    /// Only the mask builder is wanted; everything else is skipped.
    pub rb_skip_deterministic: bool,
    pub tries: &'a mut BranchTries,
}

/// What the deterministic pass reports back to the driver.
pub(crate) struct DetResult {
    pub outcome: Outcome,
    /// All sub-stages ran to completion (the entry may be marked as
    /// having passed deterministic fuzzing).
    pub completed: bool,
}

const ABANDONED: DetResult = DetResult {
    outcome: Outcome::Abandon,
    completed: false,
};

/// Run the deterministic pipeline over one entry.
pub(crate) fn deterministic_stage(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
) -> Result<DetResult, FuzzError> {
    if !ctx.skip_simple_bitflip && bitflip_walk_1(drv, ctx, campaign)? == Outcome::Abandon {
        return Ok(ABANDONED);
    }

    if !ctx.rb_skip_deterministic {
        if bitflip_walk_n(drv, ctx, campaign, 2, StageId::Flip2)? == Outcome::Abandon {
            return Ok(ABANDONED);
        }
        if bitflip_walk_n(drv, ctx, campaign, 4, StageId::Flip4)? == Outcome::Abandon {
            return Ok(ABANDONED);
        }
    }

    // The walking-byte flip and its companion probes also run when the
    // rest of the stage is skipped: the branch mask is needed downstream.
    ctx.tries.reset();
    let mut eff = EffectorMap::new(ctx.out_buf.len());
    if byteflip_walk(drv, ctx, campaign, &mut eff)? == Outcome::Abandon {
        return Ok(ABANDONED);
    }
    if ctx.build_mask {
        if delete_probe(drv, ctx, campaign)? == Outcome::Abandon {
            return Ok(ABANDONED);
        }
        if insert_probe(drv, ctx, campaign)? == Outcome::Abandon {
            return Ok(ABANDONED);
        }
    }

    if ctx.rb_skip_deterministic {
        return Ok(DetResult {
            outcome: Outcome::Continue,
            completed: false,
        });
    }

    if wordflip_walk(drv, ctx, campaign, &eff, 2, StageId::Flip16)? == Outcome::Abandon {
        return Ok(ABANDONED);
    }
    if wordflip_walk(drv, ctx, campaign, &eff, 4, StageId::Flip32)? == Outcome::Abandon {
        return Ok(ABANDONED);
    }

    if !drv.params.no_arith {
        if arith_8(drv, ctx, campaign, &eff)? == Outcome::Abandon {
            return Ok(ABANDONED);
        }
        if arith_16(drv, ctx, campaign, &eff)? == Outcome::Abandon {
            return Ok(ABANDONED);
        }
        if arith_32(drv, ctx, campaign, &eff)? == Outcome::Abandon {
            return Ok(ABANDONED);
        }
    }

    if interest_8(drv, ctx, campaign, &eff)? == Outcome::Abandon {
        return Ok(ABANDONED);
    }
    if !drv.params.no_arith {
        if interest_16(drv, ctx, campaign, &eff)? == Outcome::Abandon {
            return Ok(ABANDONED);
        }
        if interest_32(drv, ctx, campaign, &eff)? == Outcome::Abandon {
            return Ok(ABANDONED);
        }
    }

    if extras_overwrite(drv, ctx, campaign, &eff)? == Outcome::Abandon {
        return Ok(ABANDONED);
    }
    if extras_insert(drv, ctx, campaign)? == Outcome::Abandon {
        return Ok(ABANDONED);
    }
    if auto_extras_overwrite(drv, ctx, campaign, &eff)? == Outcome::Abandon {
        return Ok(ABANDONED);
    }

    Ok(DetResult {
        outcome: Outcome::Continue,
        completed: true,
    })
}

// ============================================================================
// Walking flips
// ============================================================================

/// Single walking bit, with dictionary induction on the LSB positions.
fn bitflip_walk_1(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
) -> Result<Outcome, FuzzError> {
    let start = hits_now(campaign);
    let len = ctx.out_buf.len();
    let max = len * 8;
    let mut execs = 0u64;

    let mut prev_cksum = ctx.entry.exec_cksum;
    let mut collect: Vec<u8> = Vec::new();
    let mut a_len = 0usize;

    for cur in 0..max {
        flip_bit(ctx.out_buf, cur);
        let verdict = campaign.run(ctx.out_buf)?;
        execs += 1;
        flip_bit(ctx.out_buf, cur);
        if verdict == Verdict::Abandon {
            return Ok(Outcome::Abandon);
        }

        // Induction rides on the least significant bit of each byte: a
        // run of bytes whose LSB flip produces one distinctive checksum
        // is likely an atomically-checked token.
        if !drv.params.non_instrumented && (cur & 7) == 7 {
            let cksum = hash64(campaign.trace_bits(), HASH_SEED);

            if cur == max - 1 && cksum == prev_cksum {
                if a_len < MAX_AUTO_EXTRA {
                    collect.push(ctx.out_buf[cur >> 3]);
                }
                a_len += 1;
                if (MIN_AUTO_EXTRA..=MAX_AUTO_EXTRA).contains(&a_len) {
                    campaign.maybe_add_auto(&collect);
                }
            } else if cksum != prev_cksum {
                if (MIN_AUTO_EXTRA..=MAX_AUTO_EXTRA).contains(&a_len) {
                    campaign.maybe_add_auto(&collect);
                }
                collect.clear();
                a_len = 0;
                prev_cksum = cksum;
            }

            if cksum != ctx.entry.exec_cksum {
                if a_len < MAX_AUTO_EXTRA {
                    collect.push(ctx.out_buf[cur >> 3]);
                }
                a_len += 1;
            }
        }
    }

    drv.stats
        .record(StageId::Flip1, hits_now(campaign) - start, execs);
    Ok(Outcome::Continue)
}

/// Walking 2-bit / 4-bit flips.
fn bitflip_walk_n(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
    width: usize,
    stage: StageId,
) -> Result<Outcome, FuzzError> {
    let start = hits_now(campaign);
    let max = (ctx.out_buf.len() * 8).saturating_sub(width - 1);
    let mut execs = 0u64;

    for cur in 0..max {
        for b in 0..width {
            flip_bit(ctx.out_buf, cur + b);
        }
        let verdict = campaign.run(ctx.out_buf)?;
        execs += 1;
        for b in 0..width {
            flip_bit(ctx.out_buf, cur + b);
        }
        if verdict == Verdict::Abandon {
            return Ok(Outcome::Abandon);
        }
    }

    drv.stats.record(stage, hits_now(campaign) - start, execs);
    Ok(Outcome::Continue)
}

/// Walking byte flip; builds the effector map and, in rare-branch mode,
/// the OVERWRITE half of the branch mask.
fn byteflip_walk(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
    eff: &mut EffectorMap,
) -> Result<Outcome, FuzzError> {
    let start = hits_now(campaign);
    let len = ctx.out_buf.len();
    let mut execs = 0u64;

    for i in 0..len {
        ctx.out_buf[i] ^= 0xff;
        let verdict = campaign.run(ctx.out_buf)?;
        execs += 1;
        if verdict == Verdict::Abandon {
            ctx.out_buf[i] ^= 0xff;
            return Ok(Outcome::Abandon);
        }

        if ctx.build_mask {
            let target = ctx.rb_target.expect("mask building implies a target");
            ctx.tries.total += 1;
            if campaign.hits_branch(target) {
                ctx.mask.set(MaskKind::Overwrite, i);
                ctx.tries.successful += 1;
            }
        }

        if !eff.is_set(i) {
            // Short or uninstrumented inputs skip the checksum and flag
            // everything.
            let cksum = if !drv.params.non_instrumented && len >= EFF_MIN_LEN {
                hash64(campaign.trace_bits(), HASH_SEED)
            } else {
                !ctx.entry.exec_cksum
            };
            if cksum != ctx.entry.exec_cksum {
                eff.mark(i);
            }
        }

        ctx.out_buf[i] ^= 0xff;
    }

    eff.maybe_collapse();
    drv.stats
        .record(StageId::Flip8, hits_now(campaign) - start, execs);
    Ok(Outcome::Continue)
}

/// Walking 16-bit / 32-bit flips over effector-worthy, mask-permitted
/// positions.
fn wordflip_walk(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
    eff: &EffectorMap,
    width: usize,
    stage: StageId,
) -> Result<Outcome, FuzzError> {
    let len = ctx.out_buf.len();
    if len < width {
        return Ok(Outcome::Continue);
    }

    let start = hits_now(campaign);
    let mut execs = 0u64;

    for i in 0..=len - width {
        if !(i..i + width).any(|b| eff.is_set(b)) {
            continue;
        }
        if !ctx.mask.allows_overwrite_run(i, width) {
            continue;
        }

        for b in i..i + width {
            ctx.out_buf[b] ^= 0xff;
        }
        let verdict = campaign.run(ctx.out_buf)?;
        execs += 1;
        for b in i..i + width {
            ctx.out_buf[b] ^= 0xff;
        }
        if verdict == Verdict::Abandon {
            return Ok(Outcome::Abandon);
        }
    }

    drv.stats.record(stage, hits_now(campaign) - start, execs);
    Ok(Outcome::Continue)
}

// ============================================================================
// Branch-mask probes
// ============================================================================

/// Can each byte be deleted with the target branch still taken?
fn delete_probe(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
) -> Result<Outcome, FuzzError> {
    let target = ctx.rb_target.expect("mask building implies a target");
    let start = hits_now(campaign);
    let len = ctx.out_buf.len();
    let mut execs = 0u64;

    for i in 0..len {
        let mut candidate = Vec::with_capacity(len - 1);
        candidate.extend_from_slice(&ctx.out_buf[..i]);
        candidate.extend_from_slice(&ctx.out_buf[i + 1..]);

        let verdict = campaign.run(&candidate)?;
        execs += 1;
        if verdict == Verdict::Abandon {
            return Ok(Outcome::Abandon);
        }

        ctx.tries.total += 1;
        if campaign.hits_branch(target) {
            ctx.mask.set(MaskKind::Delete, i);
            ctx.tries.successful += 1;
        }
    }

    drv.stats
        .record(StageId::RbRemove8, hits_now(campaign) - start, execs);
    Ok(Outcome::Continue)
}

/// Can a random byte be inserted before each position (the end included)
/// with the target branch still taken?
fn insert_probe(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
) -> Result<Outcome, FuzzError> {
    let target = ctx.rb_target.expect("mask building implies a target");
    let start = hits_now(campaign);
    let len = ctx.out_buf.len();
    let mut execs = 0u64;

    for i in 0..=len {
        let mut candidate = Vec::with_capacity(len + 1);
        candidate.extend_from_slice(&ctx.out_buf[..i]);
        candidate.push(drv.rng.gen::<u8>());
        candidate.extend_from_slice(&ctx.out_buf[i..]);

        let verdict = campaign.run(&candidate)?;
        execs += 1;
        if verdict == Verdict::Abandon {
            return Ok(Outcome::Abandon);
        }

        ctx.tries.total += 1;
        if campaign.hits_branch(target) {
            ctx.mask.set(MaskKind::Insert, i);
            ctx.tries.successful += 1;
        }
    }

    drv.stats
        .record(StageId::RbInsert8, hits_now(campaign) - start, execs);
    Ok(Outcome::Continue)
}

// ============================================================================
// Arithmetics
// ============================================================================

fn arith_8(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
    eff: &EffectorMap,
) -> Result<Outcome, FuzzError> {
    let start = hits_now(campaign);
    let len = ctx.out_buf.len();
    let mut execs = 0u64;

    for i in 0..len {
        if !eff.is_set(i) || !ctx.mask.allows_overwrite_run(i, 1) {
            continue;
        }
        let orig = ctx.out_buf[i];

        for j in 1..=ARITH_MAX as u8 {
            let add = orig.wrapping_add(j);
            if !could_be_bitflip((orig ^ add) as u32) {
                ctx.out_buf[i] = add;
                if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                    ctx.out_buf[i] = orig;
                    return Ok(Outcome::Abandon);
                }
                execs += 1;
            }

            let sub = orig.wrapping_sub(j);
            if !could_be_bitflip((orig ^ sub) as u32) {
                ctx.out_buf[i] = sub;
                if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                    ctx.out_buf[i] = orig;
                    return Ok(Outcome::Abandon);
                }
                execs += 1;
            }

            ctx.out_buf[i] = orig;
        }
    }

    drv.stats
        .record(StageId::Arith8, hits_now(campaign) - start, execs);
    Ok(Outcome::Continue)
}

fn arith_16(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
    eff: &EffectorMap,
) -> Result<Outcome, FuzzError> {
    let len = ctx.out_buf.len();
    if len < 2 {
        return Ok(Outcome::Continue);
    }

    let start = hits_now(campaign);
    let mut execs = 0u64;

    for i in 0..len - 1 {
        if !(eff.is_set(i) || eff.is_set(i + 1)) || !ctx.mask.allows_overwrite_run(i, 2) {
            continue;
        }
        let orig = read_u16_le(ctx.out_buf, i);

        for j in 1..=ARITH_MAX as u16 {
            let r1 = orig ^ orig.wrapping_add(j);
            let r2 = orig ^ orig.wrapping_sub(j);
            let r3 = orig ^ orig.swap_bytes().wrapping_add(j).swap_bytes();
            let r4 = orig ^ orig.swap_bytes().wrapping_sub(j).swap_bytes();

            // Little endian, only when the carry crosses the low byte;
            // otherwise the 8-bit pass already did it.
            if (orig & 0xff) + j > 0xff && !could_be_bitflip(r1 as u32) {
                write_u16_le(ctx.out_buf, i, orig.wrapping_add(j));
                if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                    write_u16_le(ctx.out_buf, i, orig);
                    return Ok(Outcome::Abandon);
                }
                execs += 1;
            }
            if (orig & 0xff) < j && !could_be_bitflip(r2 as u32) {
                write_u16_le(ctx.out_buf, i, orig.wrapping_sub(j));
                if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                    write_u16_le(ctx.out_buf, i, orig);
                    return Ok(Outcome::Abandon);
                }
                execs += 1;
            }

            // Big endian.
            if (orig >> 8) + j > 0xff && !could_be_bitflip(r3 as u32) {
                write_u16_le(ctx.out_buf, i, orig.swap_bytes().wrapping_add(j).swap_bytes());
                if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                    write_u16_le(ctx.out_buf, i, orig);
                    return Ok(Outcome::Abandon);
                }
                execs += 1;
            }
            if (orig >> 8) < j && !could_be_bitflip(r4 as u32) {
                write_u16_le(ctx.out_buf, i, orig.swap_bytes().wrapping_sub(j).swap_bytes());
                if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                    write_u16_le(ctx.out_buf, i, orig);
                    return Ok(Outcome::Abandon);
                }
                execs += 1;
            }

            write_u16_le(ctx.out_buf, i, orig);
        }
    }

    drv.stats
        .record(StageId::Arith16, hits_now(campaign) - start, execs);
    Ok(Outcome::Continue)
}

fn arith_32(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
    eff: &EffectorMap,
) -> Result<Outcome, FuzzError> {
    let len = ctx.out_buf.len();
    if len < 4 {
        return Ok(Outcome::Continue);
    }

    let start = hits_now(campaign);
    let mut execs = 0u64;

    for i in 0..len - 3 {
        if !(i..i + 4).any(|b| eff.is_set(b)) || !ctx.mask.allows_overwrite_run(i, 4) {
            continue;
        }
        let orig = read_u32_le(ctx.out_buf, i);

        for j in 1..=ARITH_MAX {
            let r1 = orig ^ orig.wrapping_add(j);
            let r2 = orig ^ orig.wrapping_sub(j);
            let r3 = orig ^ orig.swap_bytes().wrapping_add(j).swap_bytes();
            let r4 = orig ^ orig.swap_bytes().wrapping_sub(j).swap_bytes();

            // Only when more than two bytes are affected; narrower
            // deltas belong to the 16-bit pass.
            if (orig & 0xffff) + j > 0xffff && !could_be_bitflip(r1) {
                write_u32_le(ctx.out_buf, i, orig.wrapping_add(j));
                if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                    write_u32_le(ctx.out_buf, i, orig);
                    return Ok(Outcome::Abandon);
                }
                execs += 1;
            }
            if (orig & 0xffff) < j && !could_be_bitflip(r2) {
                write_u32_le(ctx.out_buf, i, orig.wrapping_sub(j));
                if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                    write_u32_le(ctx.out_buf, i, orig);
                    return Ok(Outcome::Abandon);
                }
                execs += 1;
            }

            if (orig.swap_bytes() & 0xffff) + j > 0xffff && !could_be_bitflip(r3) {
                write_u32_le(ctx.out_buf, i, orig.swap_bytes().wrapping_add(j).swap_bytes());
                if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                    write_u32_le(ctx.out_buf, i, orig);
                    return Ok(Outcome::Abandon);
                }
                execs += 1;
            }
            if (orig.swap_bytes() & 0xffff) < j && !could_be_bitflip(r4) {
                write_u32_le(ctx.out_buf, i, orig.swap_bytes().wrapping_sub(j).swap_bytes());
                if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                    write_u32_le(ctx.out_buf, i, orig);
                    return Ok(Outcome::Abandon);
                }
                execs += 1;
            }

            write_u32_le(ctx.out_buf, i, orig);
        }
    }

    drv.stats
        .record(StageId::Arith32, hits_now(campaign) - start, execs);
    Ok(Outcome::Continue)
}

// ============================================================================
// Interesting values
// ============================================================================

fn interest_8(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
    eff: &EffectorMap,
) -> Result<Outcome, FuzzError> {
    let start = hits_now(campaign);
    let len = ctx.out_buf.len();
    let mut execs = 0u64;

    for i in 0..len {
        if !eff.is_set(i) || !ctx.mask.allows_overwrite_run(i, 1) {
            continue;
        }
        let orig = ctx.out_buf[i];

        for &v in INTERESTING_8.iter() {
            let v = v as u8;
            if could_be_bitflip((orig ^ v) as u32) || could_be_arith(orig as u32, v as u32, 1) {
                continue;
            }

            ctx.out_buf[i] = v;
            let verdict = campaign.run(ctx.out_buf)?;
            execs += 1;
            ctx.out_buf[i] = orig;
            if verdict == Verdict::Abandon {
                return Ok(Outcome::Abandon);
            }
        }
    }

    drv.stats
        .record(StageId::Interest8, hits_now(campaign) - start, execs);
    Ok(Outcome::Continue)
}

fn interest_16(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
    eff: &EffectorMap,
) -> Result<Outcome, FuzzError> {
    let len = ctx.out_buf.len();
    if len < 2 {
        return Ok(Outcome::Continue);
    }

    let start = hits_now(campaign);
    let mut execs = 0u64;

    for i in 0..len - 1 {
        if !(eff.is_set(i) || eff.is_set(i + 1)) || !ctx.mask.allows_overwrite_run(i, 2) {
            continue;
        }
        let orig = read_u16_le(ctx.out_buf, i);

        for &v in INTERESTING_16.iter() {
            let v = v as u16;

            if !could_be_bitflip((orig ^ v) as u32)
                && !could_be_arith(orig as u32, v as u32, 2)
                && !could_be_interest(orig as u32, v as u32, 2, false)
            {
                write_u16_le(ctx.out_buf, i, v);
                if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                    write_u16_le(ctx.out_buf, i, orig);
                    return Ok(Outcome::Abandon);
                }
                execs += 1;
            }

            let sv = v.swap_bytes();
            if v != sv
                && !could_be_bitflip((orig ^ sv) as u32)
                && !could_be_arith(orig as u32, sv as u32, 2)
                && !could_be_interest(orig as u32, sv as u32, 2, true)
            {
                write_u16_le(ctx.out_buf, i, sv);
                if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                    write_u16_le(ctx.out_buf, i, orig);
                    return Ok(Outcome::Abandon);
                }
                execs += 1;
            }
        }

        write_u16_le(ctx.out_buf, i, orig);
    }

    drv.stats
        .record(StageId::Interest16, hits_now(campaign) - start, execs);
    Ok(Outcome::Continue)
}

fn interest_32(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
    eff: &EffectorMap,
) -> Result<Outcome, FuzzError> {
    let len = ctx.out_buf.len();
    if len < 4 {
        return Ok(Outcome::Continue);
    }

    let start = hits_now(campaign);
    let mut execs = 0u64;

    for i in 0..len - 3 {
        if !(i..i + 4).any(|b| eff.is_set(b)) || !ctx.mask.allows_overwrite_run(i, 4) {
            continue;
        }
        let orig = read_u32_le(ctx.out_buf, i);

        for &v in INTERESTING_32.iter() {
            let v = v as u32;

            if !could_be_bitflip(orig ^ v)
                && !could_be_arith(orig, v, 4)
                && !could_be_interest(orig, v, 4, false)
            {
                write_u32_le(ctx.out_buf, i, v);
                if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                    write_u32_le(ctx.out_buf, i, orig);
                    return Ok(Outcome::Abandon);
                }
                execs += 1;
            }

            let sv = v.swap_bytes();
            if v != sv
                && !could_be_bitflip(orig ^ sv)
                && !could_be_arith(orig, sv, 4)
                && !could_be_interest(orig, sv, 4, true)
            {
                write_u32_le(ctx.out_buf, i, sv);
                if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                    write_u32_le(ctx.out_buf, i, orig);
                    return Ok(Outcome::Abandon);
                }
                execs += 1;
            }
        }

        write_u32_le(ctx.out_buf, i, orig);
    }

    drv.stats
        .record(StageId::Interest32, hits_now(campaign) - start, execs);
    Ok(Outcome::Continue)
}

// ============================================================================
// Dictionary stages
// ============================================================================

fn extras_overwrite(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
    eff: &EffectorMap,
) -> Result<Outcome, FuzzError> {
    let extras = campaign.extras().to_vec();
    if extras.is_empty() {
        return Ok(Outcome::Continue);
    }

    let start = hits_now(campaign);
    let len = ctx.out_buf.len();
    let mut execs = 0u64;

    for i in 0..len {
        let mut last_len = 0usize;

        // Extras are sorted by size, so longer tokens overwrite shorter
        // ones and one tail restore per position suffices.
        for extra in &extras {
            let elen = extra.len();
            let sampled_out = extras.len() > MAX_DET_EXTRAS
                && drv.rng.gen_range(0..extras.len()) >= MAX_DET_EXTRAS;
            if sampled_out
                || elen == 0
                || elen > len - i
                || ctx.out_buf[i..i + elen] == extra.data[..]
                || !eff.span_any(i, elen)
                || !ctx.mask.allows_overwrite_run(i, elen)
            {
                continue;
            }

            ctx.out_buf[i..i + elen].copy_from_slice(&extra.data);
            last_len = elen;

            if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                ctx.out_buf[i..i + last_len].copy_from_slice(&ctx.in_buf[i..i + last_len]);
                return Ok(Outcome::Abandon);
            }
            execs += 1;
        }

        ctx.out_buf[i..i + last_len].copy_from_slice(&ctx.in_buf[i..i + last_len]);
    }

    drv.stats
        .record(StageId::ExtrasOverwrite, hits_now(campaign) - start, execs);
    Ok(Outcome::Continue)
}

fn extras_insert(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
) -> Result<Outcome, FuzzError> {
    let extras = campaign.extras().to_vec();
    if extras.is_empty() {
        return Ok(Outcome::Continue);
    }

    let start = hits_now(campaign);
    let len = ctx.out_buf.len();
    let mut execs = 0u64;

    for i in 0..=len {
        if !ctx.mask.allows(MaskKind::Insert, i) {
            continue;
        }

        for extra in &extras {
            let elen = extra.len();
            if elen == 0 || len + elen > MAX_FILE {
                continue;
            }

            let mut candidate = Vec::with_capacity(len + elen);
            candidate.extend_from_slice(&ctx.out_buf[..i]);
            candidate.extend_from_slice(&extra.data);
            candidate.extend_from_slice(&ctx.out_buf[i..]);

            if campaign.run(&candidate)? == Verdict::Abandon {
                return Ok(Outcome::Abandon);
            }
            execs += 1;
        }
    }

    drv.stats
        .record(StageId::ExtrasInsert, hits_now(campaign) - start, execs);
    Ok(Outcome::Continue)
}

fn auto_extras_overwrite(
    drv: &mut DriverCtx<'_>,
    ctx: &mut DetCtx<'_>,
    campaign: &mut dyn Campaign,
    eff: &EffectorMap,
) -> Result<Outcome, FuzzError> {
    let autos = campaign.auto_extras();
    if autos.is_empty() {
        return Ok(Outcome::Continue);
    }
    let autos: Vec<_> = autos.iter().take(USE_AUTO_EXTRAS).cloned().collect();

    let start = hits_now(campaign);
    let len = ctx.out_buf.len();
    let mut execs = 0u64;

    for i in 0..len {
        let mut last_len = 0usize;

        for extra in &autos {
            let elen = extra.len();
            if elen == 0
                || elen > len - i
                || ctx.out_buf[i..i + elen] == extra.data[..]
                || !eff.span_any(i, elen)
                || !ctx.mask.allows_overwrite_run(i, elen)
            {
                continue;
            }

            ctx.out_buf[i..i + elen].copy_from_slice(&extra.data);
            last_len = elen;

            if campaign.run(ctx.out_buf)? == Verdict::Abandon {
                ctx.out_buf[i..i + last_len].copy_from_slice(&ctx.in_buf[i..i + last_len]);
                return Ok(Outcome::Abandon);
            }
            execs += 1;
        }

        ctx.out_buf[i..i + last_len].copy_from_slice(&ctx.in_buf[i..i + last_len]);
    }

    drv.stats.record(
        StageId::AutoExtrasOverwrite,
        hits_now(campaign) - start,
        execs,
    );
    Ok(Outcome::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch_mask::BranchMask;
    use crate::scheduler::testhooks::driver_ctx_for_tests;
    use crate::testutil::MockCampaign;
    use crate::{BranchId, FuzzParams};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn det_fixture<'a>(
        entry: &'a mut QueueEntry,
        in_buf: &'a [u8],
        out_buf: &'a mut Vec<u8>,
        mask: &'a mut BranchMask,
        tries: &'a mut BranchTries,
    ) -> DetCtx<'a> {
        DetCtx {
            entry,
            in_buf,
            out_buf,
            rb_target: None,
            build_mask: false,
            mask,
            skip_simple_bitflip: false,
            rb_skip_deterministic: false,
            tries,
        }
    }

    #[test]
    fn lsb_walk_induces_magic_token() {
        // "xxxxIHDRxxxx": touching any byte of the token steers the
        // target onto one distinctive path, touching the padding does
        // nothing.
        let input = b"xxxxIHDRxxxx".to_vec();
        let mut c = MockCampaign::new(8);
        c.oracle = Box::new(|data: &[u8]| {
            if data.len() >= 8 && data[4..8] != *b"IHDR" {
                vec![BranchId(1)]
            } else {
                vec![BranchId(0)]
            }
        });

        // Baseline checksum of the unmutated trace.
        let (_, _) = c.measure(&input).unwrap();
        let baseline = crate::hash64(c.trace_bits(), crate::HASH_SEED);

        let mut entry = QueueEntry::new(input.len(), 8);
        entry.exec_cksum = baseline;

        let mut out = input.clone();
        let mut mask = BranchMask::permissive(input.len());
        let mut tries = BranchTries::default();
        let mut ctx = det_fixture(&mut entry, &input, &mut out, &mut mask, &mut tries);

        let params = FuzzParams::default();
        let mut rng = StdRng::seed_from_u64(42);
        let mut stats = crate::StageStats::new();
        let mut bandits = crate::havoc::BanditSet::new(&params);
        let mut drv = driver_ctx_for_tests(&params, &mut rng, &mut stats, &mut bandits);

        bitflip_walk_1(&mut drv, &mut ctx, &mut c).unwrap();

        assert!(
            c.added_autos.iter().any(|t| t == b"IHDR"),
            "induced tokens: {:?}",
            c.added_autos
        );
        // The walk must leave the buffer untouched.
        assert_eq!(*ctx.out_buf, input);
    }

    #[test]
    fn byteflip_builds_overwrite_mask_for_guarded_branch() {
        // Branch 5 requires byte 2 to stay intact; everything else is
        // free to change.
        let input = vec![7u8; 8];
        let mut c = MockCampaign::new(8);
        c.oracle = Box::new(|data: &[u8]| {
            if data.len() >= 3 && data[2] == 7 {
                vec![BranchId(5)]
            } else {
                vec![BranchId(0)]
            }
        });

        let mut entry = QueueEntry::new(input.len(), 8);
        let mut out = input.clone();
        let mut mask = BranchMask::building(input.len());
        let mut tries = BranchTries::default();
        let mut ctx = det_fixture(&mut entry, &input, &mut out, &mut mask, &mut tries);
        ctx.rb_target = Some(BranchId(5));
        ctx.build_mask = true;

        let params = FuzzParams::default();
        let mut rng = StdRng::seed_from_u64(1);
        let mut stats = crate::StageStats::new();
        let mut bandits = crate::havoc::BanditSet::new(&params);
        let mut drv = driver_ctx_for_tests(&params, &mut rng, &mut stats, &mut bandits);

        let mut eff = EffectorMap::new(input.len());
        byteflip_walk(&mut drv, &mut ctx, &mut c, &mut eff).unwrap();

        for i in 0..8 {
            assert_eq!(
                ctx.mask.allows(MaskKind::Overwrite, i),
                i != 2,
                "byte {i} misclassified"
            );
        }
        assert!(ctx.tries.successful > 0);
    }

    #[test]
    fn delete_and_insert_probes_classify_positions() {
        // Branch 9 is taken while the buffer still starts with the magic
        // pair; the tail is padding.
        let input = b"MGpadding".to_vec();
        let mut c = MockCampaign::new(16);
        c.oracle = Box::new(|data: &[u8]| {
            if data.len() >= 2 && data[..2] == *b"MG" {
                vec![BranchId(9)]
            } else {
                vec![BranchId(0)]
            }
        });

        let mut entry = QueueEntry::new(input.len(), 16);
        let mut out = input.clone();
        let mut mask = BranchMask::building(input.len());
        let mut tries = BranchTries::default();
        let mut ctx = det_fixture(&mut entry, &input, &mut out, &mut mask, &mut tries);
        ctx.rb_target = Some(BranchId(9));
        ctx.build_mask = true;

        let params = FuzzParams::default();
        let mut rng = StdRng::seed_from_u64(2);
        let mut stats = crate::StageStats::new();
        let mut bandits = crate::havoc::BanditSet::new(&params);
        let mut drv = driver_ctx_for_tests(&params, &mut rng, &mut stats, &mut bandits);

        delete_probe(&mut drv, &mut ctx, &mut c).unwrap();
        insert_probe(&mut drv, &mut ctx, &mut c).unwrap();

        // Deleting a magic byte kills the branch; deleting padding is fine.
        assert!(!ctx.mask.allows(MaskKind::Delete, 0));
        assert!(!ctx.mask.allows(MaskKind::Delete, 1));
        for i in 2..input.len() {
            assert!(ctx.mask.allows(MaskKind::Delete, i));
        }
        // Inserting before the magic shifts it; inserting after is fine.
        assert!(!ctx.mask.allows(MaskKind::Insert, 0));
        for i in 2..=input.len() {
            assert!(ctx.mask.allows(MaskKind::Insert, i), "slot {i}");
        }
    }

    #[test]
    fn full_pass_restores_buffer_and_completes() {
        let input = b"deterministic-input!".to_vec();
        let mut c = MockCampaign::new(8);

        let mut entry = QueueEntry::new(input.len(), 8);
        let mut out = input.clone();
        let mut mask = BranchMask::permissive(input.len());
        let mut tries = BranchTries::default();
        let mut ctx = det_fixture(&mut entry, &input, &mut out, &mut mask, &mut tries);

        let params = FuzzParams::default();
        let mut rng = StdRng::seed_from_u64(3);
        let mut stats = crate::StageStats::new();
        let mut bandits = crate::havoc::BanditSet::new(&params);
        let mut drv = driver_ctx_for_tests(&params, &mut rng, &mut stats, &mut bandits);

        let res = deterministic_stage(&mut drv, &mut ctx, &mut c).unwrap();
        assert_eq!(res.outcome, Outcome::Continue);
        assert!(res.completed);
        assert_eq!(*ctx.out_buf, input);
        assert!(drv.stats.execs(StageId::Flip1) > 0);
        assert!(drv.stats.execs(StageId::Arith8) > 0);
    }

    #[test]
    fn effector_map_collapses_when_dense() {
        let mut eff = EffectorMap::new(160);
        for i in 0..152 {
            eff.mark(i);
        }
        eff.maybe_collapse();
        for i in 0..160 {
            assert!(eff.is_set(i));
        }
    }
}
