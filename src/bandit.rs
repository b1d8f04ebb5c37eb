//! Index-based bandit policies and the tagged selector type
//!
//! Every selector exposes the same two operations: `select_arm(mask)`
//! returning an arm index, and `add_reward(arm, r)` with a binary reward.
//! A masked arm is simply never chosen by the index-based policies here;
//! the weight-based policies in [`crate::exp3`] instead surface a masked
//! landing as `None`, which the caller treats as a skipped iteration
//! (reward withheld, time not advanced).
//!
//! The discounted variants multiply their accumulators by γ on every
//! global pull, including pulls where the arm was skipped: an arm that is
//! never chosen still forgets.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rand_distr::Beta;
use tracing::debug;

use crate::adwin::{Adwin, AdwinConfig};
use crate::exp3::{Exp3Ix, Exp3Pp};
use crate::BanditAlgo;

// ============================================================================
// Arm state
// ============================================================================

/// Counters for the undiscounted policies.
#[derive(Clone, Debug, Default)]
pub struct NormalArm {
    /// Number of times this arm was pulled.
    pub num_selected: u64,
    /// Number of those pulls that were rewarded.
    pub total_rewards: u64,
    /// `total_rewards / num_selected`, maintained on update.
    pub sample_mean: f64,
}

/// Counters for the discounted policies; reward/loss accumulators decay
/// by γ on every global pull.
#[derive(Clone, Debug, Default)]
pub struct DiscountedArm {
    /// Undiscounted pull count (bookkeeping only).
    pub num_selected: u64,
    /// Undiscounted reward count (bookkeeping only).
    pub num_rewarded: u64,
    /// Discounted reward mass.
    pub total_rewards: f64,
    /// Discounted loss mass.
    pub total_losses: f64,
    /// Discounted pull mass.
    pub dis_num_selected: f64,
    /// `total_rewards / dis_num_selected`, maintained on update.
    pub sample_mean: f64,
}

/// An arm whose estimator is an ADWIN window instead of scalar counters.
#[derive(Clone, Debug)]
pub struct AdwinArm {
    /// Undiscounted pull count (bookkeeping only).
    pub num_selected: u64,
    /// Undiscounted reward count (bookkeeping only).
    pub total_rewards: u64,
    /// The adaptive window holding the reward history that still counts.
    pub adwin: Adwin,
}

// ============================================================================
// Policy configs
// ============================================================================

/// KL-UCB Newton-iteration tunables.
#[derive(Clone, Debug)]
pub struct KlUcbConfig {
    /// Clamping margin δ for the search interval `(p + δ, 1 − δ)`.
    pub delta: f64,
    /// Stop once `f(q)^2` falls below this tolerance.
    pub eps: f64,
    /// Iteration cap.
    pub max_iters: u32,
}

impl Default for KlUcbConfig {
    fn default() -> Self {
        Self {
            delta: 1e-6,
            eps: 1e-6,
            max_iters: 25,
        }
    }
}

/// Discounted-Thompson tunables.
#[derive(Clone, Debug)]
pub struct DtsConfig {
    /// Discount factor applied to every arm on every global pull.
    pub gamma: f64,
    /// dOTS: clamp each draw from below by the posterior mean of the same
    /// (discounted) Beta parameters.
    pub optimistic: bool,
}

impl Default for DtsConfig {
    fn default() -> Self {
        Self {
            gamma: 0.999,
            optimistic: false,
        }
    }
}

/// Discounted-Bayes-exploration tunables.
#[derive(Clone, Debug)]
pub struct DbeConfig {
    /// Discount factor applied to every arm on every global pull.
    pub gamma: f64,
}

impl Default for DbeConfig {
    fn default() -> Self {
        Self { gamma: 0.999 }
    }
}

// ============================================================================
// Policies
// ============================================================================

/// Uniform random choice among unmasked arms.
#[derive(Clone, Debug)]
pub struct UniformBandit {
    arms: Vec<NormalArm>,
}

/// UCB1.
#[derive(Clone, Debug)]
pub struct UcbBandit {
    arms: Vec<NormalArm>,
    time_step: u64,
}

/// KL-UCB: the index is the largest `q` with `n_i · KL(mean_i ‖ q) ≤ ln t`,
/// found by Newton iteration.
#[derive(Clone, Debug)]
pub struct KlUcbBandit {
    arms: Vec<NormalArm>,
    time_step: u64,
    cfg: KlUcbConfig,
}

/// Thompson sampling with Beta(rewards + 1, failures + 1) posteriors.
#[derive(Clone, Debug)]
pub struct ThompsonBandit {
    arms: Vec<NormalArm>,
}

/// Discounted Thompson sampling.
#[derive(Clone, Debug)]
pub struct DtsBandit {
    arms: Vec<DiscountedArm>,
    cfg: DtsConfig,
}

/// Discounted Bayes exploration: exponential weighting of discounted
/// means, with a reset once the weights degenerate.
#[derive(Clone, Debug)]
pub struct DbeBandit {
    arms: Vec<DiscountedArm>,
    cfg: DbeConfig,
}

/// Thompson sampling over per-arm ADWIN estimators.
#[derive(Clone, Debug)]
pub struct AdstsBandit {
    arms: Vec<AdwinArm>,
}

fn kl(p: f64, q: f64) -> f64 {
    p * (p / q).ln() + (1.0 - p) * ((1.0 - p) / (1.0 - q)).ln()
}

fn dkl(p: f64, q: f64) -> f64 {
    (q - p) / (q * (1.0 - q))
}

fn beta_draw<R: Rng>(rng: &mut R, a: f64, b: f64) -> f64 {
    Beta::new(a, b)
        .expect("beta parameters are positive")
        .sample(rng)
}

#[inline]
fn is_masked(mask: Option<&[bool]>, i: usize) -> bool {
    mask.map_or(false, |m| m[i])
}

impl UniformBandit {
    fn new(n_arms: usize) -> Self {
        Self {
            arms: vec![NormalArm::default(); n_arms],
        }
    }

    fn select<R: Rng>(&self, rng: &mut R, mask: Option<&[bool]>) -> Option<usize> {
        let cnt = (0..self.arms.len())
            .filter(|&i| !is_masked(mask, i))
            .count();
        if cnt == 0 {
            return None;
        }
        let mut k = rng.gen_range(0..cnt);
        for i in 0..self.arms.len() {
            if is_masked(mask, i) {
                continue;
            }
            if k == 0 {
                return Some(i);
            }
            k -= 1;
        }
        None
    }

    fn reward(&mut self, arm: usize, r: bool) {
        let a = &mut self.arms[arm];
        a.num_selected += 1;
        a.total_rewards += r as u64;
        a.sample_mean = a.total_rewards as f64 / a.num_selected as f64;
    }
}

impl UcbBandit {
    fn new(n_arms: usize) -> Self {
        Self {
            arms: vec![NormalArm::default(); n_arms],
            time_step: 0,
        }
    }

    fn select(&self, mask: Option<&[bool]>) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, arm) in self.arms.iter().enumerate() {
            if is_masked(mask, i) {
                continue;
            }
            if arm.num_selected == 0 {
                return Some(i);
            }
            let bound = arm.sample_mean
                + (2.0 * (self.time_step as f64).ln() / arm.num_selected as f64).sqrt();
            if best.map_or(true, |(_, b)| bound > b) {
                best = Some((i, bound));
            }
        }
        best.map(|(i, _)| i)
    }

    fn reward(&mut self, arm: usize, r: bool) {
        self.time_step += 1;
        let a = &mut self.arms[arm];
        a.num_selected += 1;
        a.total_rewards += r as u64;
        a.sample_mean = a.total_rewards as f64 / a.num_selected as f64;
    }
}

impl KlUcbBandit {
    fn new(n_arms: usize) -> Self {
        Self {
            arms: vec![NormalArm::default(); n_arms],
            time_step: 0,
            cfg: KlUcbConfig::default(),
        }
    }

    /// Solve `n_i · KL(p ‖ q) = ln t` for `q` by Newton iteration on
    /// `f(q) = ln(t)/n_i − KL(p, q)`, clamped to `(p + δ, 1 − δ)`.
    fn index(&self, arm: &NormalArm) -> f64 {
        let cfg = &self.cfg;
        let logndn = (self.time_step as f64).ln() / arm.num_selected as f64;
        let p = arm.sample_mean.max(cfg.delta);
        if p >= 1.0 {
            return 1.0;
        }

        let mut q = p + cfg.delta;
        for _ in 0..cfg.max_iters {
            let f = logndn - kl(p, q);
            let df = -dkl(p, q);
            if f * f < cfg.eps {
                break;
            }
            q -= f / df;
            q = q.clamp(p + cfg.delta, 1.0 - cfg.delta);
        }
        q
    }

    fn select(&self, mask: Option<&[bool]>) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, arm) in self.arms.iter().enumerate() {
            if is_masked(mask, i) {
                continue;
            }
            if arm.num_selected == 0 {
                return Some(i);
            }
            let bound = self.index(arm);
            if best.map_or(true, |(_, b)| bound > b) {
                best = Some((i, bound));
            }
        }
        best.map(|(i, _)| i)
    }

    fn reward(&mut self, arm: usize, r: bool) {
        self.time_step += 1;
        let a = &mut self.arms[arm];
        a.num_selected += 1;
        a.total_rewards += r as u64;
        a.sample_mean = a.total_rewards as f64 / a.num_selected as f64;
    }
}

impl ThompsonBandit {
    fn new(n_arms: usize) -> Self {
        Self {
            arms: vec![NormalArm::default(); n_arms],
        }
    }

    fn select<R: Rng>(&self, rng: &mut R, mask: Option<&[bool]>) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, arm) in self.arms.iter().enumerate() {
            if is_masked(mask, i) {
                continue;
            }
            let a = (arm.total_rewards + 1) as f64;
            let b = (arm.num_selected - arm.total_rewards + 1) as f64;
            let sampled = beta_draw(rng, a, b);
            if best.map_or(true, |(_, s)| sampled > s) {
                best = Some((i, sampled));
            }
        }
        best.map(|(i, _)| i)
    }

    fn reward(&mut self, arm: usize, r: bool) {
        let a = &mut self.arms[arm];
        a.num_selected += 1;
        a.total_rewards += r as u64;
        a.sample_mean = a.total_rewards as f64 / a.num_selected as f64;
    }
}

impl DtsBandit {
    fn new(n_arms: usize) -> Self {
        Self {
            arms: vec![DiscountedArm::default(); n_arms],
            cfg: DtsConfig::default(),
        }
    }

    fn select<R: Rng>(&mut self, rng: &mut R, mask: Option<&[bool]>) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, arm) in self.arms.iter().enumerate() {
            if is_masked(mask, i) {
                continue;
            }
            let a = arm.total_rewards + 1.0;
            let b = arm.total_losses + 1.0;
            let mut sampled = beta_draw(rng, a, b);
            if self.cfg.optimistic {
                // dOTS clamps the draw by the mean of the same posterior.
                let mean = a / (a + b);
                if sampled < mean {
                    sampled = mean;
                }
            }
            if best.map_or(true, |(_, s)| sampled > s) {
                best = Some((i, sampled));
            }
        }

        // Discount everything, the skipped arms included.
        for arm in &mut self.arms {
            arm.total_rewards *= self.cfg.gamma;
            arm.total_losses *= self.cfg.gamma;
        }

        best.map(|(i, _)| i)
    }

    fn reward(&mut self, arm: usize, r: bool) {
        let a = &mut self.arms[arm];
        a.num_selected += 1;
        a.num_rewarded += r as u64;
        // The select path already discounted this step's accumulators.
        a.total_rewards += r as u64 as f64;
        a.total_losses += (1 - r as u64) as f64;
    }
}

impl DbeBandit {
    fn new(n_arms: usize) -> Self {
        Self {
            arms: vec![DiscountedArm::default(); n_arms],
            cfg: DbeConfig::default(),
        }
    }

    fn select<R: Rng>(&mut self, rng: &mut R, mask: Option<&[bool]>) -> Option<usize> {
        let mut active = 0usize;
        let mut max_mean = 0.0f64;
        for (i, arm) in self.arms.iter().enumerate() {
            if is_masked(mask, i) {
                continue;
            }
            active += 1;
            if arm.dis_num_selected > 0.0 && arm.sample_mean > max_mean {
                max_mean = arm.sample_mean;
            }
        }
        if active == 0 {
            return None;
        }

        let mut redcoef = 1.0;
        if max_mean > 0.0 {
            redcoef = 1.0 / (2.0 * max_mean);
        }

        // Degenerate means make every weight collapse to 2^0; start over
        // from an optimistic prior instead.
        if redcoef > (1u64 << 30) as f64 {
            debug!("bayes-exploration reset: discounted means degenerated");
            for arm in &mut self.arms {
                arm.total_rewards = 1.0;
                arm.dis_num_selected = 1.0;
                arm.sample_mean = 1.0;
            }
        }

        // Unsampled arms first, uniformly.
        let unseen: Vec<usize> = (0..self.arms.len())
            .filter(|&i| !is_masked(mask, i) && self.arms[i].dis_num_selected <= 0.0)
            .collect();
        if !unseen.is_empty() {
            return Some(unseen[rng.gen_range(0..unseen.len())]);
        }

        let beta = (4 + 2 * active) as f64;
        let weights: Vec<f64> = self
            .arms
            .iter()
            .enumerate()
            .map(|(i, arm)| {
                if is_masked(mask, i) {
                    0.0
                } else {
                    2f64.powf(beta * redcoef * arm.sample_mean)
                }
            })
            .collect();

        let dist = WeightedIndex::new(&weights).expect("at least one active arm has weight");
        let index = dist.sample(rng);

        for arm in &mut self.arms {
            arm.total_rewards *= self.cfg.gamma;
            arm.dis_num_selected *= self.cfg.gamma;
        }

        Some(index)
    }

    fn reward(&mut self, arm: usize, r: bool) {
        let a = &mut self.arms[arm];
        a.num_selected += 1;
        a.num_rewarded += r as u64;
        a.total_rewards += r as u64 as f64;
        a.dis_num_selected += 1.0;
        a.sample_mean = a.total_rewards / a.dis_num_selected;
    }
}

impl AdstsBandit {
    fn new(n_arms: usize) -> Self {
        Self {
            arms: (0..n_arms)
                .map(|_| AdwinArm {
                    num_selected: 0,
                    total_rewards: 0,
                    adwin: Adwin::new(AdwinConfig::default()),
                })
                .collect(),
        }
    }

    fn select<R: Rng>(&self, rng: &mut R, mask: Option<&[bool]>) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, arm) in self.arms.iter().enumerate() {
            if is_masked(mask, i) {
                continue;
            }
            let rewards = arm.adwin.total_reward();
            let a = (rewards + 1) as f64;
            let b = (arm.adwin.len() - rewards + 1) as f64;
            let sampled = beta_draw(rng, a, b);
            if best.map_or(true, |(_, s)| sampled > s) {
                best = Some((i, sampled));
            }
        }
        best.map(|(i, _)| i)
    }

    fn reward(&mut self, arm: usize, r: bool) {
        let a = &mut self.arms[arm];
        a.num_selected += 1;
        a.total_rewards += r as u64;
        a.adwin.add(r);
    }
}

// ============================================================================
// The tagged selector
// ============================================================================

/// One bandit decision point: a closed family of policies behind
/// `select_arm` / `add_reward`.
#[derive(Clone, Debug)]
pub enum Bandit {
    /// Uniform random.
    Uniform(UniformBandit),
    /// UCB1.
    Ucb(UcbBandit),
    /// KL-UCB.
    KlUcb(KlUcbBandit),
    /// Thompson sampling.
    Thompson(ThompsonBandit),
    /// Discounted Thompson sampling.
    DiscountedThompson(DtsBandit),
    /// Discounted Bayes exploration.
    DiscountedBayes(DbeBandit),
    /// Thompson sampling over ADWIN estimators.
    AdwinThompson(AdstsBandit),
    /// Exp3++.
    Exp3Pp(Exp3Pp),
    /// Exp3-IX.
    Exp3Ix(Exp3Ix),
}

impl Bandit {
    /// Build a selector of the given family with `n_arms` arms.
    pub fn new(algo: BanditAlgo, n_arms: usize) -> Self {
        match algo {
            BanditAlgo::Uniform => Bandit::Uniform(UniformBandit::new(n_arms)),
            BanditAlgo::Ucb => Bandit::Ucb(UcbBandit::new(n_arms)),
            BanditAlgo::KlUcb => Bandit::KlUcb(KlUcbBandit::new(n_arms)),
            BanditAlgo::Thompson => Bandit::Thompson(ThompsonBandit::new(n_arms)),
            BanditAlgo::DiscountedThompson => Bandit::DiscountedThompson(DtsBandit::new(n_arms)),
            BanditAlgo::DiscountedBayes => Bandit::DiscountedBayes(DbeBandit::new(n_arms)),
            BanditAlgo::AdwinThompson => Bandit::AdwinThompson(AdstsBandit::new(n_arms)),
            BanditAlgo::Exp3Pp => Bandit::Exp3Pp(Exp3Pp::new(n_arms)),
            BanditAlgo::Exp3Ix => Bandit::Exp3Ix(Exp3Ix::new(n_arms)),
        }
    }

    /// Number of arms.
    pub fn n_arms(&self) -> usize {
        match self {
            Bandit::Uniform(b) => b.arms.len(),
            Bandit::Ucb(b) => b.arms.len(),
            Bandit::KlUcb(b) => b.arms.len(),
            Bandit::Thompson(b) => b.arms.len(),
            Bandit::DiscountedThompson(b) => b.arms.len(),
            Bandit::DiscountedBayes(b) => b.arms.len(),
            Bandit::AdwinThompson(b) => b.arms.len(),
            Bandit::Exp3Pp(b) => b.n_arms(),
            Bandit::Exp3Ix(b) => b.n_arms(),
        }
    }

    /// Choose an arm. `mask[i] == true` disables arm `i`.
    ///
    /// Index-based policies never return a masked arm; `None` means no arm
    /// was selectable. The weight-based policies sample from their trust
    /// distribution regardless of the mask and return `None` when the draw
    /// lands on a masked arm, with their time step rolled back so the
    /// skipped iteration leaves no trace.
    pub fn select_arm<R: Rng>(&mut self, rng: &mut R, mask: Option<&[bool]>) -> Option<usize> {
        match self {
            Bandit::Uniform(b) => b.select(rng, mask),
            Bandit::Ucb(b) => b.select(mask),
            Bandit::KlUcb(b) => b.select(mask),
            Bandit::Thompson(b) => b.select(rng, mask),
            Bandit::DiscountedThompson(b) => b.select(rng, mask),
            Bandit::DiscountedBayes(b) => b.select(rng, mask),
            Bandit::AdwinThompson(b) => b.select(rng, mask),
            Bandit::Exp3Pp(b) => b.select_arm(rng, mask),
            Bandit::Exp3Ix(b) => b.select_arm(rng, mask),
        }
    }

    /// Record the binary reward for a previously selected arm.
    pub fn add_reward(&mut self, arm: usize, reward: bool) {
        match self {
            Bandit::Uniform(b) => b.reward(arm, reward),
            Bandit::Ucb(b) => b.reward(arm, reward),
            Bandit::KlUcb(b) => b.reward(arm, reward),
            Bandit::Thompson(b) => b.reward(arm, reward),
            Bandit::DiscountedThompson(b) => b.reward(arm, reward),
            Bandit::DiscountedBayes(b) => b.reward(arm, reward),
            Bandit::AdwinThompson(b) => b.reward(arm, reward),
            Bandit::Exp3Pp(b) => b.add_reward(arm, if reward { 1.0 } else { 0.0 }),
            Bandit::Exp3Ix(b) => b.add_reward(arm, if reward { 1.0 } else { 0.0 }),
        }
    }

    /// Pulls recorded for one arm (test and introspection hook).
    pub fn pulls(&self, arm: usize) -> u64 {
        match self {
            Bandit::Uniform(b) => b.arms[arm].num_selected,
            Bandit::Ucb(b) => b.arms[arm].num_selected,
            Bandit::KlUcb(b) => b.arms[arm].num_selected,
            Bandit::Thompson(b) => b.arms[arm].num_selected,
            Bandit::DiscountedThompson(b) => b.arms[arm].num_selected,
            Bandit::DiscountedBayes(b) => b.arms[arm].num_selected,
            Bandit::AdwinThompson(b) => b.arms[arm].num_selected,
            Bandit::Exp3Pp(b) => b.pulls(arm),
            Bandit::Exp3Ix(b) => b.pulls(arm),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Bernoulli environment with fixed per-arm success rates.
    fn pull_loop(bandit: &mut Bandit, rates: &[f64], steps: usize, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..steps {
            let arm = bandit.select_arm(&mut rng, None).expect("arm available");
            let r = rng.gen::<f64>() < rates[arm];
            bandit.add_reward(arm, r);
        }
    }

    #[test]
    fn ucb_visits_every_arm_then_exploits() {
        let mut b = Bandit::new(BanditAlgo::Ucb, 3);
        let mut rng = StdRng::seed_from_u64(7);

        // Cold start walks the arms in index order.
        for expect in 0..3 {
            let arm = b.select_arm(&mut rng, None).unwrap();
            assert_eq!(arm, expect);
            b.add_reward(arm, [false, false, true][arm]);
        }

        pull_loop(&mut b, &[0.1, 0.5, 0.9], 97, 7);
        let pulls: Vec<u64> = (0..3).map(|i| b.pulls(i)).collect();
        assert!(pulls[2] > pulls[0] && pulls[2] > pulls[1], "pulls: {pulls:?}");
    }

    #[test]
    fn thompson_prefers_the_better_arm() {
        let mut b = Bandit::new(BanditAlgo::Thompson, 2);
        pull_loop(&mut b, &[0.05, 0.8], 400, 11);
        assert!(b.pulls(1) > 3 * b.pulls(0));
    }

    #[test]
    fn klucb_prefers_the_better_arm() {
        let mut b = Bandit::new(BanditAlgo::KlUcb, 3);
        pull_loop(&mut b, &[0.1, 0.2, 0.9], 600, 13);
        assert!(b.pulls(2) > b.pulls(0) + b.pulls(1));
    }

    #[test]
    fn masked_arms_are_never_selected() {
        for algo in [
            BanditAlgo::Uniform,
            BanditAlgo::Ucb,
            BanditAlgo::KlUcb,
            BanditAlgo::Thompson,
            BanditAlgo::DiscountedThompson,
            BanditAlgo::DiscountedBayes,
            BanditAlgo::AdwinThompson,
        ] {
            let mut b = Bandit::new(algo, 4);
            let mut rng = StdRng::seed_from_u64(3);
            let mask = [false, true, false, true];
            for _ in 0..200 {
                let arm = b.select_arm(&mut rng, Some(&mask)).unwrap();
                assert!(!mask[arm], "{algo:?} picked masked arm {arm}");
                b.add_reward(arm, arm == 2);
            }
        }
    }

    #[test]
    fn dts_accumulators_decay() {
        let mut b = Bandit::new(BanditAlgo::DiscountedThompson, 2);
        pull_loop(&mut b, &[1.0, 1.0], 500, 5);
        if let Bandit::DiscountedThompson(d) = &b {
            for arm in &d.arms {
                // Always-rewarded arms would hold `num_rewarded` mass
                // without the discount.
                assert!(arm.total_rewards < arm.num_rewarded as f64 || arm.num_rewarded == 0);
            }
        } else {
            unreachable!()
        }
    }

    #[test]
    fn dbe_tries_unseen_arms_first() {
        let mut b = Bandit::new(BanditAlgo::DiscountedBayes, 3);
        let mut rng = StdRng::seed_from_u64(17);
        let mut seen = [false; 3];
        for _ in 0..3 {
            let arm = b.select_arm(&mut rng, None).unwrap();
            assert!(!seen[arm], "unseen arm revisited during cold start");
            seen[arm] = true;
            b.add_reward(arm, true);
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn adwin_thompson_tracks_a_regime_change() {
        let mut b = Bandit::new(BanditAlgo::AdwinThompson, 2);
        let mut rng = StdRng::seed_from_u64(23);
        // Arm 0 pays first, then goes silent while arm 1 starts paying.
        for step in 0..1200usize {
            let arm = b.select_arm(&mut rng, None).unwrap();
            let r = if step < 600 { arm == 0 } else { arm == 1 };
            b.add_reward(arm, r);
        }
        if let Bandit::AdwinThompson(a) = &b {
            let est0 = a.arms[0].adwin.estimation();
            let est1 = a.arms[1].adwin.estimation();
            assert!(est1 > est0, "windowed means did not cross: {est0} vs {est1}");
        } else {
            unreachable!()
        }
    }
}
