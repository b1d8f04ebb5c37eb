//! Weight-based adversarial bandits: Exp3++ and Exp3-IX
//!
//! Both policies keep a normalised weight vector over the arms and sample
//! from it; rewards are converted to losses and importance-weighted by the
//! probability of the pulled arm. Exp3++ additionally estimates per-arm
//! suboptimality gaps and mixes an exploration floor ε into the sampling
//! distribution ("trusts"). The exponential updates subtract the extremal
//! loss before exponentiation; this only rescales the weights ahead of
//! normalisation, so the sampling distribution matches the naive
//! formulation modulo rounding (checked in the tests below).
//!
//! A masked landing is a no-op skip: the time step is rolled back, no pull
//! is recorded, and the caller withholds the reward.

use rand::Rng;

/// Exp3++ gap-estimation exploration constant α.
const EXP_ALPHA: f64 = 3.0;
/// Exp3++ exploration-floor constant β.
const EXP_BETA: f64 = 256.0;
/// Lower bound of the raw reward range.
const EXP_LOWER: f64 = 0.0;
/// Width of the raw reward range.
const EXP_AMPLITUDE: f64 = 1.0;

/// Degenerate trust mass below which the distribution resets to uniform.
const TRUST_FLOOR: f64 = 1e-8;

#[inline]
fn div_inf(x: f64, y: f64) -> f64 {
    if y == 0.0 {
        f64::INFINITY
    } else {
        x / y
    }
}

// ============================================================================
// Exp3++
// ============================================================================

/// Exp3++ with per-arm gap estimates and an exploration floor.
#[derive(Clone, Debug)]
pub struct Exp3Pp {
    t: u64,
    weights: Vec<f64>,
    losses: Vec<f64>,
    unweighted_losses: Vec<f64>,
    trusts: Vec<f64>,
    pulls: Vec<u64>,
    total_rewards: Vec<u64>,
}

impl Exp3Pp {
    /// Uniform initial weights and trusts.
    pub fn new(n_arms: usize) -> Self {
        let uniform = 1.0 / n_arms as f64;
        Self {
            t: 0,
            weights: vec![uniform; n_arms],
            losses: vec![0.0; n_arms],
            unweighted_losses: vec![0.0; n_arms],
            trusts: vec![uniform; n_arms],
            pulls: vec![0; n_arms],
            total_rewards: vec![0; n_arms],
        }
    }

    /// Number of arms.
    pub fn n_arms(&self) -> usize {
        self.weights.len()
    }

    /// Pulls recorded for `arm`.
    pub fn pulls(&self, arm: usize) -> u64 {
        self.pulls[arm]
    }

    /// Current sampling distribution (for inspection and tests).
    pub fn trusts(&self) -> &[f64] {
        &self.trusts
    }

    fn eta(&self) -> f64 {
        let k = self.n_arms() as f64;
        0.5 * (k.ln() / k / (self.t + 1) as f64).sqrt()
    }

    /// `Δ_i = max(0, LCB_i − min_j UCB_j)` over the mean unweighted losses.
    fn gap_estimate(&self) -> Vec<f64> {
        let k = self.n_arms() as f64;
        let t = self.t as f64;

        let mut lcb = Vec::with_capacity(self.n_arms());
        let mut min_ucb = f64::INFINITY;
        for i in 0..self.n_arms() {
            let avg = div_inf(self.unweighted_losses[i], self.pulls[i] as f64);
            let expl = div_inf(EXP_ALPHA * t.ln() + k.ln(), 2.0 * self.pulls[i] as f64).sqrt();
            let ucb = (avg + expl).min(1.0);
            lcb.push((avg - expl).max(0.0));
            min_ucb = min_ucb.min(ucb);
        }

        lcb.into_iter().map(|l| (l - min_ucb).max(0.0)).collect()
    }

    /// Exploration floor `ε_i = min(1/2K, ½·sqrt(ln K / tK), β·ln t / (t·Δ_i²))`.
    fn epsilons(&self) -> Vec<f64> {
        let k = self.n_arms() as f64;
        let t = self.t as f64;
        let gaps = self.gap_estimate();

        let flat = (0.5 / k).min(0.5 * (k.ln() / t / k).sqrt());
        gaps.iter()
            .map(|&gap| flat.min(div_inf(EXP_BETA * t.ln(), t * gap * gap)))
            .collect()
    }

    /// Rebuild `τ_i = (1 − Σε)·w_i + ε_i`, renormalised; degenerate sums
    /// reset to uniform.
    fn update_trusts(&mut self) {
        let epsilons = self.epsilons();
        let eps_sum: f64 = epsilons.iter().sum();

        let mut sum = 0.0;
        for i in 0..self.n_arms() {
            self.trusts[i] = (1.0 - eps_sum) * self.weights[i] + epsilons[i];
            sum += self.trusts[i];
        }

        if sum < TRUST_FLOOR {
            let uniform = 1.0 / self.n_arms() as f64;
            self.trusts.iter_mut().for_each(|t| *t = uniform);
            sum = 1.0;
        }
        self.trusts.iter_mut().for_each(|t| *t /= sum);

        debug_assert!(
            (self.trusts.iter().sum::<f64>() - 1.0).abs() < 1e-6,
            "trusts must normalise"
        );
    }

    /// Choose an arm: round-robin until every arm was offered once, then
    /// sample from the trust distribution.
    ///
    /// A masked arm reached by sampling is a no-op skip; in the
    /// round-robin phase a masked slot is substituted by a uniform draw
    /// over the unmasked arms so a permanently disabled arm cannot stall
    /// the cold start.
    pub fn select_arm<R: Rng>(&mut self, rng: &mut R, mask: Option<&[bool]>) -> Option<usize> {
        self.t += 1;
        let choice = if self.t <= self.n_arms() as u64 {
            let rr = (self.t - 1) as usize;
            if mask.map_or(false, |m| m[rr]) {
                let open: Vec<usize> = (0..self.n_arms())
                    .filter(|&i| mask.map_or(true, |m| !m[i]))
                    .collect();
                if open.is_empty() {
                    self.t -= 1;
                    return None;
                }
                open[rng.gen_range(0..open.len())]
            } else {
                rr
            }
        } else {
            self.update_trusts();
            let sampled = sample_categorical(rng, &self.trusts);
            if mask.map_or(false, |m| m[sampled]) {
                self.t -= 1;
                return None;
            }
            sampled
        };

        self.pulls[choice] += 1;
        Some(choice)
    }

    /// Importance-weighted loss update followed by the exponential weight
    /// rebuild (extremal-loss shift for stability).
    pub fn add_reward(&mut self, arm: usize, reward: f64) {
        self.total_rewards[arm] += reward as u64;
        let reward = (reward - EXP_LOWER) / EXP_AMPLITUDE;
        let loss = 1.0 - reward;
        self.unweighted_losses[arm] += loss;
        self.losses[arm] += loss / self.trusts[arm];

        let eta = self.eta();
        let min_loss_eta = self
            .losses
            .iter()
            .map(|&l| -eta * l)
            .fold(f64::INFINITY, f64::min);

        let mut sum = 0.0;
        for i in 0..self.n_arms() {
            self.weights[i] = (-eta * self.losses[i] - min_loss_eta).exp();
            sum += self.weights[i];
        }
        self.weights.iter_mut().for_each(|w| *w /= sum);
    }
}

// ============================================================================
// Exp3-IX
// ============================================================================

/// Exp3-IX: implicit exploration via the γ term in the loss denominator.
#[derive(Clone, Debug)]
pub struct Exp3Ix {
    t: u64,
    weights: Vec<f64>,
    losses: Vec<f64>,
    pulls: Vec<u64>,
    total_rewards: Vec<u64>,
}

impl Exp3Ix {
    /// Uniform initial weights.
    pub fn new(n_arms: usize) -> Self {
        Self {
            t: 0,
            weights: vec![1.0 / n_arms as f64; n_arms],
            losses: vec![0.0; n_arms],
            pulls: vec![0; n_arms],
            total_rewards: vec![0; n_arms],
        }
    }

    /// Number of arms.
    pub fn n_arms(&self) -> usize {
        self.weights.len()
    }

    /// Pulls recorded for `arm`.
    pub fn pulls(&self, arm: usize) -> u64 {
        self.pulls[arm]
    }

    /// Current sampling distribution.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Sample an arm from the weight vector.
    pub fn select_arm<R: Rng>(&mut self, rng: &mut R, mask: Option<&[bool]>) -> Option<usize> {
        self.t += 1;
        let choice = sample_categorical(rng, &self.weights);

        if mask.map_or(false, |m| m[choice]) {
            self.t -= 1;
            return None;
        }
        self.pulls[choice] += 1;
        Some(choice)
    }

    /// `η_t = sqrt(2·ln K / K / t)`, `γ_t = η_t / 2`; the chosen arm's loss
    /// is discounted by `w + γ` and the weights rebuilt with the min-loss
    /// shift.
    pub fn add_reward(&mut self, arm: usize, reward: f64) {
        self.total_rewards[arm] += reward as u64;

        let k = self.n_arms() as f64;
        let eta = (2.0 * k.ln() / k / self.t as f64).sqrt();
        let gamma = eta / 2.0;

        let loss = (1.0 - reward) / (self.weights[arm] + gamma);
        self.losses[arm] += loss;

        let min_loss = self.losses.iter().copied().fold(f64::INFINITY, f64::min);

        let mut sum = 0.0;
        for i in 0..self.n_arms() {
            self.weights[i] = (-eta * (self.losses[i] - min_loss)).exp();
            sum += self.weights[i];
        }
        self.weights.iter_mut().for_each(|w| *w /= sum);

        debug_assert!(
            (self.weights.iter().sum::<f64>() - 1.0).abs() < 1e-6,
            "weights must normalise"
        );
    }
}

/// Walk the cumulative distribution; the final arm absorbs any rounding
/// slack.
fn sample_categorical<R: Rng>(rng: &mut R, probs: &[f64]) -> usize {
    let target = rng.gen::<f64>();
    let mut acc = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        acc += p;
        if target < acc {
            return i;
        }
    }
    probs.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn exppp_trusts_sum_to_one() {
        for &k in &[2usize, 3, 8] {
            let mut b = Exp3Pp::new(k);
            let mut rng = StdRng::seed_from_u64(k as u64);
            for step in 0..10_000u64 {
                let arm = match b.select_arm(&mut rng, None) {
                    Some(a) => a,
                    None => continue,
                };
                b.add_reward(arm, if (step + arm as u64) % 3 == 0 { 1.0 } else { 0.0 });
                if b.t > k as u64 {
                    let sum: f64 = b.trusts().iter().sum();
                    assert!((sum - 1.0).abs() < 1e-6, "K={k} step={step} sum={sum}");
                    assert!(b.trusts().iter().all(|&t| t >= 0.0));
                }
            }
        }
    }

    #[test]
    fn exppp_round_robins_first() {
        let mut b = Exp3Pp::new(4);
        let mut rng = StdRng::seed_from_u64(1);
        for expect in 0..4 {
            assert_eq!(b.select_arm(&mut rng, None), Some(expect));
            b.add_reward(expect, 0.0);
        }
    }

    #[test]
    fn expix_weights_stay_normalised_and_favor_low_loss() {
        let mut b = Exp3Ix::new(3);
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..5000 {
            let arm = b.select_arm(&mut rng, None).unwrap();
            // Arm 2 never loses; the others always lose.
            b.add_reward(arm, if arm == 2 { 1.0 } else { 0.0 });
        }
        let w = b.weights();
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-6);
        assert!(w[2] > w[0] && w[2] > w[1]);
        assert!(b.pulls(2) > b.pulls(0) && b.pulls(2) > b.pulls(1));
    }

    #[test]
    fn masked_landing_rolls_back_time() {
        let mut b = Exp3Ix::new(2);
        let mut rng = StdRng::seed_from_u64(3);
        let mask = [true, true];
        for _ in 0..50 {
            assert_eq!(b.select_arm(&mut rng, Some(&mask)), None);
        }
        assert_eq!(b.t, 0);
        assert_eq!(b.pulls(0) + b.pulls(1), 0);
    }

    #[test]
    fn shifted_update_matches_naive_softmax() {
        // Drive a copy of the loss vector through both formulations.
        let mut b = Exp3Ix::new(4);
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..200 {
            let arm = b.select_arm(&mut rng, None).unwrap();
            b.add_reward(arm, if arm % 2 == 0 { 1.0 } else { 0.0 });
        }

        let k = b.n_arms() as f64;
        let eta = (2.0 * k.ln() / k / b.t as f64).sqrt();
        let naive: Vec<f64> = b.losses.iter().map(|&l| (-eta * l).exp()).collect();
        let naive_sum: f64 = naive.iter().sum();

        for (w, n) in b.weights().iter().zip(naive.iter()) {
            assert!((w - n / naive_sum).abs() < 1e-9);
        }
    }
}
