//! Affine-invariant ensemble MCMC sampler (Goodman & Weare 2010).
//!
//! The ensemble holds an even number of walkers split into two half-groups.
//! Each iteration updates one group using stretch-move proposals drawn
//! against the complementary group, evaluating proposal log-probabilities in
//! parallel via rayon, then repeats with the groups swapped. The [`Chain`]
//! records every iteration; burn-in and thinning are applied when flattening.

use crate::{Error, Result};
use indexmap::IndexMap;
use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Configuration for the stretch-move proposal.
///
/// The scale parameter `a` controls the proposal distribution
/// g(z) = 1/sqrt(z) on [1/a, a]. The default of 2.0 is the value recommended
/// by Goodman & Weare (2010).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StretchMove {
    pub a: f64,
}

impl Default for StretchMove {
    fn default() -> Self {
        Self { a: 2.0 }
    }
}

impl StretchMove {
    /// Create a stretch move with a custom scale parameter (must be > 1).
    pub fn new(a: f64) -> Result<Self> {
        if a <= 1.0 {
            return Err(Error::InvalidParameter(format!(
                "stretch move scale parameter must be > 1.0, got {}",
                a
            )));
        }
        Ok(Self { a })
    }

    /// Sample a stretch factor from g(z) by drawing u ~ Uniform(0,1) and
    /// setting z = ((a-1)u + 1)^2 / a.
    pub fn sample_z<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let u: f64 = rng.gen();
        ((self.a - 1.0) * u + 1.0).powi(2) / self.a
    }

    /// Metropolis-Hastings acceptance probability for a stretch move:
    /// min(1, z^(n_params - 1) * exp(log_prob_new - log_prob_old)).
    pub fn acceptance_probability(
        &self,
        z: f64,
        n_params: usize,
        log_prob_old: f64,
        log_prob_new: f64,
    ) -> f64 {
        if !log_prob_new.is_finite() {
            return 0.0;
        }
        let log_ratio = (n_params as f64 - 1.0) * z.ln() + (log_prob_new - log_prob_old);
        log_ratio.exp().min(1.0)
    }

    /// Propose y = c + z * (x - c) against a uniformly chosen complementary
    /// walker c. Returns the proposal and the stretch factor used.
    pub fn propose<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        current_pos: ArrayView1<f64>,
        complementary_positions: &Array2<f64>,
    ) -> (Array1<f64>, f64) {
        let z = self.sample_z(rng);
        let comp_idx = rng.gen_range(0..complementary_positions.nrows());
        let comp_pos = complementary_positions.row(comp_idx);
        let proposal = &comp_pos + z * (&current_pos - &comp_pos);
        (proposal, z)
    }
}

/// Instantaneous state of the walker ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleState {
    /// Walker positions, shape `(n_walkers, n_params)`.
    pub positions: Array2<f64>,
    /// Log-probability at each walker position.
    pub log_probs: Array1<f64>,
    /// Accepted proposals per walker.
    pub n_accepted: Vec<usize>,
    /// Total proposals per walker.
    pub n_proposed: Vec<usize>,
}

impl EnsembleState {
    pub fn n_walkers(&self) -> usize {
        self.positions.nrows()
    }

    pub fn n_params(&self) -> usize {
        self.positions.ncols()
    }

    /// Mean acceptance rate across walkers.
    pub fn mean_acceptance_rate(&self) -> f64 {
        let proposed: usize = self.n_proposed.iter().sum();
        if proposed == 0 {
            return 0.0;
        }
        let accepted: usize = self.n_accepted.iter().sum();
        accepted as f64 / proposed as f64
    }
}

/// Full history of the ensemble: one `(n_walkers, n_params)` position block
/// and one log-probability vector per iteration.
///
/// Every iteration is stored; burn-in discarding and thinning are applied by
/// [`Chain::flat_samples`] and friends, never when recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    samples: Vec<Array2<f64>>,
    log_probs: Vec<Array1<f64>>,
    param_names: Vec<String>,
    n_walkers: usize,
}

impl Chain {
    pub fn new(param_names: Vec<String>, n_walkers: usize) -> Self {
        Self {
            samples: Vec::new(),
            log_probs: Vec::new(),
            param_names,
            n_walkers,
        }
    }

    /// Record one iteration of the ensemble.
    pub fn push(&mut self, positions: Array2<f64>, log_probs: Array1<f64>) {
        self.samples.push(positions);
        self.log_probs.push(log_probs);
    }

    /// Number of recorded iterations.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn n_walkers(&self) -> usize {
        self.n_walkers
    }

    pub fn n_params(&self) -> usize {
        self.param_names.len()
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    /// Flatten the chain into `(n_kept * n_walkers, n_params)` samples,
    /// discarding the first `discard` iterations and keeping every `thin`-th
    /// one afterwards. `thin` is floored at 1 and `discard` is clamped below
    /// the chain length, so the result is never empty for a non-empty chain.
    pub fn flat_samples(&self, discard: usize, thin: usize) -> Array2<f64> {
        let thin = thin.max(1);
        let discard = discard.min(self.len().saturating_sub(1));
        let kept: Vec<&Array2<f64>> = self.samples[discard..].iter().step_by(thin).collect();
        let n_rows = kept.len() * self.n_walkers;
        let mut flat = Array2::zeros((n_rows, self.n_params()));
        for (it, block) in kept.iter().enumerate() {
            for w in 0..self.n_walkers {
                flat.row_mut(it * self.n_walkers + w).assign(&block.row(w));
            }
        }
        flat
    }

    /// Flattened log-probabilities matching [`Chain::flat_samples`] row for
    /// row.
    pub fn flat_log_probs(&self, discard: usize, thin: usize) -> Array1<f64> {
        let thin = thin.max(1);
        let discard = discard.min(self.len().saturating_sub(1));
        let kept: Vec<&Array1<f64>> = self.log_probs[discard..].iter().step_by(thin).collect();
        let mut flat = Array1::zeros(kept.len() * self.n_walkers);
        for (it, lp) in kept.iter().enumerate() {
            for w in 0..self.n_walkers {
                flat[it * self.n_walkers + w] = lp[w];
            }
        }
        flat
    }

    /// Integrated autocorrelation time per parameter, τ = 1 + 2 Σ ρ(k).
    ///
    /// The autocorrelation is computed per walker and averaged across the
    /// ensemble; positive lags are summed up to the first non-positive one.
    /// With fewer than 10 iterations after `discard` the estimate is
    /// meaningless and each parameter reports τ = 1.
    pub fn autocorr_time(&self, discard: usize) -> Array1<f64> {
        let n_params = self.n_params();
        if discard >= self.len() || self.len() - discard < 10 {
            return Array1::ones(n_params);
        }
        let n_keep = self.len() - discard;
        let max_lag = (n_keep / 2).min(100);

        let mut tau = Array1::ones(n_params);
        for param_idx in 0..n_params {
            let mut avg_autocorr = vec![0.0; max_lag];
            for walker_idx in 0..self.n_walkers {
                let chain: Vec<f64> = self.samples[discard..]
                    .iter()
                    .map(|block| block[[walker_idx, param_idx]])
                    .collect();
                let autocorr = compute_autocorrelation(&chain, max_lag);
                for (i, &ac) in autocorr.iter().enumerate() {
                    avg_autocorr[i] += ac / self.n_walkers as f64;
                }
            }

            // sum positive lags up to the first non-positive one
            let mut sum_autocorr = 0.0;
            for &ac in &avg_autocorr {
                if ac <= 0.0 {
                    break;
                }
                sum_autocorr += ac;
            }
            tau[param_idx] = 1.0 + 2.0 * sum_autocorr;
        }
        tau
    }

    /// Autocorrelation times keyed by parameter name, in parameter order.
    pub fn autocorr_time_by_name(&self, discard: usize) -> IndexMap<String, f64> {
        self.param_names
            .iter()
            .cloned()
            .zip(self.autocorr_time(discard))
            .collect()
    }

    /// Per-walker Gelman-Rubin statistic, shape `(n_walkers, n_params)`.
    ///
    /// Each entry is the variance of one walker's post-burn-in trace divided
    /// by the variance of the corresponding parameter across the flattened
    /// ensemble. Degenerate chains produce NaN or infinity through IEEE
    /// arithmetic; no entry ever panics.
    pub fn gelman_rubin(&self, discard: usize) -> Array2<f64> {
        let n_params = self.n_params();
        let discard = discard.min(self.len().saturating_sub(1));
        let n_keep = self.len() - discard;
        let mut rstat = Array2::zeros((self.n_walkers, n_params));

        for param_idx in 0..n_params {
            // between-chain variance of the flattened ensemble
            let flat: Vec<f64> = self.samples[discard..]
                .iter()
                .flat_map(|block| (0..self.n_walkers).map(move |w| block[[w, param_idx]]))
                .collect();
            let flat_mean = flat.iter().sum::<f64>() / flat.len() as f64;
            let between =
                flat.iter().map(|&x| (x - flat_mean).powi(2)).sum::<f64>() / flat.len() as f64;

            for walker_idx in 0..self.n_walkers {
                let chain: Vec<f64> = self.samples[discard..]
                    .iter()
                    .map(|block| block[[walker_idx, param_idx]])
                    .collect();
                let mean = chain.iter().sum::<f64>() / n_keep as f64;
                let within =
                    chain.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n_keep as f64;
                rstat[[walker_idx, param_idx]] = within / between;
            }
        }
        rstat
    }
}

/// Autocorrelation of a scalar chain at lags `1..=max_lag` (lag 0 is always
/// 1 and is not included). A zero-variance chain reports zeros.
fn compute_autocorrelation(chain: &[f64], max_lag: usize) -> Vec<f64> {
    let n = chain.len();
    let mean = chain.iter().sum::<f64>() / n as f64;
    let variance = chain.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n as f64;

    if variance == 0.0 {
        return vec![0.0; max_lag];
    }

    let mut autocorr = Vec::with_capacity(max_lag);
    for lag in 1..=max_lag {
        if lag >= n {
            autocorr.push(0.0);
            continue;
        }
        let mut covariance = 0.0;
        for i in 0..(n - lag) {
            covariance += (chain[i] - mean) * (chain[i + lag] - mean);
        }
        covariance /= (n - lag) as f64;
        autocorr.push(covariance / variance);
    }
    autocorr
}

/// The ensemble sampler itself: a log-probability function, a stretch-move
/// configuration and the evolving walker state plus recorded chain.
///
/// The log-probability function is shared across rayon workers, so it must be
/// `Sync`; callers that evaluate a stateful model clone it per evaluation.
pub struct EnsembleSampler<F>
where
    F: Fn(ArrayView1<f64>) -> f64 + Sync,
{
    log_prob: F,
    stretch: StretchMove,
    state: EnsembleState,
    chain: Chain,
}

impl<F> EnsembleSampler<F>
where
    F: Fn(ArrayView1<f64>) -> f64 + Sync,
{
    /// Create a sampler from initial walker positions of shape
    /// `(n_walkers, n_params)`. The walker count must be even and at least 2
    /// so the ensemble can be split into complementary half-groups. Initial
    /// log-probabilities are evaluated in parallel.
    pub fn new(initial: Array2<f64>, param_names: Vec<String>, log_prob: F) -> Result<Self> {
        let n_walkers = initial.nrows();
        let n_params = initial.ncols();
        if n_walkers < 2 || n_walkers % 2 != 0 {
            return Err(Error::Sampling(format!(
                "ensemble needs an even number of walkers >= 2, got {}",
                n_walkers
            )));
        }
        if param_names.len() != n_params {
            return Err(Error::Sampling(format!(
                "{} parameter names supplied for {} parameters",
                param_names.len(),
                n_params
            )));
        }

        let log_probs: Vec<f64> = (0..n_walkers)
            .into_par_iter()
            .map(|w| (log_prob)(initial.row(w)))
            .collect();
        if log_probs.iter().all(|lp| !lp.is_finite()) {
            return Err(Error::Sampling(
                "no walker starts at a position with finite log-probability".to_string(),
            ));
        }

        let chain = Chain::new(param_names, n_walkers);
        Ok(Self {
            log_prob,
            stretch: StretchMove::default(),
            state: EnsembleState {
                positions: initial,
                log_probs: Array1::from_vec(log_probs),
                n_accepted: vec![0; n_walkers],
                n_proposed: vec![0; n_walkers],
            },
            chain,
        })
    }

    /// Replace the default stretch-move configuration.
    pub fn with_stretch(mut self, stretch: StretchMove) -> Self {
        self.stretch = stretch;
        self
    }

    /// Advance the ensemble by one iteration: update the first half-group
    /// against the second, then the second against the updated first, and
    /// record the resulting state.
    pub fn step<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let half = self.state.n_walkers() / 2;
        let n = self.state.n_walkers();
        self.update_group(0..half, half..n, rng);
        self.update_group(half..n, 0..half, rng);
        self.chain
            .push(self.state.positions.clone(), self.state.log_probs.clone());
    }

    /// Run `n_iterations` steps.
    pub fn run<R: Rng + ?Sized>(&mut self, n_iterations: usize, rng: &mut R) {
        for _ in 0..n_iterations {
            self.step(rng);
        }
    }

    /// Iterations recorded so far.
    pub fn iteration(&self) -> usize {
        self.chain.len()
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn into_chain(self) -> Chain {
        self.chain
    }

    pub fn state(&self) -> &EnsembleState {
        &self.state
    }

    /// Update one half-group of walkers against the complementary group.
    /// Proposals are drawn serially (the RNG is not shared) and evaluated in
    /// parallel; accept/reject is applied serially afterwards.
    fn update_group<R: Rng + ?Sized>(
        &mut self,
        active: std::ops::Range<usize>,
        complementary: std::ops::Range<usize>,
        rng: &mut R,
    ) {
        let complementary_positions = self
            .state
            .positions
            .slice(ndarray::s![complementary, ..])
            .to_owned();

        let proposals: Vec<(Array1<f64>, f64)> = active
            .clone()
            .map(|i| {
                self.stretch
                    .propose(rng, self.state.positions.row(i), &complementary_positions)
            })
            .collect();

        let proposal_log_probs: Vec<f64> = proposals
            .par_iter()
            .map(|(p, _)| (self.log_prob)(p.view()))
            .collect();

        let n_params = self.state.n_params();
        for (walker_idx, ((proposal, z), &log_prob_new)) in
            active.zip(proposals.iter().zip(proposal_log_probs.iter()))
        {
            let log_prob_old = self.state.log_probs[walker_idx];
            let accept_prob =
                self.stretch
                    .acceptance_probability(*z, n_params, log_prob_old, log_prob_new);

            self.state.n_proposed[walker_idx] += 1;
            if rng.gen::<f64>() < accept_prob {
                self.state.positions.row_mut(walker_idx).assign(proposal);
                self.state.log_probs[walker_idx] = log_prob_new;
                self.state.n_accepted[walker_idx] += 1;
            }
        }
    }
}
