//! The inference engine: maximum-likelihood fitting, ensemble MCMC with
//! automated convergence detection, and posterior-predictive simulation.
//!
//! [`GPModelling`] owns a lightcurve and a [`GpModel`] and drives the whole
//! pipeline. The model is mutated in place before every likelihood read, so
//! parallel evaluations each work on a private clone; rayon pools are built
//! per call and torn down before the method returns, on every exit path.

use crate::lightcurve::GappyLightcurve;
use crate::model::GpModel;
use crate::optimizer::{fit_ml, FitResult};
use crate::sampler::{Chain, EnsembleSampler};
use crate::simulator::{NoisePdf, Simulator, SimulatorFactory};
use crate::{Error, Result};
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

/// Iterations between autocorrelation-based convergence checks.
const CONVERGENCE_CHECK_INTERVAL: usize = 500;

/// Convergence needs the chain to be this many autocorrelation times long.
const CONVERGENCE_TAU_FACTOR: f64 = 100.0;

/// Relative change in tau below which the estimate counts as stable.
const CONVERGENCE_TAU_TOLERANCE: f64 = 0.01;

/// Rejection-sampling cap when spreading walkers around a center.
const MAX_SPREAD_ATTEMPTS: usize = 10_000;

/// Default relative width of the initial walker cloud.
const DEFAULT_SPREAD_FRACTION: f64 = 0.1;

/// Default iteration cap for the maximum-likelihood fit.
const DEFAULT_FIT_MAX_ITERS: u64 = 500;

/// Knobs for [`GPModelling::derive_posteriors`].
#[derive(Debug, Clone)]
pub struct McmcOptions {
    /// Explicit initial walker positions, shape `(n_walkers, n_params)`.
    /// When absent, walkers are spread around the current (or freshly
    /// fitted) parameter vector.
    pub initial_chain_params: Option<Array2<f64>>,
    /// Run a maximum-likelihood fit before sampling and centre the walkers
    /// on the best fit.
    pub fit: bool,
    /// Stop early once the convergence criterion holds.
    pub converge: bool,
    /// Hard cap on sampler iterations.
    pub max_steps: usize,
    /// Number of ensemble walkers (must be even).
    pub walkers: usize,
    /// Worker threads for parallel posterior evaluation.
    pub cores: usize,
    /// Seed for the sampler RNG; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for McmcOptions {
    fn default() -> Self {
        Self {
            initial_chain_params: None,
            fit: true,
            converge: true,
            max_steps: 10_000,
            walkers: 12,
            cores: 6,
            seed: None,
        }
    }
}

/// Knobs for [`GPModelling::generate_from_posteriors`].
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Number of posterior-predictive lightcurves to generate.
    pub n_sims: usize,
    /// Worker threads for parallel simulation.
    pub cores: usize,
    /// Noise distribution handed to the simulator factory.
    pub pdf: NoisePdf,
    /// Stretch factor for the simulated segment (red-noise leakage).
    pub extension_factor: f64,
    /// Seed for the draw RNG; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            n_sims: 10,
            cores: 8,
            pdf: NoisePdf::Gaussian,
            extension_factor: 2.0,
            seed: None,
        }
    }
}

/// Posterior state derived once at the end of sampling.
#[derive(Debug, Clone)]
struct Posterior {
    chain: Chain,
    tau: Array1<f64>,
    mean_tau: f64,
    samples: Array2<f64>,
    log_probs: Array1<f64>,
}

/// Couples a lightcurve with a [`GpModel`] and derives its posterior.
///
/// Typical lifecycle: construct, [`derive_posteriors`], then read the
/// posterior accessors or [`generate_from_posteriors`]. Posterior accessors
/// fail with [`Error::PosteriorsNotDerived`] until sampling has run.
///
/// [`derive_posteriors`]: GPModelling::derive_posteriors
/// [`generate_from_posteriors`]: GPModelling::generate_from_posteriors
pub struct GPModelling<M: GpModel> {
    lightcurve: GappyLightcurve,
    model: M,
    initial_params: Array1<f64>,
    ndim: usize,
    autocorr: Vec<f64>,
    converged: bool,
    fit_result: Option<FitResult>,
    posterior: Option<Posterior>,
}

impl<M: GpModel> GPModelling<M> {
    pub fn new(lightcurve: GappyLightcurve, model: M) -> Self {
        let initial_params = model.parameter_vector();
        let ndim = initial_params.len();
        Self {
            lightcurve,
            model,
            initial_params,
            ndim,
            autocorr: Vec::new(),
            converged: false,
            fit_result: None,
            posterior: None,
        }
    }

    /// The lightcurve being modelled.
    pub fn lightcurve(&self) -> &GappyLightcurve {
        &self.lightcurve
    }

    /// The model, at its most recently set parameter vector.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Number of free parameters.
    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// Free-parameter names, in vector order.
    pub fn parameter_names(&self) -> Vec<String> {
        self.model.parameter_names()
    }

    /// The model's parameter vector at construction time.
    pub fn initial_parameters(&self) -> &Array1<f64> {
        &self.initial_params
    }

    /// Run a bounded maximum-likelihood fit and move the model to the best
    /// fit. The starting point defaults to the construction-time parameter
    /// vector. The result is also retained for [`GPModelling::fit_result`].
    pub fn fit(
        &mut self,
        initial_params: Option<Array1<f64>>,
        max_iters: u64,
    ) -> Result<&FitResult> {
        let initial = initial_params.unwrap_or_else(|| self.initial_params.clone());
        let result = fit_ml(&self.model, self.lightcurve.y(), Some(initial), max_iters)?;
        self.model.set_parameter_vector(result.parameters.view())?;
        debug!(
            "maximum-likelihood fit finished after {} iterations ({})",
            result.iterations, result.status
        );
        Ok(self.fit_result.insert(result))
    }

    /// Result of the most recent maximum-likelihood fit, if any.
    pub fn fit_result(&self) -> Option<&FitResult> {
        self.fit_result.as_ref()
    }

    /// Spread `n_walkers` starting positions around `center` by rejection
    /// sampling.
    ///
    /// Each component is perturbed with a Gaussian of standard deviation
    /// `|center_i| * spread_fraction` (components with zero deviation stay at
    /// the center) and the whole vector is redrawn until every component
    /// satisfies its bound. The center is clamped into the bounds first so a
    /// bound violated by the center itself cannot stall the rejection loop;
    /// a cap of 10 000 redraws per walker turns pathological bounds into
    /// [`Error::Sampling`] instead of a hang.
    pub fn spread_walkers<R: Rng + ?Sized>(
        &self,
        n_walkers: usize,
        center: ArrayView1<f64>,
        spread_fraction: f64,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        let bounds = self.model.parameter_bounds();
        if center.len() != bounds.len() {
            return Err(Error::InvalidParameter(format!(
                "walker center has {} components but the model has {} parameters",
                center.len(),
                bounds.len()
            )));
        }
        let center = bounds.clamp(center);

        let mut positions = Array2::zeros((n_walkers, center.len()));
        for w in 0..n_walkers {
            let mut attempts = 0;
            loop {
                let candidate = Array1::from_iter(center.iter().map(|&c| {
                    let sd = c.abs() * spread_fraction;
                    if sd > 0.0 {
                        // Normal::new only fails for non-finite or negative sd
                        match Normal::new(c, sd) {
                            Ok(normal) => normal.sample(rng),
                            Err(_) => c,
                        }
                    } else {
                        c
                    }
                }));
                if bounds.contains(candidate.view()) {
                    positions.row_mut(w).assign(&candidate);
                    break;
                }
                attempts += 1;
                if attempts >= MAX_SPREAD_ATTEMPTS {
                    return Err(Error::Sampling(format!(
                        "could not draw an in-bounds position for walker {} after {} attempts; \
                         the bounds may be too tight around the center",
                        w, MAX_SPREAD_ATTEMPTS
                    )));
                }
            }
        }
        Ok(positions)
    }

    /// Sample the posterior with an affine-invariant ensemble.
    ///
    /// Optionally fits first (skipped when an explicit initial ensemble is
    /// supplied), initializes walkers, then advances the ensemble
    /// for up to `max_steps` iterations, checking convergence every 500: the
    /// chain must be longer than 100 autocorrelation times and the tau
    /// estimate stable to 1% for every parameter. At termination the chain is
    /// flattened with burn-in and thinning derived from the mean tau;
    /// non-convergence downgrades both and warns rather than failing.
    pub fn derive_posteriors(&mut self, options: &McmcOptions) -> Result<()> {
        let mut rng = make_rng(options.seed);
        let initial = match &options.initial_chain_params {
            Some(positions) => {
                if positions.ncols() != self.ndim {
                    return Err(Error::InvalidParameter(format!(
                        "initial chain parameters have {} columns but the model has {} parameters",
                        positions.ncols(),
                        self.ndim
                    )));
                }
                positions.clone()
            }
            None => {
                // an explicit ensemble overrides the fit entirely; only a
                // spread around the (optionally fitted) model needs one
                if options.fit {
                    self.fit(None, DEFAULT_FIT_MAX_ITERS)?;
                }
                self.spread_walkers(
                    options.walkers,
                    self.model.parameter_vector().view(),
                    DEFAULT_SPREAD_FRACTION,
                    &mut rng,
                )?
            }
        };

        // each evaluation mutates a private model clone, never the shared one
        let log_prob = {
            let model = self.model.clone();
            let y = self.lightcurve.y().clone();
            move |params: ArrayView1<f64>| -> f64 {
                let mut model = model.clone();
                if model.set_parameter_vector(params).is_err() {
                    return f64::NEG_INFINITY;
                }
                let prior = model.log_prior();
                if !prior.is_finite() {
                    return f64::NEG_INFINITY;
                }
                prior + model.log_likelihood(y.view())
            }
        };

        let param_names = self.model.parameter_names();
        let max_steps = options.max_steps;
        let converge = options.converge;
        let ndim = self.ndim;

        let pool = ThreadPoolBuilder::new()
            .num_threads(options.cores)
            .build()
            .map_err(|e| Error::Sampling(e.to_string()))?;

        // the pool is scoped to this call: dropped (and its workers joined)
        // on every exit path, including the early-convergence break and `?`
        let (chain, trace, converged) = pool.install(move || -> Result<(Chain, Vec<f64>, bool)> {
            let mut sampler = EnsembleSampler::new(initial, param_names, log_prob)?;
            let mut trace = Vec::new();
            let mut converged = false;
            let mut old_tau = Array1::from_elem(ndim, f64::INFINITY);

            while sampler.iteration() < max_steps {
                let batch = CONVERGENCE_CHECK_INTERVAL.min(max_steps - sampler.iteration());
                sampler.run(batch, &mut rng);

                let tau = sampler.chain().autocorr_time(0);
                trace.push(tau.mean().unwrap_or(f64::NAN));
                let iteration = sampler.iteration() as f64;
                let long_enough = tau.iter().all(|&t| iteration > CONVERGENCE_TAU_FACTOR * t);
                let stable = tau
                    .iter()
                    .zip(old_tau.iter())
                    .all(|(&t, &ot)| ((ot - t) / t).abs() < CONVERGENCE_TAU_TOLERANCE);
                debug!(
                    "iteration {}: mean tau = {:.2}, acceptance = {:.3}",
                    sampler.iteration(),
                    tau.mean().unwrap_or(f64::NAN),
                    sampler.state().mean_acceptance_rate()
                );
                old_tau = tau;

                if long_enough && stable {
                    converged = true;
                    if converge {
                        info!("chains converged after {} iterations", sampler.iteration());
                        break;
                    }
                }
            }

            Ok((sampler.into_chain(), trace, converged))
        })?;

        let tau = chain.autocorr_time(0);
        let mean_tau = tau.mean().unwrap_or(1.0).max(1.0);
        let (discard, thin) = if converged {
            let mut discard = (40.0 * mean_tau) as usize;
            if discard > max_steps {
                discard = (10.0 * mean_tau) as usize;
            }
            (discard, ((mean_tau / 2.0) as usize).max(1))
        } else {
            warn!(
                "the chains did not converge within {} iterations (mean tau = {:.1}); \
                 using reduced burn-in and thinning",
                max_steps, mean_tau
            );
            (
                (5.0 * mean_tau) as usize,
                ((mean_tau / 4.0) as usize).max(1),
            )
        };
        let discard = discard.min(chain.len().saturating_sub(1));

        let samples = chain.flat_samples(discard, thin);
        let log_probs = chain.flat_log_probs(discard, thin);
        self.autocorr = trace;
        self.converged = converged;
        self.posterior = Some(Posterior {
            chain,
            tau,
            mean_tau,
            samples,
            log_probs,
        });
        Ok(())
    }

    /// Whether the last sampling run satisfied the convergence criterion.
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Mean autocorrelation time recorded at each convergence check of the
    /// last sampling run.
    pub fn autocorr(&self) -> &[f64] {
        &self.autocorr
    }

    fn posterior(&self) -> Result<&Posterior> {
        self.posterior.as_ref().ok_or(Error::PosteriorsNotDerived)
    }

    /// The full recorded chain of the last sampling run.
    pub fn sampler_chain(&self) -> Result<&Chain> {
        Ok(&self.posterior()?.chain)
    }

    /// Integrated autocorrelation time per parameter at termination.
    pub fn autocorr_time(&self) -> Result<&Array1<f64>> {
        Ok(&self.posterior()?.tau)
    }

    /// Flattened, burned-in, thinned posterior samples.
    pub fn mcmc_samples(&self) -> Result<&Array2<f64>> {
        Ok(&self.posterior()?.samples)
    }

    /// Log-probabilities matching [`GPModelling::mcmc_samples`] row for row.
    pub fn loglikelihoods(&self) -> Result<&Array1<f64>> {
        Ok(&self.posterior()?.log_probs)
    }

    /// The highest log-probability among the posterior samples.
    pub fn max_loglikelihood(&self) -> Result<f64> {
        let posterior = self.posterior()?;
        posterior
            .log_probs
            .iter()
            .copied()
            .max_by(f64::total_cmp)
            .ok_or(Error::NoPosteriorSamples)
    }

    /// The posterior sample with the highest log-probability.
    pub fn max_parameters(&self) -> Result<Array1<f64>> {
        let posterior = self.posterior()?;
        let best = posterior
            .log_probs
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i)
            .ok_or(Error::NoPosteriorSamples)?;
        Ok(posterior.samples.row(best).to_owned())
    }

    /// Component-wise median of the posterior samples.
    pub fn median_parameters(&self) -> Result<Array1<f64>> {
        let posterior = self.posterior()?;
        if posterior.samples.nrows() == 0 {
            return Err(Error::NoPosteriorSamples);
        }
        Ok(Array1::from_iter((0..posterior.samples.ncols()).map(|p| {
            let mut col: Vec<f64> = posterior.samples.column(p).to_vec();
            col.sort_by(f64::total_cmp);
            let n = col.len();
            if n % 2 == 1 {
                col[n / 2]
            } else {
                (col[n / 2 - 1] + col[n / 2]) / 2.0
            }
        })))
    }

    /// Per-walker Gelman-Rubin statistic of the retained chain, shape
    /// `(n_walkers, n_params)`. `burn_in` defaults to 10 mean autocorrelation
    /// times.
    pub fn rstat(&self, burn_in: Option<usize>) -> Result<Array2<f64>> {
        let posterior = self.posterior()?;
        let burn_in = burn_in.unwrap_or((10.0 * posterior.mean_tau) as usize);
        Ok(posterior.chain.gelman_rubin(burn_in))
    }

    /// Generate posterior-predictive lightcurves.
    ///
    /// Draws `n_sims` parameter vectors uniformly with replacement from the
    /// posterior samples and, in parallel, simulates one lightcurve per draw
    /// on the observed sampling pattern: the model (a private clone per
    /// draw) is moved to the drawn parameters, its PSD handed to the
    /// simulator factory, and observational noise injected into the
    /// synthetic rates. Fails with [`Error::NoPosteriorSamples`] before
    /// [`GPModelling::derive_posteriors`] has run.
    pub fn generate_from_posteriors<F: SimulatorFactory>(
        &self,
        factory: &F,
        options: &SimulationOptions,
    ) -> Result<Vec<GappyLightcurve>> {
        let posterior = self.posterior.as_ref().ok_or(Error::NoPosteriorSamples)?;
        let n_samples = posterior.samples.nrows();
        if n_samples == 0 {
            return Err(Error::NoPosteriorSamples);
        }
        if options.n_sims >= n_samples {
            warn!(
                "drawing {} simulations from only {} posterior samples; repeated draws are likely",
                options.n_sims, n_samples
            );
        }

        let mut rng = make_rng(options.seed);
        let draws: Vec<usize> = (0..options.n_sims)
            .map(|_| rng.gen_range(0..n_samples))
            .collect();

        let pool = ThreadPoolBuilder::new()
            .num_threads(options.cores)
            .build()
            .map_err(|e| Error::Sampling(e.to_string()))?;

        pool.install(|| {
            draws
                .par_iter()
                .map(|&idx| {
                    let mut model = self.model.clone();
                    model.set_parameter_vector(posterior.samples.row(idx))?;
                    let mut simulator =
                        self.lightcurve
                            .get_simulator(factory, model.psd(), options.pdf)?;
                    let rates = simulator.generate_lightcurve(options.extension_factor)?;
                    let (noisy, dy) = simulator.add_noise(&rates)?;
                    GappyLightcurve::new(
                        self.lightcurve.times().clone(),
                        noisy,
                        Some(dy),
                        Some(self.lightcurve.exposures().clone()),
                        None,
                        None,
                    )
                })
                .collect()
        })
    }
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example_models::DiagonalGpModel;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn flat_engine() -> GPModelling<DiagonalGpModel> {
        let times = Array1::linspace(0.0, 490.0, 50);
        let y = Array1::from_iter((0..50).map(|i| 10.0 + if i % 2 == 0 { 0.3 } else { -0.3 }));
        let dy = Array1::from_elem(50, 0.5);
        let lc = GappyLightcurve::new(times, y, Some(dy), None, None, None).unwrap();
        let model = DiagonalGpModel::new(&lc, Some("constant")).unwrap();
        GPModelling::new(lc, model)
    }

    #[test]
    fn test_accessors_before_sampling_fail() {
        let engine = flat_engine();
        assert!(matches!(
            engine.mcmc_samples(),
            Err(Error::PosteriorsNotDerived)
        ));
        assert!(matches!(
            engine.loglikelihoods(),
            Err(Error::PosteriorsNotDerived)
        ));
        assert!(matches!(
            engine.max_parameters(),
            Err(Error::PosteriorsNotDerived)
        ));
        assert!(matches!(
            engine.median_parameters(),
            Err(Error::PosteriorsNotDerived)
        ));
        assert!(matches!(engine.rstat(None), Err(Error::PosteriorsNotDerived)));
        assert!(!engine.converged());
    }

    #[test]
    fn test_spread_walkers_respects_bounds() {
        let engine = flat_engine();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let center = engine.model().parameter_vector();
        let positions = engine
            .spread_walkers(12, center.view(), 0.1, &mut rng)
            .unwrap();
        assert_eq!(positions.dim(), (12, 2));
        let bounds = engine.model().parameter_bounds();
        for w in 0..12 {
            assert!(bounds.contains(positions.row(w)));
        }
    }

    #[test]
    fn test_spread_walkers_clamps_out_of_bounds_center() {
        let engine = flat_engine();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        // mean far above max(y): must be clamped into bounds, not loop forever
        let center = array![1e6, engine.model().sigma()];
        let positions = engine
            .spread_walkers(4, center.view(), 0.1, &mut rng)
            .unwrap();
        let bounds = engine.model().parameter_bounds();
        for w in 0..4 {
            assert!(bounds.contains(positions.row(w)));
        }
    }

    #[test]
    fn test_spread_walkers_center_length_check() {
        let engine = flat_engine();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let result = engine.spread_walkers(4, array![1.0].view(), 0.1, &mut rng);
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_initial_chain_params_shape_check() {
        let mut engine = flat_engine();
        let options = McmcOptions {
            initial_chain_params: Some(Array2::zeros((12, 5))),
            fit: false,
            ..Default::default()
        };
        assert!(matches!(
            engine.derive_posteriors(&options),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_fit_moves_model_to_best_parameters() {
        let mut engine = flat_engine();
        engine.fit(None, 500).unwrap();
        let result = engine.fit_result().unwrap();
        assert_eq!(
            engine.model().parameter_vector(),
            result.parameters
        );
        assert!((result.parameters[0] - 10.0).abs() < 0.2);
    }

    #[test]
    fn test_fit_accepts_explicit_initial_parameters() {
        let mut engine = flat_engine();
        let fit = engine.fit(Some(array![10.0, 0.4]), 500).unwrap().clone();
        assert!((fit.parameters[0] - 10.0).abs() < 0.2);
        // a wrong-length start is rejected before the solver runs
        assert!(matches!(
            engine.fit(Some(array![1.0]), 500),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_initial_parameters_survive_fitting() {
        let mut engine = flat_engine();
        let initial = engine.initial_parameters().clone();
        engine.fit(None, 500).unwrap();
        // the fit moves the model but the construction-time vector, the
        // default starting point of later fits, is retained
        assert_eq!(engine.initial_parameters(), &initial);
        assert_ne!(engine.model().parameter_vector(), initial);
    }

    #[test]
    fn test_explicit_initial_ensemble_skips_fit() {
        let mut engine = flat_engine();
        let before = engine.model().parameter_vector();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let initial = engine
            .spread_walkers(4, before.view(), 0.05, &mut rng)
            .unwrap();
        let options = McmcOptions {
            initial_chain_params: Some(initial),
            fit: true,
            max_steps: 20,
            cores: 1,
            seed: Some(5),
            ..Default::default()
        };
        engine.derive_posteriors(&options).unwrap();
        // the explicit ensemble overrides the fit: no fit ran and the
        // engine's model was not moved
        assert!(engine.fit_result().is_none());
        assert_eq!(engine.model().parameter_vector(), before);
    }

    #[test]
    fn test_default_options() {
        let mcmc = McmcOptions::default();
        assert!(mcmc.fit && mcmc.converge);
        assert_eq!(mcmc.max_steps, 10_000);
        assert_eq!(mcmc.walkers, 12);
        assert_eq!(mcmc.cores, 6);

        let sim = SimulationOptions::default();
        assert_eq!(sim.n_sims, 10);
        assert_eq!(sim.cores, 8);
        assert_eq!(sim.pdf, NoisePdf::Gaussian);
        assert_eq!(sim.extension_factor, 2.0);
    }
}
