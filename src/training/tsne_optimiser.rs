use log::{debug, info};
use num_traits::{Float, FromPrimitive, ToPrimitive};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::iter::Sum;
use thousands::*;

use crate::data::embedding::Embedding;
use crate::data::graph::symmetrise_affinities;
use crate::data::structures::*;
use crate::error::{HsneError, Result};
use crate::log_progress;
use crate::utils::bh_tree::*;
use crate::utils::rng::resolve_seed;

/////////////
// Globals //
/////////////

const TSNE_GAIN_INCREASE: f64 = 0.2;
const TSNE_GAIN_DECAY: f64 = 0.8;
const TSNE_EPS: f64 = 1e-12;

////////////////
// Parameters //
////////////////

/// Parameters of the weighted t-SNE gradient descent
///
/// ### Fields
///
/// * `seed` - Seed for the initial positions; negative means time-based
/// * `embedding_dimensionality` - Output dimensionality
/// * `minimum_gain` - Lower bound of the adaptive gains
/// * `eta` - Learning rate
/// * `momentum` - Momentum before `mom_switching_iter`
/// * `final_momentum` - Momentum afterwards
/// * `mom_switching_iter` - Iteration at which the momentum switches
/// * `exaggeration_factor` - Early exaggeration of the attractive forces
/// * `remove_exaggeration_iter` - Last iteration with full exaggeration
/// * `exponential_decay_iter` - Iterations over which the exaggeration decays
///   to 1
/// * `theta` - Barnes-Hut threshold; `0` computes exact forces
/// * `initial_position_multiplier` - Scale of the Gaussian initial layout
/// * `verbose` - Log progress at `info` rather than `debug`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TsneParams {
    pub seed: i64,
    pub embedding_dimensionality: usize,
    pub minimum_gain: f64,
    pub eta: f64,
    pub momentum: f64,
    pub final_momentum: f64,
    pub mom_switching_iter: usize,
    pub exaggeration_factor: f64,
    pub remove_exaggeration_iter: usize,
    pub exponential_decay_iter: usize,
    pub theta: f64,
    pub initial_position_multiplier: f64,
    pub verbose: bool,
}

impl Default for TsneParams {
    fn default() -> Self {
        Self {
            seed: -1,
            embedding_dimensionality: 2,
            minimum_gain: 0.1,
            eta: 200.0,
            momentum: 0.2,
            final_momentum: 0.5,
            mom_switching_iter: 250,
            exaggeration_factor: 4.0,
            remove_exaggeration_iter: 250,
            exponential_decay_iter: 150,
            theta: 0.5,
            initial_position_multiplier: 1e-4,
            verbose: false,
        }
    }
}

impl TsneParams {
    /// Generate a new instance; `None` keeps the default
    ///
    /// ### Params
    ///
    /// * `seed` - Seed for the initial positions
    /// * `embedding_dimensionality` - Output dimensionality
    /// * `eta` - Learning rate
    /// * `exaggeration_factor` - Early exaggeration
    /// * `remove_exaggeration_iter` - Last iteration with full exaggeration
    /// * `theta` - Barnes-Hut threshold
    /// * `verbose` - Controls verbosity
    ///
    /// ### Returns
    ///
    /// Initialised self
    pub fn new(
        seed: Option<i64>,
        embedding_dimensionality: Option<usize>,
        eta: Option<f64>,
        exaggeration_factor: Option<f64>,
        remove_exaggeration_iter: Option<usize>,
        theta: Option<f64>,
        verbose: bool,
    ) -> Self {
        let default = Self::default();
        Self {
            seed: seed.unwrap_or(default.seed),
            embedding_dimensionality: embedding_dimensionality
                .unwrap_or(default.embedding_dimensionality),
            eta: eta.unwrap_or(default.eta),
            exaggeration_factor: exaggeration_factor.unwrap_or(default.exaggeration_factor),
            remove_exaggeration_iter: remove_exaggeration_iter
                .unwrap_or(default.remove_exaggeration_iter),
            theta: theta.unwrap_or(default.theta),
            verbose,
            ..default
        }
    }
}

/////////////
// Helpers //
/////////////

/// Adaptive gain update for t-SNE gradient descent
///
/// ### Params
///
/// * `val` - Current parameter value to update
/// * `update` - Accumulated momentum vector for this parameter
/// * `gain` - Adaptive gain (learning rate multiplier) for this parameter
/// * `grad` - Current gradient for this parameter
/// * `lr` - Base learning rate
/// * `momentum` - Momentum coefficient
/// * `min_gain` - Minimum allowed gain value
/// * `mult` - Scales the step applied to `val`
#[inline(always)]
#[allow(clippy::too_many_arguments)]
fn update_parameter<T>(
    val: &mut T,
    update: &mut T,
    gain: &mut T,
    grad: T,
    lr: T,
    momentum: T,
    min_gain: T,
    mult: T,
) where
    T: Float + FromPrimitive,
{
    // adjust gain based on gradient-update alignment
    if (grad > T::zero()) != (*update > T::zero()) {
        *gain = *gain + T::from_f64(TSNE_GAIN_INCREASE).unwrap();
    } else {
        *gain = *gain * T::from_f64(TSNE_GAIN_DECAY).unwrap();
    }
    *gain = (*gain).max(min_gain);

    *update = momentum * *update - lr * *gain * grad;
    *val = *val + *update * mult;
}

/// Check that a sparse matrix is a usable probability distribution
///
/// ### Returns
///
/// Total mass of the matrix
fn validate_distribution<T>(matrix: &[SparseRow<T>]) -> Result<T>
where
    T: Float,
{
    let n = matrix.len();
    if n == 0 {
        return Err(HsneError::InvalidArgument(
            "Cannot embed an empty distribution".to_string(),
        ));
    }

    let mut total = T::zero();
    for (i, row) in matrix.iter().enumerate() {
        for (j, v) in row.iter() {
            if j >= n {
                return Err(HsneError::InvalidArgument(format!(
                    "Row {} refers to column {} of a {}x{} distribution",
                    i, j, n, n
                )));
            }
            if !v.is_finite() || v < T::zero() {
                return Err(HsneError::InvalidArgument(format!(
                    "Row {} holds an invalid probability",
                    i
                )));
            }
            total = total + v;
        }
    }

    if total <= T::zero() {
        return Err(HsneError::InvalidArgument(
            "The distribution has no mass".to_string(),
        ));
    }

    Ok(total)
}

///////////////
// Optimiser //
///////////////

/// Lifecycle of the optimiser
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TsneState {
    #[default]
    Uninitialised,
    Initialised,
}

/// Weighted t-SNE with Barnes-Hut accelerated gradient descent
///
/// Every point carries a weight (by default the mass of its row of the
/// high-dimensional distribution). Heavy points repel more strongly, which
/// lets coarse HSNE scales keep their landmarks apart according to the
/// number of points they represent.
#[derive(Clone, Debug)]
pub struct WeightedTsne<T> {
    params: TsneParams,
    state: TsneState,
    p: SparseMatrix<T>,
    weights: Vec<T>,
    embedding: Embedding<T>,
    update: Vec<T>,
    gain: Vec<T>,
    theta: T,
    iteration: usize,
}

impl<T> WeightedTsne<T>
where
    T: Float + FromPrimitive + ToPrimitive + Send + Sync + Sum,
{
    /// Generate an uninitialised optimiser
    pub fn new() -> Self {
        Self {
            params: TsneParams::default(),
            state: TsneState::Uninitialised,
            p: Vec::new(),
            weights: Vec::new(),
            embedding: Embedding::new(2, 0, T::zero()),
            update: Vec::new(),
            gain: Vec::new(),
            theta: T::zero(),
            iteration: 0,
        }
    }

    /// Initialise from conditional probabilities
    ///
    /// The joint distribution is `(p_ij + p_ji) / 2`, normalised to sum to 1.
    /// Weights are the row sums of the symmetrised matrix before
    /// normalisation.
    ///
    /// ### Params
    ///
    /// * `probabilities` - Square sparse matrix, one row per point
    /// * `params` - Gradient descent parameters
    pub fn initialize(&mut self, probabilities: &[SparseRow<T>], params: TsneParams) -> Result<()> {
        validate_distribution(probabilities)?;
        log_progress!(params.verbose, "Initialising weighted t-SNE...");

        let p = symmetrise_affinities(probabilities);
        self.setup(p, params)
    }

    /// Initialise from an already symmetric joint distribution
    ///
    /// ### Params
    ///
    /// * `distribution` - Square sparse matrix, used as is (up to
    ///   normalisation)
    /// * `params` - Gradient descent parameters
    pub fn initialize_with_joint_probability_distribution(
        &mut self,
        distribution: &[SparseRow<T>],
        params: TsneParams,
    ) -> Result<()> {
        validate_distribution(distribution)?;
        log_progress!(
            params.verbose,
            "Initialising weighted t-SNE with a user-defined joint distribution..."
        );

        self.setup(distribution.to_vec(), params)
    }

    fn setup(&mut self, mut p: SparseMatrix<T>, params: TsneParams) -> Result<()> {
        if params.embedding_dimensionality == 0 {
            return Err(HsneError::InvalidArgument(
                "Embedding dimensionality must be positive".to_string(),
            ));
        }

        let n = p.len();
        let n_dim = params.embedding_dimensionality;

        self.weights = sparse_row_sums(&p);
        let total: T = self.weights.iter().copied().sum();
        let total_inv = T::one() / total;
        p.par_iter_mut().for_each(|row| {
            for v in row.data.iter_mut() {
                *v = *v * total_inv;
            }
        });
        self.p = p;

        let seed = resolve_seed(params.seed);
        let mut rng = StdRng::seed_from_u64(seed);
        let mult = params.initial_position_multiplier;
        let positions: Vec<T> = (0..n * n_dim)
            .map(|_| {
                let v: f64 = StandardNormal.sample(&mut rng);
                T::from_f64(v * mult).unwrap()
            })
            .collect();
        self.embedding = Embedding::from_flat(n_dim, positions)?;

        self.update = vec![T::zero(); n * n_dim];
        self.gain = vec![T::one(); n * n_dim];
        self.theta = T::from_f64(params.theta).unwrap_or_else(T::zero);
        self.iteration = 0;

        log_progress!(
            params.verbose,
            "Weighted t-SNE initialised: {} points, {} non-zero joint probabilities, seed {}",
            n.separate_with_underscores(),
            sparse_matrix_nnz(&self.p).separate_with_underscores(),
            seed
        );

        self.params = params;
        self.state = TsneState::Initialised;
        Ok(())
    }

    /// Overwrite the per-point weights
    pub fn set_weights(&mut self, weights: Vec<T>) -> Result<()> {
        if self.state != TsneState::Initialised {
            return Err(HsneError::Logic(
                "Weights can only be set after initialisation".to_string(),
            ));
        }
        if weights.len() != self.p.len() {
            return Err(HsneError::InvalidArgument(format!(
                "Expected {} weights, got {}",
                self.p.len(),
                weights.len()
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < T::zero()) {
            return Err(HsneError::InvalidArgument(
                "Weights must be finite and non-negative".to_string(),
            ));
        }
        self.weights = weights;
        Ok(())
    }

    /// Barnes-Hut threshold; `0` switches to exact forces
    pub fn set_theta(&mut self, theta: T) {
        self.theta = theta;
    }

    pub fn theta(&self) -> T {
        self.theta
    }

    pub fn weights(&self) -> &[T] {
        &self.weights
    }

    /// Normalised joint probabilities
    pub fn distribution(&self) -> &[SparseRow<T>] {
        &self.p
    }

    pub fn params(&self) -> &TsneParams {
        &self.params
    }

    /// Number of completed iterations
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn is_initialized(&self) -> bool {
        self.state == TsneState::Initialised
    }

    pub fn state(&self) -> TsneState {
        self.state
    }

    pub fn embedding(&self) -> &Embedding<T> {
        &self.embedding
    }

    pub fn into_embedding(self) -> Embedding<T> {
        self.embedding
    }

    /// Forget the initialisation but keep the embedding
    pub fn reset(&mut self) {
        self.state = TsneState::Uninitialised;
    }

    /// Drop the embedding and the distribution
    pub fn clear(&mut self) {
        self.embedding.clear();
        self.p.clear();
        self.weights.clear();
        self.update.clear();
        self.gain.clear();
        self.iteration = 0;
        self.state = TsneState::Uninitialised;
    }

    /// Exaggeration applied at the current iteration
    ///
    /// Full factor up to `remove_exaggeration_iter`, then a linear decay to 1
    /// over `exponential_decay_iter` iterations.
    pub fn exaggeration_factor(&self) -> T {
        let factor = self.params.exaggeration_factor;
        let remove = self.params.remove_exaggeration_iter;
        let decay = self.params.exponential_decay_iter;

        let exaggeration = if self.iteration <= remove {
            factor
        } else if self.iteration < remove + decay {
            let progress = (self.iteration - remove) as f64 / decay as f64;
            1.0 + (factor - 1.0) * (1.0 - progress)
        } else {
            1.0
        };

        T::from_f64(exaggeration).unwrap()
    }

    /// One gradient descent step
    pub fn do_an_iteration(&mut self) -> Result<()> {
        self.do_an_iteration_with_multiplier(T::one())
    }

    /// One gradient descent step with the position update scaled by `mult`
    pub fn do_an_iteration_with_multiplier(&mut self, mult: T) -> Result<()> {
        if self.state != TsneState::Initialised {
            return Err(HsneError::Logic(
                "Cannot run a gradient descent iteration before initialisation".to_string(),
            ));
        }

        let verbose = self.params.verbose;
        if self.iteration == self.params.mom_switching_iter {
            log_progress!(verbose, "Switching to final momentum...");
        }
        if self.iteration == self.params.remove_exaggeration_iter {
            log_progress!(verbose, "Removing exaggeration...");
        }

        let gradient = self.compute_gradient(self.exaggeration_factor());

        let momentum = if self.iteration < self.params.mom_switching_iter {
            self.params.momentum
        } else {
            self.params.final_momentum
        };
        let momentum = T::from_f64(momentum).unwrap();
        let lr = T::from_f64(self.params.eta).unwrap();
        let min_gain = T::from_f64(self.params.minimum_gain).unwrap();

        self.embedding
            .container_mut()
            .par_iter_mut()
            .zip(self.update.par_iter_mut())
            .zip(self.gain.par_iter_mut())
            .zip(gradient.par_iter())
            .for_each(|(((val, update), gain), &grad)| {
                update_parameter(val, update, gain, grad, lr, momentum, min_gain, mult);
            });

        self.iteration += 1;
        if self.iteration % 100 == 0 {
            debug!("Completed t-SNE iteration {}", self.iteration);
        }
        Ok(())
    }

    /// Gradient of the KL divergence: attractive minus normalised repulsive
    /// forces
    fn compute_gradient(&self, exaggeration: T) -> Vec<T> {
        let n_dim = self.embedding.num_dimensions();
        let positions = self.embedding.container();

        let (pos_f, neg_f, sum_q) = if self.theta <= T::zero() {
            let pos_f = compute_edge_forces(n_dim, positions, &self.p, exaggeration);
            let (neg_f, sum_q) =
                compute_exact_non_edge_forces(n_dim, positions, Some(&self.weights));
            (pos_f, neg_f, sum_q)
        } else {
            let tree = SpTree::with_weights(n_dim, positions, &self.weights);
            let pos_f = tree.compute_edge_forces(&self.p, exaggeration);
            let per_point: Vec<(Vec<T>, T)> = (0..self.embedding.num_data_points())
                .into_par_iter()
                .map(|i| tree.compute_non_edge_forces(i, self.theta))
                .collect();
            let sum_q: T = per_point.iter().map(|(_, q)| *q).sum();
            let neg_f: Vec<T> = per_point.into_iter().flat_map(|(f, _)| f).collect();
            (pos_f, neg_f, sum_q)
        };

        let eps = T::from_f64(TSNE_EPS).unwrap();
        let sum_q_inv = if sum_q > eps {
            T::one() / sum_q
        } else {
            T::zero()
        };

        pos_f
            .iter()
            .zip(&neg_f)
            .map(|(&pos, &neg)| pos - neg * sum_q_inv)
            .collect()
    }

    /// KL divergence between the joint distribution and the weighted
    /// Student-t similarities of the embedding
    ///
    /// Exact O(N^2) normalisation; meant for diagnostics.
    pub fn compute_kullback_leibler_divergence(&self) -> Result<T> {
        if self.state != TsneState::Initialised {
            return Err(HsneError::Logic(
                "Cannot compute the KL divergence before initialisation".to_string(),
            ));
        }

        let n_dim = self.embedding.num_dimensions();
        let positions = self.embedding.container();
        let (_, sum_q) = compute_exact_non_edge_forces(n_dim, positions, Some(&self.weights));
        let min_q = T::min_positive_value();

        let kl = self
            .p
            .par_iter()
            .enumerate()
            .map(|(i, row)| {
                let yi = self.embedding.point(i);
                row.iter()
                    .filter(|&(_, p_ij)| p_ij > T::zero())
                    .map(|(j, p_ij)| {
                        let yj = self.embedding.point(j);
                        let dist_sq: T = yi.iter().zip(yj).map(|(&a, &b)| (a - b) * (a - b)).sum();
                        let q_ij = self.weights[i] * self.weights[j]
                            / (T::one() + dist_sq)
                            / sum_q;
                        p_ij * (p_ij / q_ij.max(min_q)).ln()
                    })
                    .fold(T::zero(), |acc, x| acc + x)
            })
            .reduce(T::zero, |a, b| a + b);

        info!(
            "KL divergence after {} iterations: {:.6}",
            self.iteration,
            kl.to_f64().unwrap_or(f64::NAN)
        );
        Ok(kl)
    }
}

///////////
// Tests //
///////////
