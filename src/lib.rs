#![allow(clippy::needless_range_loop)] // I like loops ... !

pub mod data;
pub mod error;
pub mod evaluation;
pub mod hsne;
pub mod prelude;
pub mod training;
pub mod utils;

use ann_search_rs::{
    hnsw::{HnswIndex, HnswState},
    nndescent::{ApplySortedUpdates, NNDescent, NNDescentQuery},
    utils::dist::SimdDistance,
};
use faer::MatRef;
use num_traits::{Float, FromPrimitive, ToPrimitive};
use std::{
    iter::Sum,
    marker::{Send, Sync},
    ops::AddAssign,
    time::Instant,
};
use thousands::*;

use crate::data::embedding::Embedding;
use crate::data::graph::gaussian_knn_affinities;
use crate::data::nearest_neighbours::*;
use crate::data::structures::*;
use crate::error::{HsneError, Result};
use crate::hsne::HierarchicalSne;
use crate::training::tsne_optimiser::*;

/// Iterations of the perplexity search
const PERPLEXITY_MAX_ITER: usize = 200;
/// Entropy tolerance of the perplexity search
const PERPLEXITY_TOL: f64 = 1e-5;

/////////////
// Helpers //
/////////////

/// Helper function to generate the t-SNE conditional probabilities
///
/// Every point gets Gaussian probabilities over its `3 * perplexity` nearest
/// neighbours (capped at `n - 1`).
///
/// ### Params
///
/// * `data` - Input data matrix (samples × features)
/// * `perplexity` - Target perplexity of every row
/// * `ann_type` - Approximate nearest neighbour method: `"annoy"`, `"hnsw"`,
///   `"nndescent"` or `"exact"`. Unknown strings fall back to `"annoy"`
/// * `nn_params` - Nearest neighbour parameters for nearest neighbour search.
/// * `seed` - Random seed
/// * `verbose` - Controls verbosity
///
/// ### Returns
///
/// Sparse conditional probabilities, one row per point
pub fn construct_tsne_affinities<T>(
    data: MatRef<T>,
    perplexity: f64,
    ann_type: &str,
    nn_params: &NearestNeighbourParams<T>,
    seed: usize,
    verbose: bool,
) -> Result<SparseMatrix<T>>
where
    T: Float + FromPrimitive + ToPrimitive + Send + Sync + Default + Sum + SimdDistance,
    HnswIndex<T>: HnswState<T>,
    NNDescent<T>: ApplySortedUpdates<T> + NNDescentQuery<T>,
{
    let n = data.nrows();
    if n < 2 {
        return Err(HsneError::InvalidArgument(format!(
            "t-SNE needs at least 2 data points, got {}",
            n
        )));
    }
    if perplexity.is_nan() || perplexity <= 0.0 {
        return Err(HsneError::InvalidArgument(format!(
            "Perplexity must be positive, got {}",
            perplexity
        )));
    }
    let k = ((3.0 * perplexity) as usize).clamp(1, n - 1);

    log_progress!(
        verbose,
        "Running approximate nearest neighbour search using {} ({} neighbours)...",
        ann_type,
        k
    );

    let start_knn = Instant::now();
    let (knn_indices, knn_dist) = run_ann_search(data, k, ann_type, nn_params, seed)?;

    log_progress!(verbose, "kNN search done in: {:.2?}.", start_knn.elapsed());

    let start_prob = Instant::now();
    let probabilities = gaussian_knn_affinities(
        &knn_indices,
        &knn_dist,
        T::from_f64(perplexity).unwrap(),
        T::from_f64(PERPLEXITY_TOL).unwrap(),
        PERPLEXITY_MAX_ITER,
    )?;

    log_progress!(
        verbose,
        "Computed {} conditional probabilities in {:.2?}.",
        sparse_matrix_nnz(&probabilities).separate_with_underscores(),
        start_prob.elapsed()
    );

    Ok(probabilities)
}

/// Run the gradient descent for a fixed number of iterations
fn run_gradient_descent<T>(tsne: &mut WeightedTsne<T>, n_iter: usize) -> Result<()>
where
    T: Float + FromPrimitive + ToPrimitive + Send + Sync + Sum,
{
    let verbose = tsne.params().verbose;
    let start = Instant::now();
    for iter in 0..n_iter {
        tsne.do_an_iteration()?;
        if (iter + 1) % 100 == 0 || iter + 1 == n_iter {
            log_progress!(
                verbose,
                "Iteration {} / {} ({:.2?})",
                iter + 1,
                n_iter,
                start.elapsed()
            );
        }
    }
    Ok(())
}

//////////
// tSNE //
//////////

/// Embed high-dimensional data with the weighted t-SNE optimiser
///
/// ### Params
///
/// * `data` - Input data matrix (samples × features)
/// * `perplexity` - Target perplexity of the Gaussian kernel
/// * `tsne_params` - Gradient descent parameters
/// * `n_iter` - Number of gradient descent iterations
/// * `ann_type` - Approximate nearest neighbour method
/// * `nn_params` - Nearest neighbour parameters
/// * `verbose` - Controls verbosity of the affinity computation
///
/// ### Returns
///
/// The embedding, one point per row of `data`
pub fn tsne<T>(
    data: MatRef<T>,
    perplexity: f64,
    tsne_params: TsneParams,
    n_iter: usize,
    ann_type: &str,
    nn_params: &NearestNeighbourParams<T>,
    verbose: bool,
) -> Result<Embedding<T>>
where
    T: Float + FromPrimitive + ToPrimitive + Send + Sync + Default + Sum + SimdDistance,
    HnswIndex<T>: HnswState<T>,
    NNDescent<T>: ApplySortedUpdates<T> + NNDescentQuery<T>,
{
    let seed = utils::rng::resolve_seed(tsne_params.seed) as usize;
    let probabilities =
        construct_tsne_affinities(data, perplexity, ann_type, nn_params, seed, verbose)?;

    let mut optimiser = WeightedTsne::new();
    optimiser.initialize(&probabilities, tsne_params)?;
    run_gradient_descent(&mut optimiser, n_iter)?;

    Ok(optimiser.into_embedding())
}

//////////
// HSNE //
//////////

/// Embed one scale of an HSNE hierarchy
///
/// The transition matrix of the scale is symmetrised into the joint
/// distribution and the landmark weights drive the repulsion.
///
/// ### Params
///
/// * `hsne` - The hierarchy
/// * `scale_id` - Scale to embed
/// * `tsne_params` - Gradient descent parameters
/// * `n_iter` - Number of gradient descent iterations
///
/// ### Returns
///
/// The embedding, one point per landmark of the scale
pub fn embed_scale<T>(
    hsne: &HierarchicalSne<T>,
    scale_id: usize,
    tsne_params: TsneParams,
    n_iter: usize,
) -> Result<Embedding<T>>
where
    T: Float + FromPrimitive + ToPrimitive + Send + Sync + AddAssign + Sum,
{
    let scale = hsne.scale(scale_id)?;

    log_progress!(
        tsne_params.verbose,
        "Embedding scale {} with {} landmarks...",
        scale_id,
        scale.size().separate_with_underscores()
    );

    let mut optimiser = WeightedTsne::new();
    optimiser.initialize(&scale.transition_matrix, tsne_params)?;
    optimiser.set_weights(scale.landmark_weight.clone())?;
    run_gradient_descent(&mut optimiser, n_iter)?;

    Ok(optimiser.into_embedding())
}
