use ann_search_rs::hnsw::{HnswIndex, HnswState};
use ann_search_rs::nndescent::{ApplySortedUpdates, NNDescent, NNDescentQuery};
use ann_search_rs::utils::dist::SimdDistance;

use ann_search_rs::*;
use faer::MatRef;
use num_traits::{Float, FromPrimitive, ToPrimitive};
use rayon::prelude::*;
use std::default::Default;
use std::iter::Sum;

use crate::error::{HsneError, Result};
use crate::utils::math::euclidean_distance_squared;

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnSearch {
    #[default]
    /// Annoy
    Annoy,
    /// HNSW
    Hnsw,
    /// NNDescent
    NNDescent,
    /// Brute force, exact neighbours
    Exact,
}

/// Parameters for the nearest neighbour search
///
/// ### Fields
///
/// * `dist_metric` - One of `"euclidean"` or `"cosine"`
///
/// **Annoy**-specific parameter**:
///
/// * `n_trees` - Number of trees to use to build the index. Defaults to `4`,
///   the number of randomised trees HSNE uses.
/// * `search_budget` - Optional search budget (number of checks).
///
/// **HNSW**-specific parameter:
///
/// * `m` - Number of bidirectional connections per layer.
/// * `ef_construction` - Size of candidate list during construction.
/// * `ef_search` - Size of candidate list during search (higher = better
///   recall, slower)
///
/// **NNDescent**-specific parameter
///
/// * `diversify_prob` - Diversifying probability at the end of the index
///   generation.
/// * `delta` - Early termination criterium
/// * `ef_budget` - Optional query budget.
#[derive(Debug, Clone)]
pub struct NearestNeighbourParams<T> {
    pub dist_metric: String,
    // annoy
    pub n_tree: usize,
    pub search_budget: Option<usize>,
    // hnsw
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    // nndescent
    pub diversify_prob: T,
    pub delta: T,
    pub ef_budget: Option<usize>,
}

impl<T> NearestNeighbourParams<T> {
    /// Generate a new instance
    ///
    /// ### Params
    ///
    /// * `dist_metric` - One of `"euclidean"` or `"cosine"`
    /// * `n_trees` - Number of trees to use to build the Annoy index.
    /// * `search_budget` - Optional search budget for Annoy.
    /// * `m` - HNSW connections per layer.
    /// * `ef_construction` - HNSW candidate list during construction.
    /// * `ef_search` - HNSW candidate list during search.
    /// * `diversify_prob` - NNDescent diversification probability.
    /// * `delta` - NNDescent early termination.
    /// * `ef_budget` - NNDescent query budget.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dist_metric: String,
        // annoy
        n_tree: usize,
        search_budget: Option<usize>,
        // hnsw
        m: usize,
        ef_construction: usize,
        ef_search: usize,
        // nndescent
        diversify_prob: T,
        delta: T,
        ef_budget: Option<usize>,
    ) -> Self {
        Self {
            dist_metric,
            n_tree,
            search_budget,
            m,
            ef_construction,
            ef_search,
            diversify_prob,
            delta,
            ef_budget,
        }
    }
}

impl<T> Default for NearestNeighbourParams<T>
where
    T: Float,
{
    /// Returns sensible defaults for the approximate nearest neighbour search
    ///
    /// ### Returns
    ///
    /// Initialised self with sensible default parameters.
    fn default() -> Self {
        Self {
            dist_metric: "euclidean".to_string(),
            // annoy
            n_tree: 4,
            search_budget: Some(1024),
            // hnsw
            m: 16,
            ef_construction: 200,
            ef_search: 100,
            // nndescent
            diversify_prob: T::zero(),
            delta: T::from(0.001).unwrap(),
            ef_budget: None,
        }
    }
}

/// Parse the AnnSearch to use
///
/// ### Params
///
/// * `s` - String defining the ANN search to use
///
/// ### Return
///
/// Option of AnnSearch
pub fn parse_ann_search(s: &str) -> Option<AnnSearch> {
    match s.to_lowercase().as_str() {
        "annoy" => Some(AnnSearch::Annoy),
        "hnsw" => Some(AnnSearch::Hnsw),
        "nndescent" => Some(AnnSearch::NNDescent),
        "exact" | "brute_force" => Some(AnnSearch::Exact),
        _ => None,
    }
}

/// Exact k-nearest neighbours via brute force
///
/// ### Params
///
/// * `data` - The data with samples x features
/// * `k` - Number of neighbours to return, self included
///
/// ### Returns
///
/// `(knn_indices, knn_dist)` sorted by squared Euclidean distance. Ties are
/// broken by index, so self comes first unless exact duplicates precede it.
pub fn exact_knn<T>(data: MatRef<T>, k: usize) -> (Vec<Vec<usize>>, Vec<Vec<T>>)
where
    T: Float + Send + Sync,
{
    let n = data.nrows();
    let n_dim = data.ncols();
    let rows: Vec<Vec<T>> = (0..n)
        .map(|i| (0..n_dim).map(|j| data[(i, j)]).collect())
        .collect();

    rows.par_iter()
        .enumerate()
        .map(|(i, p)| {
            let mut candidates: Vec<(T, usize)> = rows
                .iter()
                .enumerate()
                .map(|(j, q)| (euclidean_distance_squared(p, q), j))
                .collect();
            // self first for ties
            candidates.sort_by(|a, b| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| (a.1 != i).cmp(&(b.1 != i)))
                    .then_with(|| a.1.cmp(&b.1))
            });
            candidates.truncate(k);
            let (indices, dists): (Vec<usize>, Vec<T>) =
                candidates.into_iter().map(|(d, j)| (j, d)).unzip();
            (indices, dists)
        })
        .unzip()
}

/// Move self to the front of a neighbour list
///
/// If the index did not return the query point, self is prepended with
/// distance zero and the last neighbour is dropped.
fn with_self_first<T: Float>(
    i: usize,
    mut indices: Vec<usize>,
    mut dists: Vec<T>,
) -> (Vec<usize>, Vec<T>) {
    match indices.iter().position(|&j| j == i) {
        Some(0) => {}
        Some(pos) => {
            indices.remove(pos);
            dists.remove(pos);
            indices.insert(0, i);
            dists.insert(0, T::zero());
        }
        None => {
            indices.pop();
            dists.pop();
            indices.insert(0, i);
            dists.insert(0, T::zero());
        }
    }
    (indices, dists)
}

/// Run the nearest neighbour search
///
/// ### Params
///
/// * `data` - The data with samples x features
/// * `k` - Number of neighbours to return (self excluded)
/// * `ann_type` - Which nearest neighbour search to use. One of
///   `"annoy"`, `"hnsw"`, `"nndescent"` or `"exact"`.
/// * `params_nn` - The parameters for the approximate nearest neighbour search.
/// * `seed` - Seed for reproducibility.
///
/// ### Returns
///
/// `(knn_indices, knn_dist)` **including** self as the first entry of each
/// row, i.e., every row has `k + 1` entries. For the euclidean metric the
/// distances are squared.
pub fn run_ann_search_with_self<T>(
    data: MatRef<T>,
    k: usize,
    ann_type: &str,
    params_nn: &NearestNeighbourParams<T>,
    seed: usize,
) -> Result<(Vec<Vec<usize>>, Vec<Vec<T>>)>
where
    T: Float + FromPrimitive + ToPrimitive + Send + Sync + Default + Sum + SimdDistance,
    HnswIndex<T>: HnswState<T>,
    NNDescent<T>: ApplySortedUpdates<T> + NNDescentQuery<T>,
{
    let n = data.nrows();
    if n < 2 {
        return Err(HsneError::InvalidArgument(format!(
            "Nearest neighbour search needs at least 2 points, got {}",
            n
        )));
    }
    if k + 1 > n {
        return Err(HsneError::InvalidArgument(format!(
            "Cannot search {} neighbours in {} points",
            k, n
        )));
    }

    let ann_search = parse_ann_search(ann_type).unwrap_or_default();

    let (knn_indices, knn_dist) = match ann_search {
        AnnSearch::Annoy => {
            let index =
                build_annoy_index(data, params_nn.dist_metric.clone(), params_nn.n_tree, seed);

            query_annoy_index(data, &index, k + 1, params_nn.search_budget, true, false)
        }
        AnnSearch::Hnsw => {
            let index = build_hnsw_index(
                data,
                params_nn.m,
                params_nn.ef_construction,
                &params_nn.dist_metric,
                seed,
                false,
            );

            query_hnsw_index(data, &index, k + 1, params_nn.ef_search, true, false)
        }
        AnnSearch::NNDescent => {
            let index = build_nndescent_index(
                data,
                &params_nn.dist_metric,
                params_nn.delta,
                params_nn.diversify_prob,
                None, // will default to the 30 that is usually used in NNDescent
                None,
                None,
                None,
                seed,
                false,
            );

            query_nndescent_index(data, &index, k + 1, params_nn.ef_budget, true, false)
        }
        AnnSearch::Exact => {
            let (indices, dists) = exact_knn(data, k + 1);
            (indices, Some(dists))
        }
    };

    let knn_dist = knn_dist.ok_or_else(|| {
        HsneError::Runtime("Nearest neighbour index returned no distances".to_string())
    })?;

    let (knn_indices, knn_dist): (Vec<Vec<usize>>, Vec<Vec<T>>) = knn_indices
        .into_par_iter()
        .zip(knn_dist.into_par_iter())
        .enumerate()
        .map(|(i, (indices, dists))| with_self_first(i, indices, dists))
        .unzip();

    Ok((knn_indices, knn_dist))
}

/// Run the nearest neighbour search, self removed
///
/// ### Params
///
/// * `data` - The data with samples x features
/// * `k` - Number of neighbours to return
/// * `ann_type` - Which nearest neighbour search to use.
/// * `params_nn` - The parameters for the approximate nearest neighbour search.
/// * `seed` - Seed for reproducibility.
///
/// ### Returns
///
/// `(knn_indices, knn_dist)` excluding self.
pub fn run_ann_search<T>(
    data: MatRef<T>,
    k: usize,
    ann_type: &str,
    params_nn: &NearestNeighbourParams<T>,
    seed: usize,
) -> Result<(Vec<Vec<usize>>, Vec<Vec<T>>)>
where
    T: Float + FromPrimitive + ToPrimitive + Send + Sync + Default + Sum + SimdDistance,
    HnswIndex<T>: HnswState<T>,
    NNDescent<T>: ApplySortedUpdates<T> + NNDescentQuery<T>,
{
    let (knn_indices, knn_dist) = run_ann_search_with_self(data, k, ann_type, params_nn, seed)?;

    // remove self (first element) from both indices and distances
    let knn_indices: Vec<Vec<usize>> = knn_indices
        .into_par_iter()
        .map(|mut v| v.drain(1..).collect())
        .collect();

    let knn_dist: Vec<Vec<T>> = knn_dist
        .into_par_iter()
        .map(|mut v| v.drain(1..).collect())
        .collect();

    Ok((knn_indices, knn_dist))
}

///////////
// Tests //
///////////
