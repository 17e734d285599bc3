use num_traits::Float;
use serde::{Deserialize, Serialize};

use crate::data::nearest_neighbours::NearestNeighbourParams;

/// How the area of influence of a new scale is computed
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AoiStrategy {
    /// Landmark similarities are accumulated while the walks run.
    #[default]
    InCore,
    /// The area of influence is materialised first and the landmark
    /// similarities are derived from it afterwards. Walks are allowed to run
    /// longer.
    OutOfCore,
}

/// Parameters of the hierarchy construction
///
/// ### Fields
///
/// * `seed` - Seed for the random walks. A negative seed picks a new
///   time-based seed for every scale, results are then not reproducible.
/// * `num_neighbors` - Number of nearest neighbours of the finest scale. The
///   Gaussian kernels are fitted to a perplexity of `num_neighbors / 3`.
/// * `aknn_num_trees` - Number of Annoy trees.
/// * `aknn_num_checks` - Search budget of the Annoy queries.
/// * `ann_type` - Nearest neighbour backend (`"annoy"`, `"hnsw"`,
///   `"nndescent"` or `"exact"`).
/// * `monte_carlo_sampling` - Select landmarks with Markov chain Monte Carlo
///   sampling. If false, landmarks are drawn at random.
/// * `mcmcs_num_walks` - Walks started from every point during MCMC sampling.
/// * `mcmcs_landmark_thresh` - A point becomes a landmark if more than
///   `mcmcs_num_walks * mcmcs_landmark_thresh` walks end on it.
/// * `mcmcs_walk_length` - Length of the MCMC sampling walks.
/// * `rs_reduction_factor_per_layer` - Fraction of points kept as landmarks
///   with random sampling.
/// * `rs_outliers_removal_jumps` - Hops taken from a randomly drawn point
///   before it is accepted as landmark.
/// * `num_walks_per_landmark` - Walks started from every previous-scale point
///   to estimate its area of influence.
/// * `transition_matrix_prune_thresh` - Walk counts at or below this value are
///   ignored when landmark similarities are built.
/// * `out_of_core_computation` - Use `AoiStrategy::OutOfCore`.
/// * `verbose` - Log progress at `info` level instead of `debug`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HsneParams {
    pub seed: i64,
    pub num_neighbors: usize,
    pub aknn_num_trees: usize,
    pub aknn_num_checks: usize,
    pub ann_type: String,
    pub monte_carlo_sampling: bool,
    pub mcmcs_num_walks: usize,
    pub mcmcs_landmark_thresh: f64,
    pub mcmcs_walk_length: usize,
    pub rs_reduction_factor_per_layer: f64,
    pub rs_outliers_removal_jumps: usize,
    pub num_walks_per_landmark: usize,
    pub transition_matrix_prune_thresh: f64,
    pub out_of_core_computation: bool,
    pub verbose: bool,
}

impl Default for HsneParams {
    fn default() -> Self {
        Self {
            seed: -1,
            num_neighbors: 30,
            aknn_num_trees: 4,
            aknn_num_checks: 1024,
            ann_type: "annoy".to_string(),
            monte_carlo_sampling: true,
            mcmcs_num_walks: 10,
            mcmcs_landmark_thresh: 1.5,
            mcmcs_walk_length: 10,
            rs_reduction_factor_per_layer: 0.1,
            rs_outliers_removal_jumps: 10,
            num_walks_per_landmark: 100,
            transition_matrix_prune_thresh: 1.5,
            out_of_core_computation: false,
            verbose: false,
        }
    }
}

impl HsneParams {
    /// Generate new parameters; `None` keeps the default
    ///
    /// ### Params
    ///
    /// * `seed` - Seed of the random walks (negative = time based)
    /// * `num_neighbors` - Neighbours of the finest scale
    /// * `monte_carlo_sampling` - MCMC sampling (true) or random sampling
    /// * `num_walks_per_landmark` - Walks per point for the area of influence
    /// * `out_of_core_computation` - Out-of-core area of influence
    /// * `verbose` - Controls verbosity
    pub fn new(
        seed: Option<i64>,
        num_neighbors: Option<usize>,
        monte_carlo_sampling: Option<bool>,
        num_walks_per_landmark: Option<usize>,
        out_of_core_computation: Option<bool>,
        verbose: bool,
    ) -> Self {
        let default = Self::default();
        Self {
            seed: seed.unwrap_or(default.seed),
            num_neighbors: num_neighbors.unwrap_or(default.num_neighbors),
            monte_carlo_sampling: monte_carlo_sampling.unwrap_or(default.monte_carlo_sampling),
            num_walks_per_landmark: num_walks_per_landmark
                .unwrap_or(default.num_walks_per_landmark),
            out_of_core_computation: out_of_core_computation
                .unwrap_or(default.out_of_core_computation),
            verbose,
            ..default
        }
    }

    /// Strategy for the area of influence
    pub fn aoi_strategy(&self) -> AoiStrategy {
        if self.out_of_core_computation {
            AoiStrategy::OutOfCore
        } else {
            AoiStrategy::InCore
        }
    }

    /// Nearest neighbour parameters derived from the Annoy settings
    pub fn nn_params<T: Float>(&self) -> NearestNeighbourParams<T> {
        NearestNeighbourParams {
            n_tree: self.aknn_num_trees,
            search_budget: Some(self.aknn_num_checks),
            ..NearestNeighbourParams::default()
        }
    }

    /// Walk count a point needs to exceed to become an MCMCS landmark
    pub(crate) fn mcmcs_threshold(&self) -> usize {
        (self.mcmcs_num_walks as f64 * self.mcmcs_landmark_thresh) as usize
    }

    /// Maximum length of a walk looking for a landmark
    pub(crate) fn max_aoi_walk_length(&self) -> usize {
        match self.aoi_strategy() {
            AoiStrategy::InCore => 100,
            AoiStrategy::OutOfCore => 200,
        }
    }
}

#[cfg(test)]
mod test_params {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = HsneParams::default();
        assert_eq!(params.seed, -1);
        assert_eq!(params.num_neighbors, 30);
        assert_eq!(params.mcmcs_threshold(), 15);
        assert_eq!(params.aoi_strategy(), AoiStrategy::InCore);
        assert_eq!(params.max_aoi_walk_length(), 100);

        let nn = params.nn_params::<f32>();
        assert_eq!(nn.n_tree, 4);
        assert_eq!(nn.search_budget, Some(1024));
    }

    #[test]
    fn test_new_keeps_unset_defaults() {
        let params = HsneParams::new(Some(5), None, Some(false), None, Some(true), true);
        assert_eq!(params.seed, 5);
        assert_eq!(params.num_neighbors, 30);
        assert!(!params.monte_carlo_sampling);
        assert_eq!(params.aoi_strategy(), AoiStrategy::OutOfCore);
        assert_eq!(params.max_aoi_walk_length(), 200);
        assert_eq!(params.rs_outliers_removal_jumps, 10);
    }

    #[test]
    fn test_partial_json() {
        let params: HsneParams =
            serde_json::from_str(r#"{"seed": 3, "mcmcs_num_walks": 20}"#).unwrap();
        assert_eq!(params.seed, 3);
        assert_eq!(params.mcmcs_num_walks, 20);
        assert_eq!(params.mcmcs_threshold(), 30);
        assert_eq!(params.num_walks_per_landmark, 100);
    }
}
