//! Hierarchical stochastic neighbour embedding: a stack of ever coarser
//! scales, each made of landmarks selected with random walks over the
//! transition matrix of the previous scale.

pub mod aoi;
pub mod cluster_tree;
pub mod io;
pub mod landmarks;
pub mod params;
pub mod queries;
pub mod scale;

use ann_search_rs::hnsw::{HnswIndex, HnswState};
use ann_search_rs::nndescent::{ApplySortedUpdates, NNDescent, NNDescentQuery};
use ann_search_rs::utils::dist::SimdDistance;
use faer::{Mat, MatRef};
use num_traits::{Float, FromPrimitive, ToPrimitive};
use std::iter::Sum;
use std::ops::AddAssign;
use std::time::Instant;
use thousands::Separable;

use crate::data::graph::gaussian_knn_affinities;
use crate::data::nearest_neighbours::run_ann_search;
use crate::data::structures::*;
use crate::error::{HsneError, Result};
use crate::log_progress;
use crate::utils::rng::resolve_seed;
use crate::utils::sparse_ops::normalise_rows_l1;

pub use aoi::AreaOfInfluence;
pub use cluster_tree::{Cluster, ClusterTree, NULL_LINK};
pub use landmarks::LandmarkSelection;
pub use params::{AoiStrategy, HsneParams};
pub use scale::{Scale, Statistics};

/// Random stream of the landmark selection of a scale
const SELECTION_STREAM: u64 = 0;
/// Random stream of the area of influence of a scale
const AOI_STREAM: u64 = 1;

/// Iterations of the perplexity search of the finest scale
const PERPLEXITY_MAX_ITER: usize = 200;
/// Entropy tolerance of the perplexity search of the finest scale
const PERPLEXITY_TOL: f64 = 1e-5;

/// Random stream of one step of one scale
fn scale_stream(scale_id: usize, step: u64) -> u64 {
    (scale_id as u64) << 8 | step
}

/////////////////////
// HierarchicalSne //
/////////////////////

/// Multi-scale landmark hierarchy
///
/// Scale 0 holds every data point. Each call to `add_scale()` appends a
/// coarser scale built from the last one.
///
/// ### Fields
///
/// * `params` - Parameters of the construction
/// * `hierarchy` - The scales, finest first
/// * `statistics` - Timings and counters of the last steps
/// * `high_dimensional_data` - Row-major copy of the input data (empty if the
///   hierarchy was built from similarities or loaded)
/// * `dimensionality` - Number of features of the input data
/// * `initialized` - Scale 0 exists
#[derive(Clone, Debug)]
pub struct HierarchicalSne<T> {
    params: HsneParams,
    hierarchy: Vec<Scale<T>>,
    statistics: Statistics,
    high_dimensional_data: Vec<T>,
    dimensionality: usize,
    initialized: bool,
}

impl<T> Default for HierarchicalSne<T> {
    fn default() -> Self {
        Self {
            params: HsneParams::default(),
            hierarchy: Vec::new(),
            statistics: Statistics::default(),
            high_dimensional_data: Vec::new(),
            dimensionality: 0,
            initialized: false,
        }
    }
}

impl<T> HierarchicalSne<T>
where
    T: Float
        + FromPrimitive
        + ToPrimitive
        + Send
        + Sync
        + AddAssign
        + Default
        + Sum
        + SimdDistance,
    HnswIndex<T>: HnswState<T>,
    NNDescent<T>: ApplySortedUpdates<T> + NNDescentQuery<T>,
{
    /// Build scale 0 from high-dimensional data
    ///
    /// The `num_neighbors` nearest neighbours of every point receive Gaussian
    /// probabilities fitted to a perplexity of `num_neighbors / 3`.
    ///
    /// ### Params
    ///
    /// * `data` - Samples x features
    /// * `params` - Parameters of the hierarchy
    ///
    /// ### Returns
    ///
    /// `HsneError::InvalidArgument` for fewer than 2 points, no features or an
    /// unusable number of neighbours
    pub fn initialize(&mut self, data: MatRef<T>, params: HsneParams) -> Result<()> {
        let n = data.nrows();
        let dim = data.ncols();
        if dim == 0 {
            return Err(HsneError::InvalidArgument(
                "Dimensionality of the data must be positive".to_string(),
            ));
        }
        if n < 2 {
            return Err(HsneError::InvalidArgument(format!(
                "HSNE needs at least 2 data points, got {}",
                n
            )));
        }
        if params.num_neighbors == 0 || params.num_neighbors >= n {
            return Err(HsneError::InvalidArgument(format!(
                "num_neighbors must be in [1, {}), got {}",
                n, params.num_neighbors
            )));
        }

        let start = Instant::now();
        self.clear();
        self.params = params;
        self.dimensionality = dim;
        self.high_dimensional_data = (0..n)
            .flat_map(|i| (0..dim).map(move |j| data[(i, j)]))
            .collect();

        log_progress!(
            self.params.verbose,
            "Initialising HSNE with {} points of dimensionality {}",
            n.separate_with_underscores(),
            dim
        );

        let seed = resolve_seed(self.params.seed);
        let nn_params = self.params.nn_params::<T>();

        let start_knn = Instant::now();
        let (knn_indices, knn_dist) = run_ann_search(
            data,
            self.params.num_neighbors,
            &self.params.ann_type,
            &nn_params,
            seed as usize,
        )?;
        self.statistics.init_knn_time = Some(start_knn.elapsed().as_secs_f64());

        let start_prob = Instant::now();
        let perplexity =
            T::from_usize(self.params.num_neighbors).unwrap() / T::from_f64(3.0).unwrap();
        let probabilities = gaussian_knn_affinities(
            &knn_indices,
            &knn_dist,
            perplexity,
            T::from_f64(PERPLEXITY_TOL).unwrap(),
            PERPLEXITY_MAX_ITER,
        )?;
        self.statistics.init_probabilities_time = Some(start_prob.elapsed().as_secs_f64());

        let start_fmc = Instant::now();
        let mut transition_matrix = probabilities;
        normalise_rows_l1(&mut transition_matrix);
        self.hierarchy.push(Scale::identity(transition_matrix));
        self.statistics.init_fmc_time = Some(start_fmc.elapsed().as_secs_f64());

        self.initialized = true;
        self.statistics.add_total_time(start.elapsed().as_secs_f64());

        log_progress!(
            self.params.verbose,
            "Scale 0 ready in {:.2?}",
            start.elapsed()
        );

        Ok(())
    }

    /// Build scale 0 from a flat row-major buffer
    ///
    /// ### Params
    ///
    /// * `data` - `n * dimensionality` values, one row per point
    /// * `dimensionality` - Number of features
    /// * `params` - Parameters of the hierarchy
    pub fn initialize_from_flat(
        &mut self,
        data: &[T],
        dimensionality: usize,
        params: HsneParams,
    ) -> Result<()> {
        if dimensionality == 0 || data.len() % dimensionality != 0 {
            return Err(HsneError::InvalidArgument(format!(
                "Buffer of length {} does not hold points of dimensionality {}",
                data.len(),
                dimensionality
            )));
        }
        let n = data.len() / dimensionality;
        let mat = Mat::from_fn(n, dimensionality, |i, j| data[i * dimensionality + j]);
        self.initialize(mat.as_ref(), params)
    }
}

impl<T> HierarchicalSne<T>
where
    T: Float + FromPrimitive + ToPrimitive + Send + Sync + AddAssign,
{
    /// Empty, uninitialised hierarchy
    pub fn new() -> Self {
        Self::default()
    }

    /// Hierarchy restored from its scales
    pub(crate) fn from_hierarchy(hierarchy: Vec<Scale<T>>, params: HsneParams) -> Self {
        Self {
            params,
            initialized: !hierarchy.is_empty(),
            hierarchy,
            ..Self::default()
        }
    }

    /// Build scale 0 from a similarity matrix
    ///
    /// The rows are used as the transition matrix of scale 0 as they are.
    ///
    /// ### Params
    ///
    /// * `similarities` - One row per data point
    /// * `params` - Parameters of the hierarchy
    ///
    /// ### Returns
    ///
    /// `HsneError::InvalidArgument` for fewer than 2 rows or a column index
    /// outside the matrix
    pub fn initialize_with_similarities(
        &mut self,
        similarities: SparseMatrix<T>,
        params: HsneParams,
    ) -> Result<()> {
        let n = similarities.len();
        if n < 2 {
            return Err(HsneError::InvalidArgument(format!(
                "HSNE needs at least 2 data points, got {}",
                n
            )));
        }
        if let Some((i, row)) = similarities
            .iter()
            .enumerate()
            .find(|(_, row)| row.indices.iter().any(|&j| j >= n))
        {
            return Err(HsneError::InvalidArgument(format!(
                "Row {} of the similarity matrix refers to column {} of {}",
                i,
                row.indices.iter().max().copied().unwrap_or_default(),
                n
            )));
        }

        let start = Instant::now();
        self.clear();
        self.params = params;
        self.hierarchy.push(Scale::identity(similarities));
        self.initialized = true;
        self.statistics.init_fmc_time = Some(start.elapsed().as_secs_f64());
        self.statistics.add_total_time(start.elapsed().as_secs_f64());

        log_progress!(
            self.params.verbose,
            "Scale 0 initialised from {} similarities",
            n.separate_with_underscores()
        );

        Ok(())
    }

    /// Append a coarser scale to the hierarchy
    ///
    /// ### Returns
    ///
    /// The new scale. `HsneError::Logic` if the hierarchy is not initialised,
    /// `HsneError::Degenerate` if fewer than two landmarks are selected. The
    /// hierarchy is unchanged on error.
    pub fn add_scale(&mut self) -> Result<&Scale<T>> {
        if !self.initialized {
            return Err(HsneError::Logic(
                "add_scale: the hierarchy must be initialised first".to_string(),
            ));
        }
        if self.params.num_walks_per_landmark == 0 {
            return Err(HsneError::InvalidArgument(
                "num_walks_per_landmark must be positive".to_string(),
            ));
        }

        self.statistics.reset();
        let start = Instant::now();
        let scale_id = self.hierarchy.len();
        let previous = &self.hierarchy[scale_id - 1];
        let params = &self.params;
        let stats = &mut self.statistics;
        let seed = resolve_seed(params.seed);

        log_progress!(
            params.verbose,
            "Adding scale {} on top of {} landmarks",
            scale_id,
            previous.size().separate_with_underscores()
        );

        let selection_stream = scale_stream(scale_id, SELECTION_STREAM);
        let selection = if params.monte_carlo_sampling {
            landmarks::select_landmarks_mcmcs(previous, params, seed, selection_stream, stats)
        } else {
            landmarks::select_landmarks_random(previous, params, seed, selection_stream, stats)?
        };

        if selection.len() < 2 {
            log::warn!(
                "Scale {} would hold {} landmarks; the hierarchy is not extended",
                scale_id,
                selection.len()
            );
            return Err(HsneError::Degenerate(format!(
                "Landmark selection for scale {} returned {} landmarks",
                scale_id,
                selection.len()
            )));
        }

        let aoi = aoi::compute_area_of_influence(
            params.aoi_strategy(),
            previous,
            &selection,
            params,
            seed,
            scale_stream(scale_id, AOI_STREAM),
            stats,
        );

        let scale = Scale {
            landmark_to_original_data_idx: selection.landmark_to_original_data_idx,
            landmark_to_previous_scale_idx: selection.landmark_to_previous_scale_idx,
            transition_matrix: aoi.transition_matrix,
            landmark_weight: aoi.landmark_weight,
            previous_scale_to_landmark_idx: selection.previous_scale_to_landmark_idx,
            area_of_influence: aoi.area_of_influence,
        };

        self.statistics.add_total_time(start.elapsed().as_secs_f64());
        log_progress!(
            self.params.verbose,
            "Scale {} ready with {} landmarks in {:.2?} (~{:.2} MB)",
            scale_id,
            scale.size().separate_with_underscores(),
            start.elapsed(),
            scale.mim_memory_occupation()
        );
        self.statistics.log(self.params.verbose);

        self.hierarchy.push(scale);
        Ok(&self.hierarchy[scale_id])
    }

    /// Drop the hierarchy but keep the data and the parameters
    pub fn reset(&mut self) {
        self.hierarchy.clear();
        self.statistics.reset();
        self.initialized = false;
    }

    /// Drop the hierarchy and the data
    pub fn clear(&mut self) {
        self.reset();
        self.high_dimensional_data.clear();
        self.dimensionality = 0;
    }

    /// Returns true once scale 0 exists
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn params(&self) -> &HsneParams {
        &self.params
    }

    /// Parameters used by subsequent `add_scale()` calls
    pub fn params_mut(&mut self) -> &mut HsneParams {
        &mut self.params
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Number of features of the input data (0 if unknown)
    pub fn dimensionality(&self) -> usize {
        self.dimensionality
    }

    /// Number of data points, i.e., the size of scale 0
    pub fn num_data_points(&self) -> usize {
        self.hierarchy.first().map_or(0, |s| s.size())
    }

    pub fn hierarchy(&self) -> &[Scale<T>] {
        &self.hierarchy
    }

    pub fn num_scales(&self) -> usize {
        self.hierarchy.len()
    }

    /// Scale `scale_id`
    ///
    /// ### Returns
    ///
    /// `HsneError::Logic` if the scale does not exist
    pub fn scale(&self, scale_id: usize) -> Result<&Scale<T>> {
        self.hierarchy.get(scale_id).ok_or_else(|| {
            HsneError::Logic(format!(
                "Scale {} requested but the hierarchy has {} scales",
                scale_id,
                self.hierarchy.len()
            ))
        })
    }

    /// The coarsest scale
    pub fn top_scale(&self) -> Result<&Scale<T>> {
        self.hierarchy
            .last()
            .ok_or_else(|| HsneError::Logic("The hierarchy is empty".to_string()))
    }

    /// Features of data point `handle`
    ///
    /// ### Returns
    ///
    /// `HsneError::InvalidArgument` if the data is not available or the handle
    /// is out of range
    pub fn high_dimensional_descriptor(&self, handle: usize) -> Result<&[T]> {
        let dim = self.dimensionality;
        if dim == 0 || (handle + 1) * dim > self.high_dimensional_data.len() {
            return Err(HsneError::InvalidArgument(format!(
                "No high-dimensional descriptor for point {}",
                handle
            )));
        }
        Ok(&self.high_dimensional_data[handle * dim..(handle + 1) * dim])
    }
}

#[cfg(test)]
mod test_hsne {
    use super::*;
    use approx::assert_relative_eq;

    /// Two well separated rings of points in 2D
    fn two_rings(n_per_ring: usize) -> Mat<f64> {
        Mat::from_fn(2 * n_per_ring, 2, |i, j| {
            let ring = i / n_per_ring;
            let angle = (i % n_per_ring) as f64 / n_per_ring as f64 * std::f64::consts::TAU;
            let offset = ring as f64 * 100.0;
            if j == 0 {
                offset + 10.0 * angle.cos()
            } else {
                10.0 * angle.sin()
            }
        })
    }

    fn params() -> HsneParams {
        HsneParams {
            seed: 17,
            num_neighbors: 10,
            ann_type: "exact".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_initialize() {
        let data = two_rings(100);
        let mut hsne = HierarchicalSne::new();
        hsne.initialize(data.as_ref(), params()).unwrap();

        assert!(hsne.is_initialized());
        assert_eq!(hsne.num_scales(), 1);
        assert_eq!(hsne.num_data_points(), 200);
        assert_eq!(hsne.dimensionality(), 2);
        assert_eq!(hsne.high_dimensional_descriptor(100).unwrap(), &[110.0, 0.0]);
        assert!(hsne.high_dimensional_descriptor(200).is_err());

        let scale = hsne.scale(0).unwrap();
        for (i, row) in scale.transition_matrix.iter().enumerate() {
            assert_eq!(row.len(), 10);
            assert!(row.get(i).is_none());
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-9);
        }
        assert!(hsne.statistics().init_knn_time.is_some());
    }

    #[test]
    fn test_initialize_errors() {
        let mut hsne = HierarchicalSne::<f64>::new();
        let one = Mat::<f64>::zeros(1, 3);
        assert!(matches!(
            hsne.initialize(one.as_ref(), params()),
            Err(HsneError::InvalidArgument(_))
        ));
        let no_dim = Mat::<f64>::zeros(10, 0);
        assert!(matches!(
            hsne.initialize(no_dim.as_ref(), params()),
            Err(HsneError::InvalidArgument(_))
        ));
        assert!(hsne.initialize_from_flat(&[1.0, 2.0, 3.0], 2, params()).is_err());
        assert!(matches!(hsne.add_scale(), Err(HsneError::Logic(_))));

        let bad = vec![
            SparseRow::from_pairs(vec![(1, 1.0)]),
            SparseRow::from_pairs(vec![(5, 1.0)]),
        ];
        assert!(hsne.initialize_with_similarities(bad, params()).is_err());
    }

    #[test]
    fn test_add_scale() {
        let data = two_rings(200);
        let mut hsne = HierarchicalSne::new();
        hsne.initialize(data.as_ref(), params()).unwrap();

        let n_landmarks = hsne.add_scale().unwrap().size();
        assert!(n_landmarks >= 2);
        assert!(n_landmarks < 400);
        assert_eq!(hsne.num_scales(), 2);

        let scale = hsne.top_scale().unwrap();
        assert_eq!(scale.area_of_influence.len(), 400);
        assert_eq!(scale.previous_scale_to_landmark_idx.len(), 400);
        for (l, &p) in scale.landmark_to_previous_scale_idx.iter().enumerate() {
            assert_eq!(scale.previous_scale_to_landmark_idx[p], Some(l));
            assert_eq!(scale.landmark_to_original_data_idx[l], p);
        }
        for row in &scale.transition_matrix {
            assert!(row.is_empty() || (row.sum() - 1.0).abs() < 1e-3);
        }
        assert!(hsne.statistics().aoi_num_walks.is_some());
    }

    #[test]
    fn test_statistics_per_scale() {
        let data = two_rings(200);
        let mut hsne = HierarchicalSne::new();
        let params = HsneParams {
            monte_carlo_sampling: false,
            rs_reduction_factor_per_layer: 0.5,
            ..params()
        };
        let num_walks = params.num_walks_per_landmark;
        hsne.initialize(data.as_ref(), params).unwrap();

        hsne.add_scale().unwrap();
        assert_eq!(hsne.statistics().aoi_num_walks, Some(400 * num_walks));

        let n_landmarks = hsne.scale(1).unwrap().size();
        hsne.add_scale().unwrap();
        let stats = hsne.statistics();
        assert_eq!(stats.aoi_num_walks, Some(n_landmarks * num_walks));
        assert!(stats.landmarks_selection_num_walks.is_some());
        assert!(stats.init_knn_time.is_none());
        assert!(stats.init_fmc_time.is_none());
        assert!(stats.total_time.is_some());
    }

    #[test]
    fn test_degenerate_scale_keeps_hierarchy() {
        let tm: SparseMatrix<f64> = (0..10)
            .map(|i| SparseRow::from_pairs(vec![((i + 1) % 10, 1.0)]))
            .collect();
        let mut hsne = HierarchicalSne::new();
        hsne.initialize_with_similarities(
            tm,
            HsneParams {
                seed: 1,
                monte_carlo_sampling: false,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(matches!(hsne.add_scale(), Err(HsneError::Degenerate(_))));
        assert_eq!(hsne.num_scales(), 1);

        hsne.reset();
        assert!(!hsne.is_initialized());
        assert!(hsne.top_scale().is_err());
    }
}
