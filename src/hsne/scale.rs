use num_traits::Float;
use thousands::Separable;

use crate::data::structures::*;
use crate::log_progress;

///////////
// Scale //
///////////

/// One level of the hierarchy
///
/// ### Fields
///
/// * `landmark_to_original_data_idx` - Landmark → index in the full data
/// * `landmark_to_previous_scale_idx` - Landmark → index in the previous scale
/// * `transition_matrix` - Row-stochastic matrix over the landmarks
/// * `landmark_weight` - Mass of the previous-scale points a landmark
///   represents
/// * `previous_scale_to_landmark_idx` - Previous-scale point → landmark, if it
///   was promoted
/// * `area_of_influence` - Previous-scale point → probability of reaching each
///   landmark
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scale<T> {
    pub landmark_to_original_data_idx: Vec<usize>,
    pub landmark_to_previous_scale_idx: Vec<usize>,
    pub transition_matrix: SparseMatrix<T>,
    pub landmark_weight: Vec<T>,
    pub previous_scale_to_landmark_idx: Vec<Option<usize>>,
    pub area_of_influence: SparseMatrix<T>,
}

impl<T> Scale<T>
where
    T: Float,
{
    /// Finest scale: every data point is its own landmark with unit weight
    pub fn identity(transition_matrix: SparseMatrix<T>) -> Self {
        let n = transition_matrix.len();
        Self {
            landmark_to_original_data_idx: (0..n).collect(),
            landmark_to_previous_scale_idx: (0..n).collect(),
            transition_matrix,
            landmark_weight: vec![T::one(); n],
            previous_scale_to_landmark_idx: Vec::new(),
            area_of_influence: Vec::new(),
        }
    }

    /// Number of landmarks
    pub fn size(&self) -> usize {
        self.transition_matrix.len()
    }

    /// Estimated memory held by the scale in MB
    pub fn mim_memory_occupation(&self) -> f64 {
        let idx = std::mem::size_of::<u32>();
        let scalar = std::mem::size_of::<T>();

        let mut bytes = 0;
        bytes += self.landmark_to_original_data_idx.len() * idx;
        bytes += self.landmark_to_previous_scale_idx.len() * idx;
        bytes += self.landmark_weight.len() * scalar;
        bytes += sparse_matrix_nnz(&self.transition_matrix) * (idx + scalar);
        bytes += self.previous_scale_to_landmark_idx.len() * std::mem::size_of::<i32>();
        bytes += sparse_matrix_nnz(&self.area_of_influence) * (idx + scalar);

        bytes as f64 / 1024.0 / 1024.0
    }
}

////////////////
// Statistics //
////////////////

/// Timings (seconds) and counters of the last hierarchy construction
///
/// Values are `None` until the corresponding step ran.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Statistics {
    pub total_time: Option<f64>,
    pub init_knn_time: Option<f64>,
    pub init_probabilities_time: Option<f64>,
    pub init_fmc_time: Option<f64>,
    pub mcmc_sampling_time: Option<f64>,
    pub landmarks_selection_time: Option<f64>,
    pub landmarks_selection_num_walks: Option<usize>,
    pub aoi_num_walks: Option<usize>,
    pub aoi_time: Option<f64>,
    pub fmc_time: Option<f64>,
    pub aoi_sparsity: Option<f64>,
    pub fmc_sparsity: Option<f64>,
    pub fmc_effective_sparsity: Option<f64>,
}

impl Statistics {
    /// Forget all recorded values
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Add `secs` to the total time
    pub(crate) fn add_total_time(&mut self, secs: f64) {
        self.total_time = Some(self.total_time.unwrap_or(0.0) + secs);
    }

    /// Write the recorded values to the log
    pub fn log(&self, verbose: bool) {
        fn secs(v: Option<f64>) -> String {
            v.map(|s| format!("{:.3}s", s))
                .unwrap_or_else(|| "-".to_string())
        }
        fn count(v: Option<usize>) -> String {
            v.map(|c| c.separate_with_underscores())
                .unwrap_or_else(|| "-".to_string())
        }
        fn ratio(v: Option<f64>) -> String {
            v.map(|r| format!("{:.4}", r))
                .unwrap_or_else(|| "-".to_string())
        }

        log_progress!(verbose, "HSNE statistics");
        log_progress!(verbose, "  total time: {}", secs(self.total_time));
        log_progress!(verbose, "  init kNN time: {}", secs(self.init_knn_time));
        log_progress!(
            verbose,
            "  init probabilities time: {}",
            secs(self.init_probabilities_time)
        );
        log_progress!(verbose, "  init FMC time: {}", secs(self.init_fmc_time));
        log_progress!(
            verbose,
            "  MCMC sampling time: {}",
            secs(self.mcmc_sampling_time)
        );
        log_progress!(
            verbose,
            "  landmark selection time: {} ({} walks)",
            secs(self.landmarks_selection_time),
            count(self.landmarks_selection_num_walks)
        );
        log_progress!(
            verbose,
            "  AoI time: {} ({} walks)",
            secs(self.aoi_time),
            count(self.aoi_num_walks)
        );
        log_progress!(verbose, "  FMC time: {}", secs(self.fmc_time));
        log_progress!(verbose, "  AoI sparsity: {}", ratio(self.aoi_sparsity));
        log_progress!(verbose, "  FMC sparsity: {}", ratio(self.fmc_sparsity));
        log_progress!(
            verbose,
            "  FMC effective sparsity: {}",
            ratio(self.fmc_effective_sparsity)
        );
    }
}

#[cfg(test)]
mod test_scale {
    use super::*;

    #[test]
    fn test_identity_scale() {
        let tm = vec![
            SparseRow::from_pairs(vec![(1, 1.0_f64)]),
            SparseRow::from_pairs(vec![(0, 1.0)]),
        ];
        let scale = Scale::identity(tm);

        assert_eq!(scale.size(), 2);
        assert_eq!(scale.landmark_to_original_data_idx, vec![0, 1]);
        assert_eq!(scale.landmark_weight, vec![1.0, 1.0]);
        assert!(scale.area_of_influence.is_empty());
    }

    #[test]
    fn test_memory_occupation() {
        let tm = vec![SparseRow::from_pairs(vec![(0, 1.0_f32)]); 1024];
        let scale = Scale::identity(tm);

        // 2 index maps + weights + 1024 entries of (u32, f32)
        let expected = (1024.0 * 4.0 * 3.0 + 1024.0 * 8.0) / 1024.0 / 1024.0;
        assert!((scale.mim_memory_occupation() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_statistics_reset() {
        let mut stats = Statistics {
            aoi_time: Some(1.0),
            ..Default::default()
        };
        stats.add_total_time(0.5);
        stats.add_total_time(0.25);
        assert_eq!(stats.total_time, Some(0.75));

        stats.log(false);
        stats.reset();
        assert_eq!(stats, Statistics::default());
    }
}
