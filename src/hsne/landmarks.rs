use num_traits::{Float, ToPrimitive};
use rand::Rng;
use rayon::prelude::*;
use std::time::Instant;
use thousands::Separable;

use crate::data::structures::*;
use crate::error::{HsneError, Result};
use crate::hsne::params::HsneParams;
use crate::hsne::scale::{Scale, Statistics};
use crate::log_progress;
use crate::utils::rng::point_rng;

//////////////////
// Random walks //
//////////////////

/// One step of a walk
///
/// Returns `None` if the row has no outgoing mass or the drawn step stays on
/// the current point.
#[inline]
fn walk_step<T, R>(current: usize, transition_matrix: &[SparseRow<T>], rng: &mut R) -> Option<usize>
where
    T: Float,
    R: Rng,
{
    debug_assert!(current < transition_matrix.len());
    let rnd: f64 = rng.random();
    let mut cumulative = 0.0;
    for (idx, p) in transition_matrix[current].iter() {
        cumulative += p.to_f64().unwrap_or(0.0);
        if rnd < cumulative {
            return (idx != current).then_some(idx);
        }
    }
    None
}

/// Random walk of bounded length over a transition matrix
///
/// ### Params
///
/// * `start` - Starting point
/// * `max_length` - Steps beyond the first one
/// * `transition_matrix` - Row-stochastic sparse matrix
/// * `rng` - Generator
///
/// ### Returns
///
/// The end point, or `None` if the walk got stuck
pub fn random_walk<T, R>(
    start: usize,
    max_length: usize,
    transition_matrix: &[SparseRow<T>],
    rng: &mut R,
) -> Option<usize>
where
    T: Float,
    R: Rng,
{
    let mut current = start;
    let mut length = 0;
    loop {
        current = walk_step(current, transition_matrix, rng)?;
        length += 1;
        if length > max_length {
            return Some(current);
        }
    }
}

/// Random walk that stops on the first landmark it reaches
///
/// At least one step is always taken, so a walk started on a landmark
/// reports the landmark it moves to.
///
/// ### Params
///
/// * `start` - Starting point
/// * `stopping_points` - Point → landmark index, `None` for regular points
/// * `max_length` - Maximum number of steps
/// * `transition_matrix` - Row-stochastic sparse matrix
/// * `rng` - Generator
///
/// ### Returns
///
/// The landmark index reached, or `None` if the walk got stuck or was too
/// long
pub fn random_walk_with_stopping_points<T, R>(
    start: usize,
    stopping_points: &[Option<usize>],
    max_length: usize,
    transition_matrix: &[SparseRow<T>],
    rng: &mut R,
) -> Option<usize>
where
    T: Float,
    R: Rng,
{
    let mut current = start;
    let mut length = 0;
    loop {
        current = walk_step(current, transition_matrix, rng)?;
        length += 1;
        if stopping_points[current].is_some() || length > max_length {
            break;
        }
    }
    if length > max_length {
        return None;
    }
    stopping_points[current]
}

////////////////////////
// Landmark selection //
////////////////////////

/// Landmarks chosen for a new scale
///
/// ### Fields
///
/// * `landmark_to_previous_scale_idx` - Landmark → previous-scale point
/// * `landmark_to_original_data_idx` - Landmark → original data point
/// * `previous_scale_to_landmark_idx` - Previous-scale point → landmark
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LandmarkSelection {
    pub landmark_to_previous_scale_idx: Vec<usize>,
    pub landmark_to_original_data_idx: Vec<usize>,
    pub previous_scale_to_landmark_idx: Vec<Option<usize>>,
}

impl LandmarkSelection {
    fn with_capacity(previous_size: usize, num_landmarks: usize) -> Self {
        Self {
            landmark_to_previous_scale_idx: Vec::with_capacity(num_landmarks),
            landmark_to_original_data_idx: Vec::with_capacity(num_landmarks),
            previous_scale_to_landmark_idx: vec![None; previous_size],
        }
    }

    fn promote<T>(&mut self, previous: &Scale<T>, idx: usize) {
        self.previous_scale_to_landmark_idx[idx] = Some(self.len());
        self.landmark_to_previous_scale_idx.push(idx);
        self.landmark_to_original_data_idx
            .push(previous.landmark_to_original_data_idx[idx]);
    }

    /// Number of landmarks
    pub fn len(&self) -> usize {
        self.landmark_to_previous_scale_idx.len()
    }

    /// Returns true if no landmark was selected
    pub fn is_empty(&self) -> bool {
        self.landmark_to_previous_scale_idx.is_empty()
    }
}

/// Select landmarks with Markov chain Monte Carlo sampling
///
/// Every point starts `mcmcs_num_walks` walks of length `mcmcs_walk_length`;
/// points on which more than `mcmcs_num_walks * mcmcs_landmark_thresh` walks
/// end become landmarks, in index order.
///
/// ### Params
///
/// * `previous` - The scale to select from
/// * `params` - Hierarchy parameters
/// * `seed` - Resolved seed
/// * `stream` - Random stream of this pass
/// * `stats` - Receives timings and the number of walks
///
/// ### Returns
///
/// The selection (possibly with fewer than two landmarks)
pub fn select_landmarks_mcmcs<T>(
    previous: &Scale<T>,
    params: &HsneParams,
    seed: u64,
    stream: u64,
    stats: &mut Statistics,
) -> LandmarkSelection
where
    T: Float + Send + Sync,
{
    let n_prev = previous.size();
    let thresh = params.mcmcs_threshold();
    let tm = &previous.transition_matrix;

    let start_sampling = Instant::now();

    let end_points: Vec<Vec<usize>> = (0..n_prev)
        .into_par_iter()
        .map(|d| {
            let mut rng = point_rng(seed, d, stream);
            (0..params.mcmcs_num_walks)
                .filter_map(|_| random_walk(d, params.mcmcs_walk_length, tm, &mut rng))
                .collect()
        })
        .collect();

    let mut importance = vec![0_usize; n_prev];
    for idx in end_points.into_iter().flatten() {
        importance[idx] += 1;
    }

    stats.mcmc_sampling_time = Some(start_sampling.elapsed().as_secs_f64());
    stats.landmarks_selection_num_walks = Some(n_prev * params.mcmcs_num_walks);

    let start_selection = Instant::now();

    let num_landmarks = importance.iter().filter(|&&c| c > thresh).count();
    let mut selection = LandmarkSelection::with_capacity(n_prev, num_landmarks);
    for (i, &count) in importance.iter().enumerate() {
        if count > thresh {
            selection.promote(previous, i);
        }
    }

    stats.landmarks_selection_time = Some(start_selection.elapsed().as_secs_f64());

    log_progress!(
        params.verbose,
        "MCMC sampling selected {} of {} points (threshold: {} walks)",
        selection.len().separate_with_underscores(),
        n_prev.separate_with_underscores(),
        thresh
    );

    selection
}

/// Select a fixed fraction of the points at random
///
/// If `rs_outliers_removal_jumps > 0`, every drawn point is moved by a walk of
/// that many hops, which drags the selection away from badly connected
/// points. Draws that end on a stuck walk or an existing landmark are
/// retried.
///
/// ### Params
///
/// * `previous` - The scale to select from
/// * `params` - Hierarchy parameters
/// * `seed` - Resolved seed
/// * `stream` - Random stream of this pass
/// * `stats` - Receives the timing and the number of walks
///
/// ### Returns
///
/// The selection or `HsneError::Degenerate` if the reduction leaves fewer
/// than two landmarks or not enough distinct landmarks can be reached
pub fn select_landmarks_random<T>(
    previous: &Scale<T>,
    params: &HsneParams,
    seed: u64,
    stream: u64,
    stats: &mut Statistics,
) -> Result<LandmarkSelection>
where
    T: Float,
{
    let start = Instant::now();
    let n_prev = previous.size();
    let num_landmarks = (n_prev as f64 * params.rs_reduction_factor_per_layer) as usize;

    if num_landmarks < 2 {
        log::warn!(
            "Random sampling keeps {} of {} points",
            num_landmarks,
            n_prev
        );
        return Err(HsneError::Degenerate(format!(
            "A reduction factor of {} on {} points yields fewer than 2 landmarks",
            params.rs_reduction_factor_per_layer, n_prev
        )));
    }

    let max_tries = (num_landmarks * 100).max(10_000);
    let mut rng = point_rng(seed, 0, stream);
    let mut selection = LandmarkSelection::with_capacity(n_prev, num_landmarks);
    let mut num_tries = 0;

    while selection.len() < num_landmarks {
        if num_tries >= max_tries {
            log::warn!(
                "Random sampling found {} of {} landmarks after {} draws",
                selection.len(),
                num_landmarks,
                num_tries
            );
            return Err(HsneError::Degenerate(format!(
                "Could not select {} distinct landmarks in {} draws",
                num_landmarks, max_tries
            )));
        }
        num_tries += 1;

        let mut idx = rng.random_range(0..n_prev);
        if params.rs_outliers_removal_jumps > 0 {
            match random_walk(
                idx,
                params.rs_outliers_removal_jumps,
                &previous.transition_matrix,
                &mut rng,
            ) {
                Some(end) => idx = end,
                None => continue,
            }
        }

        if selection.previous_scale_to_landmark_idx[idx].is_some() {
            continue;
        }
        selection.promote(previous, idx);
    }

    stats.landmarks_selection_time = Some(start.elapsed().as_secs_f64());
    stats.landmarks_selection_num_walks = Some(num_tries * params.rs_outliers_removal_jumps);

    log_progress!(
        params.verbose,
        "Random sampling selected {} of {} points in {} draws",
        selection.len().separate_with_underscores(),
        n_prev.separate_with_underscores(),
        num_tries.separate_with_underscores()
    );

    Ok(selection)
}

#[cfg(test)]
mod test_landmarks {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Cycle 0 -> 1 -> ... -> n - 1 -> 0
    fn ring(n: usize) -> SparseMatrix<f64> {
        (0..n)
            .map(|i| SparseRow::from_pairs(vec![((i + 1) % n, 1.0)]))
            .collect()
    }

    #[test]
    fn test_deterministic_walk() {
        let tm = ring(4);
        let mut rng = StdRng::seed_from_u64(1);
        // max_length + 1 steps
        assert_eq!(random_walk(0, 0, &tm, &mut rng), Some(1));
        assert_eq!(random_walk(0, 2, &tm, &mut rng), Some(3));
        assert_eq!(random_walk(1, 3, &tm, &mut rng), Some(1));
    }

    #[test]
    #[should_panic]
    fn test_walk_outside_the_matrix() {
        let tm = ring(3);
        let mut rng = StdRng::seed_from_u64(1);
        walk_step(3, &tm, &mut rng);
    }

    #[test]
    fn test_stuck_walks() {
        let tm = vec![
            SparseRow::from_pairs(vec![(1, 1.0_f64)]),
            SparseRow::new(),
            SparseRow::from_pairs(vec![(2, 1.0)]),
        ];
        let mut rng = StdRng::seed_from_u64(1);
        // empty row
        assert_eq!(random_walk(0, 3, &tm, &mut rng), None);
        // self loop
        assert_eq!(random_walk(2, 3, &tm, &mut rng), None);
    }

    #[test]
    fn test_walk_with_stopping_points() {
        let tm = ring(6);
        let stops = vec![Some(0), None, None, Some(1), None, None];
        let mut rng = StdRng::seed_from_u64(1);

        assert_eq!(random_walk_with_stopping_points(1, &stops, 10, &tm, &mut rng), Some(1));
        // starting on a landmark still moves
        assert_eq!(random_walk_with_stopping_points(0, &stops, 10, &tm, &mut rng), Some(1));
        // needs 3 steps from 4
        assert_eq!(random_walk_with_stopping_points(4, &stops, 1, &tm, &mut rng), None);
        assert_eq!(random_walk_with_stopping_points(4, &stops, 2, &tm, &mut rng), Some(0));
    }

    /// Star graph: every leaf points to the hub, the hub spreads evenly
    fn star(n_leaves: usize) -> Scale<f64> {
        let n = n_leaves + 1;
        let mut tm = vec![SparseRow::from_pairs(
            (1..n).map(|j| (j, 1.0 / n_leaves as f64)).collect(),
        )];
        tm.extend((1..n).map(|_| SparseRow::from_pairs(vec![(0, 1.0)])));
        Scale::identity(tm)
    }

    #[test]
    fn test_mcmcs_selects_hub() {
        let scale = star(20);
        let params = HsneParams::default();
        let mut stats = Statistics::default();
        let selection = select_landmarks_mcmcs(&scale, &params, 42, 0, &mut stats);

        // walks take 11 steps, so every walk started on a leaf ends on the hub
        assert_eq!(selection.landmark_to_previous_scale_idx, vec![0]);
        assert_eq!(selection.previous_scale_to_landmark_idx[0], Some(0));
        assert_eq!(stats.landmarks_selection_num_walks, Some(21 * 10));
        assert!(stats.mcmc_sampling_time.is_some());

        let again = select_landmarks_mcmcs(&scale, &params, 42, 0, &mut stats);
        assert_eq!(selection, again);
    }

    #[test]
    fn test_mcmcs_landmarks_are_consistent() {
        let tm: SparseMatrix<f64> = (0..50)
            .map(|i| {
                SparseRow::from_pairs(vec![((i + 1) % 50, 0.5), ((i + 49) % 50, 0.5)])
            })
            .collect();
        let scale = Scale::identity(tm);
        let params = HsneParams {
            mcmcs_landmark_thresh: 0.5,
            ..Default::default()
        };
        let mut stats = Statistics::default();
        let selection = select_landmarks_mcmcs(&scale, &params, 3, 0, &mut stats);

        assert!(!selection.is_empty());
        for (l, &p) in selection.landmark_to_previous_scale_idx.iter().enumerate() {
            assert_eq!(selection.previous_scale_to_landmark_idx[p], Some(l));
        }
        assert!(selection
            .landmark_to_previous_scale_idx
            .windows(2)
            .all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_random_sampling() {
        let scale = Scale::identity(ring(100));
        let params = HsneParams {
            monte_carlo_sampling: false,
            ..Default::default()
        };
        let mut stats = Statistics::default();
        let selection = select_landmarks_random(&scale, &params, 11, 1, &mut stats).unwrap();

        assert_eq!(selection.len(), 10);
        let mut unique = selection.landmark_to_previous_scale_idx.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 10);
        assert_eq!(stats.landmarks_selection_num_walks.map(|w| w % 10), Some(0));
    }

    #[test]
    fn test_random_sampling_degenerate() {
        let scale = Scale::identity(ring(10));
        let mut stats = Statistics::default();
        let res = select_landmarks_random(&scale, &HsneParams::default(), 1, 1, &mut stats);
        assert!(matches!(res, Err(HsneError::Degenerate(_))));

        // every walk gets stuck
        let stuck = Scale::identity(vec![SparseRow::<f64>::new(); 100]);
        let res = select_landmarks_random(&stuck, &HsneParams::default(), 1, 1, &mut stats);
        assert!(matches!(res, Err(HsneError::Degenerate(_))));
    }
}
