use num_traits::{Float, FromPrimitive};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::time::Instant;
use thousands::Separable;

use crate::data::structures::*;
use crate::hsne::landmarks::{random_walk_with_stopping_points, LandmarkSelection};
use crate::hsne::params::{AoiStrategy, HsneParams};
use crate::hsne::scale::{Scale, Statistics};
use crate::log_progress;
use crate::utils::rng::point_rng;

/// Entries above this value count towards the effective sparsity of an
/// in-core transition matrix.
const IN_CORE_EFFECTIVE_THRESH: f64 = 0.01;

/// Out-of-core transition matrices drop entries below this value and count
/// the remaining ones as effective.
const OUT_OF_CORE_PRUNE_THRESH: f64 = 0.001;

/// Area of influence of a new scale and the quantities derived from it
///
/// ### Fields
///
/// * `area_of_influence` - Previous-scale point → landmark probabilities
/// * `transition_matrix` - Row-stochastic landmark similarities
/// * `landmark_weight` - Weighted mass each landmark represents
#[derive(Clone, Debug)]
pub struct AreaOfInfluence<T> {
    pub area_of_influence: SparseMatrix<T>,
    pub transition_matrix: SparseMatrix<T>,
    pub landmark_weight: Vec<T>,
}

/// Count how often the walks of every previous-scale point end on each
/// landmark
///
/// ### Returns
///
/// One `(landmark, count)` list per point, sorted by landmark
fn landmark_hits<T>(
    previous: &Scale<T>,
    selection: &LandmarkSelection,
    num_walks: usize,
    max_length: usize,
    seed: u64,
    stream: u64,
) -> Vec<Vec<(usize, usize)>>
where
    T: Float + Send + Sync,
{
    let tm = &previous.transition_matrix;
    let stops = &selection.previous_scale_to_landmark_idx;

    (0..previous.size())
        .into_par_iter()
        .map(|d| {
            let mut rng = point_rng(seed, d, stream);
            let mut hits: FxHashMap<usize, usize> = FxHashMap::default();
            for _ in 0..num_walks {
                if let Some(l) = random_walk_with_stopping_points(d, stops, max_length, tm, &mut rng)
                {
                    *hits.entry(l).or_insert(0) += 1;
                }
            }
            let mut hits: Vec<(usize, usize)> = hits.into_iter().collect();
            hits.sort_unstable_by_key(|&(l, _)| l);
            hits
        })
        .collect()
}

/// Turn an accumulator into a normalised row
fn into_stochastic_row<T: Float>(acc: FxHashMap<usize, T>) -> SparseRow<T> {
    let mut row = SparseRow::from_pairs(acc.into_iter().collect());
    row.normalise();
    row
}

/// Fraction of missing entries of an `n_rows x n_cols` matrix
fn sparsity(nnz: usize, n_rows: usize, n_cols: usize) -> f64 {
    let total = n_rows as f64 * n_cols as f64;
    if total > 0.0 {
        1.0 - nnz as f64 / total
    } else {
        1.0
    }
}

/// Area of influence with landmark similarities accumulated from co-hits
///
/// Two landmarks reached more than `transition_matrix_prune_thresh` times
/// from the same point are connected with weight `c1 * c2 * w`, `w` being the
/// weight of that point.
///
/// ### Params
///
/// * `previous` - The previous scale
/// * `selection` - The landmarks of the new scale
/// * `params` - Hierarchy parameters
/// * `seed` - Resolved seed
/// * `stream` - Random stream of this pass
/// * `stats` - Receives timings, walk count and sparsities
pub fn compute_aoi_in_core<T>(
    previous: &Scale<T>,
    selection: &LandmarkSelection,
    params: &HsneParams,
    seed: u64,
    stream: u64,
    stats: &mut Statistics,
) -> AreaOfInfluence<T>
where
    T: Float + FromPrimitive + Send + Sync,
{
    let start = Instant::now();
    let n_prev = previous.size();
    let n_landmarks = selection.len();
    let num_walks = params.num_walks_per_landmark;
    let prune = params.transition_matrix_prune_thresh;
    let walks = T::from_usize(num_walks).unwrap();

    let hits = landmark_hits(
        previous,
        selection,
        num_walks,
        params.max_aoi_walk_length(),
        seed,
        stream,
    );

    let mut similarities: Vec<FxHashMap<usize, T>> = vec![FxHashMap::default(); n_landmarks];
    let mut landmark_weight = vec![T::zero(); n_landmarks];
    let mut area_of_influence = Vec::with_capacity(n_prev);

    for (d, counts) in hits.iter().enumerate() {
        let w_d = previous.landmark_weight[d];

        for &(l1, c1) in counts.iter().filter(|&&(_, c)| c as f64 > prune) {
            for &(l2, c2) in counts.iter().filter(|&&(_, c)| c as f64 > prune) {
                if l1 == l2 {
                    continue;
                }
                let v = T::from_usize(c1 * c2).unwrap() * w_d;
                let entry = similarities[l1].entry(l2).or_insert(T::zero());
                *entry = *entry + v;
            }
        }

        let mut row = SparseRow::with_capacity(counts.len());
        for &(l, c) in counts {
            let prob = T::from_usize(c).unwrap() / walks;
            row.indices.push(l);
            row.data.push(prob);
            landmark_weight[l] = landmark_weight[l] + prob * w_d;
        }
        area_of_influence.push(row);
    }

    stats.aoi_time = Some(start.elapsed().as_secs_f64());
    stats.aoi_num_walks = Some(n_prev * num_walks);

    let start_fmc = Instant::now();
    let transition_matrix: SparseMatrix<T> = similarities
        .into_par_iter()
        .map(into_stochastic_row)
        .collect();

    let effective = T::from_f64(IN_CORE_EFFECTIVE_THRESH).unwrap();
    let nnz_effective: usize = transition_matrix
        .iter()
        .map(|row| row.data.iter().filter(|&&v| v > effective).count())
        .sum();
    stats.fmc_time = Some(start_fmc.elapsed().as_secs_f64());

    record_sparsities(
        stats,
        &area_of_influence,
        &transition_matrix,
        nnz_effective,
        n_landmarks,
    );

    log_progress!(
        params.verbose,
        "In-core area of influence: {} walks in {:.2?}",
        (n_prev * num_walks).separate_with_underscores(),
        start.elapsed()
    );

    AreaOfInfluence {
        area_of_influence,
        transition_matrix,
        landmark_weight,
    }
}

/// Area of influence with landmark similarities derived from the
/// materialised area of influence
///
/// The similarity of `l1` and `l2` is the sum over previous-scale points `d`
/// of `aoi[d][l1] * aoi[d][l2] * w_d`, restricted to values above
/// `transition_matrix_prune_thresh / 100`. Rows are normalised, entries
/// below 0.001 are dropped and the rows renormalised.
///
/// ### Params
///
/// * `previous` - The previous scale
/// * `selection` - The landmarks of the new scale
/// * `params` - Hierarchy parameters
/// * `seed` - Resolved seed
/// * `stream` - Random stream of this pass
/// * `stats` - Receives timings, walk count and sparsities
pub fn compute_aoi_out_of_core<T>(
    previous: &Scale<T>,
    selection: &LandmarkSelection,
    params: &HsneParams,
    seed: u64,
    stream: u64,
    stats: &mut Statistics,
) -> AreaOfInfluence<T>
where
    T: Float + FromPrimitive + Send + Sync,
{
    let start = Instant::now();
    let n_prev = previous.size();
    let n_landmarks = selection.len();
    let num_walks = params.num_walks_per_landmark;
    let walks = T::from_usize(num_walks).unwrap();

    let hits = landmark_hits(
        previous,
        selection,
        num_walks,
        params.max_aoi_walk_length(),
        seed,
        stream,
    );

    let area_of_influence: SparseMatrix<T> = hits
        .into_par_iter()
        .map(|counts| SparseRow {
            indices: counts.iter().map(|&(l, _)| l).collect(),
            data: counts
                .iter()
                .map(|&(_, c)| T::from_usize(c).unwrap() / walks)
                .collect(),
        })
        .collect();

    let mut landmark_weight = vec![T::zero(); n_landmarks];
    for (row, &w_d) in area_of_influence.iter().zip(&previous.landmark_weight) {
        for (l, v) in row.iter() {
            landmark_weight[l] = landmark_weight[l] + v * w_d;
        }
    }

    stats.aoi_time = Some(start.elapsed().as_secs_f64());
    stats.aoi_num_walks = Some(n_prev * num_walks);

    let start_fmc = Instant::now();
    let single_walk = T::from_f64(params.transition_matrix_prune_thresh / 100.0).unwrap();
    let prune = T::from_f64(OUT_OF_CORE_PRUNE_THRESH).unwrap();
    let inverse = invert_sparse_matrix(&area_of_influence, n_landmarks);

    let transition_matrix: SparseMatrix<T> = inverse
        .par_iter()
        .enumerate()
        .map(|(l1, influenced)| {
            let mut acc: FxHashMap<usize, T> = FxHashMap::default();
            for (d, inv) in influenced.iter() {
                if inv <= single_walk {
                    continue;
                }
                let w_d = previous.landmark_weight[d];
                for (l2, a) in area_of_influence[d].iter() {
                    if l2 != l1 && a > single_walk {
                        let entry = acc.entry(l2).or_insert(T::zero());
                        *entry = *entry + inv * a * w_d;
                    }
                }
            }
            let mut row = into_stochastic_row(acc);
            row.prune_below(prune);
            row.normalise();
            row
        })
        .collect();

    let nnz_effective = sparse_matrix_nnz(&transition_matrix);
    stats.fmc_time = Some(start_fmc.elapsed().as_secs_f64());

    record_sparsities(
        stats,
        &area_of_influence,
        &transition_matrix,
        nnz_effective,
        n_landmarks,
    );

    log_progress!(
        params.verbose,
        "Out-of-core area of influence: {} walks in {:.2?}",
        (n_prev * num_walks).separate_with_underscores(),
        start.elapsed()
    );

    AreaOfInfluence {
        area_of_influence,
        transition_matrix,
        landmark_weight,
    }
}

/// Compute the area of influence with the given strategy
pub fn compute_area_of_influence<T>(
    strategy: AoiStrategy,
    previous: &Scale<T>,
    selection: &LandmarkSelection,
    params: &HsneParams,
    seed: u64,
    stream: u64,
    stats: &mut Statistics,
) -> AreaOfInfluence<T>
where
    T: Float + FromPrimitive + Send + Sync,
{
    match strategy {
        AoiStrategy::InCore => {
            compute_aoi_in_core(previous, selection, params, seed, stream, stats)
        }
        AoiStrategy::OutOfCore => {
            compute_aoi_out_of_core(previous, selection, params, seed, stream, stats)
        }
    }
}

fn record_sparsities<T: Float>(
    stats: &mut Statistics,
    area_of_influence: &[SparseRow<T>],
    transition_matrix: &[SparseRow<T>],
    nnz_effective: usize,
    n_landmarks: usize,
) {
    stats.aoi_sparsity = Some(sparsity(
        sparse_matrix_nnz(area_of_influence),
        area_of_influence.len(),
        n_landmarks,
    ));
    stats.fmc_sparsity = Some(sparsity(
        sparse_matrix_nnz(transition_matrix),
        n_landmarks,
        n_landmarks,
    ));
    stats.fmc_effective_sparsity = Some(sparsity(nnz_effective, n_landmarks, n_landmarks));

    let empty_rows = transition_matrix.iter().filter(|r| r.is_empty()).count();
    if empty_rows > 0 {
        log::warn!(
            "{} of {} landmarks have no outgoing transitions",
            empty_rows,
            n_landmarks
        );
    }
}
