//! Neighbourhood preservation of an embedding.

use faer::MatRef;
use num_traits::{Float, FromPrimitive};
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::cmp::Ordering;

use crate::data::embedding::Embedding;
use crate::error::{HsneError, Result};
use crate::utils::math::euclidean_distance_squared;

/// Indices of the `k` points closest to `query`, `query` excluded
///
/// Ties are broken by index.
fn neighbours_excluding<T, F>(n: usize, query: usize, k: usize, dist: F) -> Vec<usize>
where
    T: Float,
    F: Fn(usize) -> T,
{
    let mut candidates: Vec<(T, usize)> = (0..n)
        .filter(|&j| j != query)
        .map(|j| (dist(j), j))
        .collect();
    candidates.sort_unstable_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    candidates.truncate(k);
    candidates.into_iter().map(|(_, j)| j).collect()
}

fn check_evaluation(points: &[usize], k: usize) -> Result<()> {
    if points.is_empty() {
        return Err(HsneError::Logic(
            "At least one point must be evaluated".to_string(),
        ));
    }
    if k < 2 {
        return Err(HsneError::Logic(format!(
            "K must be higher than 1, got {}",
            k
        )));
    }
    Ok(())
}

/// Precision and recall of the embedding neighbourhoods
///
/// For every evaluated point the `k` nearest neighbours in the data are the
/// relevant set; the first `k'` embedding neighbours are the retrieved set.
///
/// ### Params
///
/// * `data` - Samples x features
/// * `embedding` - Embedding of the same samples
/// * `points` - Points to evaluate
/// * `k` - Neighbourhood size, at least 2
///
/// ### Returns
///
/// `(precision, recall)`, entry `k' - 1` holding the averages at `k'`
pub fn compute_precision_recall<T>(
    data: MatRef<T>,
    embedding: &Embedding<T>,
    points: &[usize],
    k: usize,
) -> Result<(Vec<T>, Vec<T>)>
where
    T: Float + FromPrimitive + Send + Sync,
{
    if data.nrows() != embedding.num_data_points() {
        return Err(HsneError::InvalidArgument(format!(
            "Data has {} points, the embedding {}",
            data.nrows(),
            embedding.num_data_points()
        )));
    }
    let identity: Vec<usize> = (0..data.nrows()).collect();
    compute_precision_recall_with_mapping(data, embedding, points, &identity, k)
}

/// Precision and recall for an embedding of a subset of the data
///
/// ### Params
///
/// * `data` - Samples x features
/// * `embedding` - Embedding of the subset
/// * `points` - Embedding points to evaluate
/// * `emb_to_data` - Data index of every embedding point
/// * `k` - Neighbourhood size, at least 2
///
/// ### Returns
///
/// `(precision, recall)`, entry `k' - 1` holding the averages at `k'`
pub fn compute_precision_recall_with_mapping<T>(
    data: MatRef<T>,
    embedding: &Embedding<T>,
    points: &[usize],
    emb_to_data: &[usize],
    k: usize,
) -> Result<(Vec<T>, Vec<T>)>
where
    T: Float + FromPrimitive + Send + Sync,
{
    check_evaluation(points, k)?;

    let n_data = data.nrows();
    let n_emb = embedding.num_data_points();
    if emb_to_data.len() != n_emb {
        return Err(HsneError::InvalidArgument(format!(
            "Mapping has {} entries, the embedding {} points",
            emb_to_data.len(),
            n_emb
        )));
    }
    if let Some(&bad) = emb_to_data.iter().find(|&&d| d >= n_data) {
        return Err(HsneError::InvalidArgument(format!(
            "Data index {} out of bounds ({} points)",
            bad, n_data
        )));
    }
    if let Some(&bad) = points.iter().find(|&&p| p >= n_emb) {
        return Err(HsneError::InvalidArgument(format!(
            "Point {} out of bounds ({} embedding points)",
            bad, n_emb
        )));
    }

    let rows: Vec<Vec<T>> = (0..n_data)
        .map(|i| (0..data.ncols()).map(|j| data[(i, j)]).collect())
        .collect();

    let positives: Vec<Vec<usize>> = points
        .par_iter()
        .map(|&id_emb| {
            let id_data = emb_to_data[id_emb];
            let hd: FxHashSet<usize> = neighbours_excluding(n_data, id_data, k, |j| {
                euclidean_distance_squared(&rows[id_data], &rows[j])
            })
            .into_iter()
            .collect();

            let query = embedding.point(id_emb);
            let ld = neighbours_excluding(n_emb, id_emb, k, |j| {
                euclidean_distance_squared(query, embedding.point(j))
            });

            // running count of hits among the first k' embedding neighbours
            let mut hits = 0;
            (0..k)
                .map(|j| {
                    if ld.get(j).is_some_and(|&e| hd.contains(&emb_to_data[e])) {
                        hits += 1;
                    }
                    hits
                })
                .collect()
        })
        .collect();

    let n_points = T::from_usize(points.len()).unwrap();
    let k_t = T::from_usize(k).unwrap();
    let mut precision = vec![T::zero(); k];
    let mut recall = vec![T::zero(); k];
    for counts in &positives {
        for (j, &c) in counts.iter().enumerate() {
            let c = T::from_usize(c).unwrap();
            precision[j] = precision[j] + c / T::from_usize(j + 1).unwrap();
            recall[j] = recall[j] + c / k_t;
        }
    }
    for v in precision.iter_mut().chain(recall.iter_mut()) {
        *v = *v / n_points;
    }

    Ok((precision, recall))
}

/// Share of every point's `k` embedding neighbours carrying its label
///
/// ### Params
///
/// * `embedding` - The embedding
/// * `labels` - One label per embedding point
/// * `k` - Neighbourhood size
///
/// ### Returns
///
/// One fraction in `[0, 1]` per point
pub fn compute_cluster_neighbourhood_preservation<T>(
    embedding: &Embedding<T>,
    labels: &[usize],
    k: usize,
) -> Result<Vec<T>>
where
    T: Float + FromPrimitive + Send + Sync,
{
    let n = embedding.num_data_points();
    if labels.len() != n {
        return Err(HsneError::InvalidArgument(format!(
            "Got {} labels for {} points",
            labels.len(),
            n
        )));
    }
    if k == 0 || k >= n {
        return Err(HsneError::InvalidArgument(format!(
            "k must be in [1, {}), got {}",
            n, k
        )));
    }

    let k_t = T::from_usize(k).unwrap();
    Ok((0..n)
        .into_par_iter()
        .map(|i| {
            let query = embedding.point(i);
            let same = neighbours_excluding(n, i, k, |j| {
                euclidean_distance_squared(query, embedding.point(j))
            })
            .into_iter()
            .filter(|&j| labels[j] == labels[i])
            .count();
            T::from_usize(same).unwrap() / k_t
        })
        .collect())
}

#[cfg(test)]
mod test_evaluation {
    use super::*;
    use approx::assert_relative_eq;
    use faer::Mat;

    fn line(n: usize) -> (Mat<f64>, Embedding<f64>) {
        let data = Mat::from_fn(n, 1, |i, _| (i * i) as f64);
        let emb = Embedding::from_flat(1, (0..n).map(|i| (i * i) as f64).collect()).unwrap();
        (data, emb)
    }

    #[test]
    fn test_identical_layout_is_perfect() {
        let (data, emb) = line(12);
        let points: Vec<usize> = (0..12).collect();
        let (precision, recall) = compute_precision_recall(data.as_ref(), &emb, &points, 3).unwrap();

        assert_eq!(precision.len(), 3);
        for p in &precision {
            assert_relative_eq!(*p, 1.0);
        }
        assert_relative_eq!(recall[0], 1.0 / 3.0);
        assert_relative_eq!(recall[2], 1.0);
    }

    #[test]
    fn test_mapping_to_a_subset() {
        let (data, _) = line(10);
        // embed points 0, 1, 2, 9 on a line with 9 next to 0
        let emb = Embedding::from_flat(1, vec![1.0, 2.5, 3.0, 0.5]).unwrap();
        let mapping = [0, 1, 2, 9];
        let (precision, _) =
            compute_precision_recall_with_mapping(data.as_ref(), &emb, &[0], &mapping, 2).unwrap();

        // data neighbours of 0 are {1, 2}; embedding neighbours are 9 then 1
        assert_relative_eq!(precision[0], 0.0);
        assert_relative_eq!(precision[1], 0.5);
    }

    #[test]
    fn test_invalid_arguments() {
        let (data, emb) = line(5);
        assert!(matches!(
            compute_precision_recall(data.as_ref(), &emb, &[], 3),
            Err(HsneError::Logic(_))
        ));
        assert!(matches!(
            compute_precision_recall(data.as_ref(), &emb, &[0], 1),
            Err(HsneError::Logic(_))
        ));
    }

    #[test]
    fn test_cluster_preservation() {
        let emb = Embedding::from_flat(1, vec![0.0, 0.1, 0.2, 10.0, 10.1, 10.2]).unwrap();
        let labels = [0, 0, 0, 1, 1, 1];
        let pres = compute_cluster_neighbourhood_preservation(&emb, &labels, 2).unwrap();
        assert!(pres.iter().all(|&p| p == 1.0));

        let mixed = [0, 1, 0, 1, 0, 1];
        let pres = compute_cluster_neighbourhood_preservation(&emb, &mixed, 2).unwrap();
        assert_relative_eq!(pres[0], 0.5);
        assert_relative_eq!(pres[1], 0.0);
    }
}
