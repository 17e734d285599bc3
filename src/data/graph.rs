use num_traits::{Float, FromPrimitive};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, VecDeque};

use crate::data::structures::*;
use crate::error::Result;
use crate::utils::math::*;

//////////
// tSNE //
//////////

/// Compute Gaussian affinities from k-nearest neighbours using perplexity-based
/// calibration
///
/// For each point i, computes conditional probabilities p_{j|i} using a
/// Gaussian kernel with bandwidth calibrated via binary search to achieve a
/// target perplexity. The result is a sparse matrix where row i holds p_{j|i}.
///
/// ### Params
///
/// * `knn_indices` - For each point, indices of its k nearest neighbours
///   (self excluded)
/// * `knn_dists` - For each point, **squared** distances to its k nearest
///   neighbours (same order as indices!)
/// * `perplexity` - Target perplexity (effective number of neighbours). Typical
///   values: 5-50
/// * `tol` - Convergence tolerance for entropy (typical: 1e-5)
/// * `max_iter` - Maximum iterations for binary search (typical: 50-200)
///
/// ### Returns
///
/// The asymmetric conditional probabilities, one row per point
pub fn gaussian_knn_affinities<T>(
    knn_indices: &[Vec<usize>],
    knn_dists: &[Vec<T>],
    perplexity: T,
    tol: T,
    max_iter: usize,
) -> Result<SparseMatrix<T>>
where
    T: Float + Send + Sync + FromPrimitive,
{
    knn_indices
        .par_iter()
        .zip(knn_dists.par_iter())
        .enumerate()
        .map(|(i, (indices, dists))| -> Result<SparseRow<T>> {
            let fit = compute_gaussian_distribution_with_fixed_perplexity(
                dists, perplexity, max_iter, tol, None,
            )?;

            let pairs: Vec<(usize, T)> = indices
                .iter()
                .copied()
                .zip(fit.distribution)
                .filter(|&(j, p)| j != i && p > T::zero())
                .collect();

            Ok(SparseRow::from_pairs(pairs))
        })
        .collect()
}

/// Symmetrise conditional probabilities: P_sym = (P + P^T) / 2
///
/// The result is not normalised; the optimiser divides by the total mass.
///
/// ### Params
///
/// * `probabilities` - Square sparse matrix of conditional probabilities
///
/// ### Returns
///
/// Symmetric sparse matrix with `P_sym[i][j] == P_sym[j][i]`
pub fn symmetrise_affinities<T>(probabilities: &[SparseRow<T>]) -> SparseMatrix<T>
where
    T: Float + Send + Sync + FromPrimitive,
{
    let n = probabilities.len();
    let half = T::from_f64(0.5).unwrap();
    let transposed = invert_sparse_matrix(probabilities, n);

    probabilities
        .par_iter()
        .zip(transposed.par_iter())
        .map(|(row, col)| {
            let mut pairs: Vec<(usize, T)> = Vec::with_capacity(row.len() + col.len());
            pairs.extend(row.iter().map(|(j, v)| (j, v * half)));
            pairs.extend(col.iter().map(|(j, v)| (j, v * half)));
            SparseRow::from_pairs(pairs)
        })
        .collect()
}

//////////////////////
// Graph algorithms //
//////////////////////

/// Connected components of a weighted graph
///
/// ### Fields
///
/// * `vertex_to_cluster` - Component id of every vertex
/// * `cluster_to_vertex` - First vertex (the BFS seed) of every component
/// * `cluster_size` - Number of vertices per component
#[derive(Clone, Debug, Default)]
pub struct ConnectedComponents {
    pub vertex_to_cluster: Vec<usize>,
    pub cluster_to_vertex: Vec<usize>,
    pub cluster_size: Vec<usize>,
}

impl ConnectedComponents {
    /// Number of components
    pub fn len(&self) -> usize {
        self.cluster_size.len()
    }

    /// Returns true if the graph had no vertices
    pub fn is_empty(&self) -> bool {
        self.cluster_size.is_empty()
    }
}

/// Breadth-first search for connected components
///
/// Only edges with weight `> thresh` connect two vertices.
///
/// ### Params
///
/// * `graph` - Weighted adjacency in row-major sparse format
/// * `thresh` - Minimum edge weight (exclusive)
///
/// ### Returns
///
/// The `ConnectedComponents`
pub fn compute_connected_components<T>(graph: &[SparseRow<T>], thresh: T) -> ConnectedComponents
where
    T: Float,
{
    let n = graph.len();
    let mut vertex_to_cluster: Vec<Option<usize>> = vec![None; n];
    let mut res = ConnectedComponents::default();
    let mut queue = VecDeque::new();

    for i in 0..n {
        if vertex_to_cluster[i].is_some() {
            continue;
        }
        let cluster_idx = res.cluster_size.len();
        vertex_to_cluster[i] = Some(cluster_idx);
        res.cluster_to_vertex.push(i);
        queue.push_back(i);

        let mut c_size = 0;
        while let Some(idx) = queue.pop_front() {
            c_size += 1;
            for (j, w) in graph[idx].iter() {
                if vertex_to_cluster[j].is_none() && w > thresh {
                    vertex_to_cluster[j] = Some(cluster_idx);
                    queue.push_back(j);
                }
            }
        }
        res.cluster_size.push(c_size);
    }

    res.vertex_to_cluster = vertex_to_cluster.into_iter().flatten().collect();
    res
}

/// Extract the sub-graph spanned by a selection and its strong neighbours
///
/// The selected vertices come first (in the given order), followed by every
/// neighbour reached with an edge `> thresh`. The weights of the extracted
/// graph are rescaled globally so that the total mass equals the number of
/// rows.
///
/// ### Params
///
/// * `matrix` - Original transition matrix
/// * `selected` - Vertices to extract
/// * `thresh` - Minimum weight for pulling in a neighbour
///
/// ### Returns
///
/// `(sub_graph, new_to_original_idx)`
pub fn extract_sub_graph<T>(
    matrix: &[SparseRow<T>],
    selected: &[usize],
    thresh: T,
) -> (SparseMatrix<T>, Vec<usize>)
where
    T: Float + FromPrimitive,
{
    let mut new_idxes: Vec<usize> = Vec::with_capacity(selected.len());
    let mut selected_map: BTreeMap<usize, usize> = BTreeMap::new();
    for &id in selected {
        selected_map.insert(id, new_idxes.len());
        new_idxes.push(id);
    }

    let mut non_selected_map: BTreeMap<usize, usize> = BTreeMap::new();
    for &id in selected_map.keys() {
        for (j, w) in matrix[id].iter() {
            if w > thresh && !selected_map.contains_key(&j) && !non_selected_map.contains_key(&j) {
                non_selected_map.insert(j, new_idxes.len());
                new_idxes.push(j);
            }
        }
    }

    let lookup = |j: usize| {
        selected_map
            .get(&j)
            .or_else(|| non_selected_map.get(&j))
            .copied()
    };

    let mut sub_graph: SparseMatrix<T> = vec![SparseRow::new(); new_idxes.len()];
    for (&orig, &new) in selected_map.iter().chain(non_selected_map.iter()) {
        let pairs: Vec<(usize, T)> = matrix[orig]
            .iter()
            .filter_map(|(j, w)| lookup(j).map(|nj| (nj, w)))
            .collect();
        sub_graph[new] = SparseRow::from_pairs(pairs);
    }

    let total = sub_graph
        .iter()
        .fold(T::zero(), |acc, row| acc + row.sum());
    if total > T::zero() {
        let scale = T::from_usize(sub_graph.len()).unwrap() / total;
        for row in sub_graph.iter_mut() {
            for v in row.data.iter_mut() {
                *v = *v * scale;
            }
        }
    }

    (sub_graph, new_idxes)
}

/// Drop every edge that does not point to a valid vertex and relabel the
/// remaining ones
///
/// ### Params
///
/// * `matrix` - Adjacency matrix, modified in place
/// * `valid` - Valid vertices; vertex `valid[k]` becomes column `k`
pub fn remove_edges_to_unselected_vertices<T>(matrix: &mut [SparseRow<T>], valid: &[usize])
where
    T: Float + Send + Sync,
{
    let valid_map: FxHashMap<usize, usize> =
        valid.iter().enumerate().map(|(k, &v)| (v, k)).collect();

    matrix.par_iter_mut().for_each(|row| {
        let pairs: Vec<(usize, T)> = row
            .iter()
            .filter_map(|(j, w)| valid_map.get(&j).map(|&k| (k, w)))
            .collect();
        *row = SparseRow::from_pairs(pairs);
    });
}

/// Two-step smoothing of a transition matrix
///
/// Each row becomes the distribution after two steps of a walk, without the
/// self-transition, renormalised.
///
/// ### Params
///
/// * `src` - Row-stochastic transition matrix
///
/// ### Returns
///
/// The smoothed matrix
pub fn expand<T>(src: &[SparseRow<T>]) -> SparseMatrix<T>
where
    T: Float + Send + Sync,
{
    let n = src.len();
    (0..n)
        .into_par_iter()
        .map(|j| {
            let mut a = vec![T::zero(); n];
            a[j] = T::one();
            for _ in 0..2 {
                a = multiply(&a, src);
            }
            let pairs: Vec<(usize, T)> = a
                .into_iter()
                .enumerate()
                .filter(|&(i, v)| v != T::zero() && i != j)
                .collect();
            let mut row = SparseRow::from_pairs(pairs);
            row.normalise();
            row
        })
        .collect()
}

///////////
// Tests //
///////////

#[cfg(test)]
mod test_graph {
    use super::*;
    use approx::assert_relative_eq;

    fn rows(pairs: &[&[(usize, f64)]]) -> SparseMatrix<f64> {
        pairs
            .iter()
            .map(|r| SparseRow::from_pairs(r.to_vec()))
            .collect()
    }

    #[test]
    fn test_row_probabilities_sum_to_one() {
        let knn_indices = vec![
            vec![1, 2, 3, 4],
            vec![0, 2, 3, 4],
            vec![0, 1, 3, 4],
            vec![0, 1, 2, 4],
            vec![0, 1, 2, 3],
        ];
        let knn_dists = vec![
            vec![1.0, 4.0, 9.0, 16.0],
            vec![1.0, 1.0, 4.0, 9.0],
            vec![4.0, 1.0, 1.0, 4.0],
            vec![9.0, 4.0, 1.0, 1.0],
            vec![16.0, 9.0, 4.0, 1.0],
        ];

        let graph = gaussian_knn_affinities(&knn_indices, &knn_dists, 2.0, 1e-5, 200).unwrap();

        for row in &graph {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-4);
            assert_eq!(row.len(), 4);
        }
        // closer neighbours get more mass
        assert!(graph[0].get(1).unwrap() > graph[0].get(4).unwrap());
    }

    #[test]
    fn test_entropy_matches_target_perplexity() {
        let knn_indices: Vec<Vec<usize>> = (0..8)
            .map(|i| (0..8).filter(|&j| j != i).collect())
            .collect();
        let knn_dists: Vec<Vec<f64>> = (0..8)
            .map(|i| {
                (0..7)
                    .map(|j| ((j + 1) as f64) * (1.0 + 0.1 * (i as f64)))
                    .collect()
            })
            .collect();

        let graph = gaussian_knn_affinities(&knn_indices, &knn_dists, 3.0, 1e-5, 200).unwrap();

        for row in &graph {
            assert_relative_eq!(compute_perplexity(&row.data), 3.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_symmetrise_affinities() {
        let p = rows(&[&[(1, 1.0)], &[(0, 0.5), (2, 0.5)], &[(1, 1.0)]]);
        let sym = symmetrise_affinities(&p);

        assert_relative_eq!(sym[0].get(1).unwrap(), 0.75);
        assert_relative_eq!(sym[1].get(0).unwrap(), 0.75);
        assert_relative_eq!(sym[1].get(2).unwrap(), 0.75);
        assert_eq!(sym[0].get(2), None);
    }

    #[test]
    fn test_connected_components() {
        let graph = rows(&[
            &[(1, 0.9)],
            &[(0, 0.9)],
            &[(3, 0.05)],
            &[(2, 0.05)],
            &[],
        ]);

        let cc = compute_connected_components(&graph, 0.1);
        assert_eq!(cc.len(), 4);
        assert_eq!(cc.vertex_to_cluster, vec![0, 0, 1, 2, 3]);
        assert_eq!(cc.cluster_size, vec![2, 1, 1, 1]);

        let cc = compute_connected_components(&graph, 0.0);
        assert_eq!(cc.len(), 3);
        assert_eq!(cc.cluster_to_vertex, vec![0, 2, 4]);
    }

    #[test]
    fn test_extract_sub_graph() {
        let graph = rows(&[
            &[(1, 0.5), (2, 0.5)],
            &[(0, 0.5), (3, 0.5)],
            &[(0, 1.0)],
            &[(1, 1.0)],
        ]);

        let (sub, idxes) = extract_sub_graph(&graph, &[0], 0.1);

        assert_eq!(idxes, vec![0, 1, 2]);
        assert_eq!(sub.len(), 3);
        // edge 1 -> 3 is outside the sub graph
        assert_eq!(sub[1].len(), 1);
        let total: f64 = sub.iter().map(|r| r.sum()).sum();
        assert_relative_eq!(total, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_remove_edges_to_unselected() {
        let mut graph = rows(&[&[(0, 0.2), (1, 0.3), (2, 0.5)], &[(2, 1.0)]]);
        remove_edges_to_unselected_vertices(&mut graph, &[2, 0]);

        assert_eq!(graph[0].indices, vec![0, 1]);
        assert_relative_eq!(graph[0].get(0).unwrap(), 0.5);
        assert_relative_eq!(graph[0].get(1).unwrap(), 0.2);
        assert_eq!(graph[1].indices, vec![0]);
    }

    #[test]
    fn test_expand_rows_are_stochastic() {
        let graph = rows(&[&[(1, 1.0)], &[(0, 0.5), (2, 0.5)], &[(1, 1.0)]]);
        let expanded = expand(&graph);

        // two steps from 0 only return to 0 or reach 2
        assert_eq!(expanded[0].indices, vec![2]);
        assert_eq!(expanded[2].indices, vec![0]);
        // state 1 is back on itself after two steps
        assert!(expanded[1].is_empty());
        assert_relative_eq!(expanded[0].sum(), 1.0, epsilon = 1e-12);
    }
}
