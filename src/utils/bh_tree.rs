use num_traits::{Float, FromPrimitive};
use rayon::prelude::*;

use crate::data::structures::SparseRow;

/// Hard cap on the subdivision depth; deeper points share a leaf
const MAX_TREE_DEPTH: usize = 48;

/// Padding added to the half-width of the root cell
const ROOT_PADDING: f64 = 1e-5;

////////////
// SpNode //
////////////

/// A node in the flattened space-partitioning tree
///
/// ### Fields
///
/// * `centre` - Centre of the cell covered by this node
/// * `half_width` - Half of the cell extent along every dimension
/// * `centre_of_mass` - Weighted centre of mass of every point below the node
/// * `cum_size` - Total weight of the points below the node
/// * `point_indices` - Points stored directly in this node. Only leaves carry
///   points; a leaf holds at most `capacity` distinct positions plus any
///   exact duplicates of them.
/// * `first_child` - Index of the first of the `2^D` contiguous children in
///   the arena, `None` for leaves
#[derive(Debug, Clone)]
pub struct SpNode<T> {
    pub centre: Vec<T>,
    pub half_width: Vec<T>,
    pub centre_of_mass: Vec<T>,
    pub cum_size: T,
    pub point_indices: Vec<usize>,
    pub first_child: Option<usize>,
}

impl<T: Float> SpNode<T> {
    fn new(centre: Vec<T>, half_width: Vec<T>) -> Self {
        let n_dim = centre.len();
        Self {
            centre,
            half_width,
            centre_of_mass: vec![T::zero(); n_dim],
            cum_size: T::zero(),
            point_indices: Vec::new(),
            first_child: None,
        }
    }

    /// Check if this is a leaf node
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.first_child.is_none()
    }

    /// Largest half-width over all dimensions
    #[inline]
    fn max_width(&self) -> T {
        self.half_width
            .iter()
            .fold(T::zero(), |acc, &w| if w > acc { w } else { acc })
    }

    /// Index of the child cell (relative to `first_child`) that contains
    /// `point`. Bit `d` is set when the point lies below the centre along
    /// dimension `d`.
    #[inline]
    fn child_slot(&self, point: &[T]) -> usize {
        point
            .iter()
            .zip(&self.centre)
            .enumerate()
            .fold(0, |slot, (d, (&p, &c))| if p < c { slot | (1 << d) } else { slot })
    }
}

////////////
// SpTree //
////////////

/// Weighted N-dimensional Barnes-Hut tree
///
/// Every internal node has `2^D` children stored contiguously in one flat
/// arena. The tree borrows the embedding and is meant to be rebuilt at every
/// gradient descent iteration.
pub struct SpTree<'a, T> {
    nodes: Vec<SpNode<T>>,
    emb_dimension: usize,
    no_children: usize,
    capacity: usize,
    positions: &'a [T],
    weights: Option<&'a [T]>,
}

impl<'a, T> SpTree<'a, T>
where
    T: Float + FromPrimitive + Send + Sync,
{
    /// Build an unweighted tree (every point has weight 1)
    ///
    /// ### Params
    ///
    /// * `emb_dimension` - Dimensionality of the embedding
    /// * `positions` - Flat row-major coordinates
    pub fn new(emb_dimension: usize, positions: &'a [T]) -> Self {
        Self::build(emb_dimension, positions, None, 1)
    }

    /// Build a tree where every point carries its own weight
    ///
    /// ### Params
    ///
    /// * `emb_dimension` - Dimensionality of the embedding
    /// * `positions` - Flat row-major coordinates
    /// * `weights` - One weight per point
    pub fn with_weights(emb_dimension: usize, positions: &'a [T], weights: &'a [T]) -> Self {
        Self::build(emb_dimension, positions, Some(weights), 1)
    }

    /// Build the tree
    ///
    /// ### Params
    ///
    /// * `emb_dimension` - Dimensionality of the embedding (>= 1)
    /// * `positions` - Flat row-major coordinates
    /// * `weights` - Optional per-point weights
    /// * `capacity` - Number of distinct positions a leaf may hold
    pub fn build(
        emb_dimension: usize,
        positions: &'a [T],
        weights: Option<&'a [T]>,
        capacity: usize,
    ) -> Self {
        assert!(emb_dimension > 0, "Embedding dimensionality must be positive");
        let n_points = positions.len() / emb_dimension;
        if let Some(w) = weights {
            assert_eq!(w.len(), n_points, "One weight per point is required");
        }

        let mut mean = vec![T::zero(); emb_dimension];
        let mut min = vec![T::max_value(); emb_dimension];
        let mut max = vec![-T::max_value(); emb_dimension];
        for point in positions.chunks(emb_dimension) {
            for d in 0..emb_dimension {
                mean[d] = mean[d] + point[d];
                min[d] = min[d].min(point[d]);
                max[d] = max[d].max(point[d]);
            }
        }
        let n = T::from_usize(n_points.max(1)).unwrap();
        let padding = T::from_f64(ROOT_PADDING).unwrap();
        let half_width: Vec<T> = (0..emb_dimension)
            .map(|d| {
                mean[d] = mean[d] / n;
                (max[d] - mean[d]).max(mean[d] - min[d]).max(T::zero()) + padding
            })
            .collect();

        let mut tree = Self {
            nodes: Vec::with_capacity(n_points * 2 + 1),
            emb_dimension,
            no_children: 1 << emb_dimension,
            capacity: capacity.max(1),
            positions,
            weights,
        };
        tree.nodes.push(SpNode::new(mean, half_width));

        for idx in 0..n_points {
            tree.insert(0, idx, 0);
        }

        tree
    }

    #[inline]
    fn point(&self, idx: usize) -> &[T] {
        &self.positions[idx * self.emb_dimension..(idx + 1) * self.emb_dimension]
    }

    #[inline]
    fn weight(&self, idx: usize) -> T {
        self.weights.map_or(T::one(), |w| w[idx])
    }

    fn is_duplicate(&self, a: usize, b: usize) -> bool {
        self.point(a) == self.point(b)
    }

    /// Insert a point starting at `node_idx`, descending until a leaf
    /// accepts it
    fn insert(&mut self, mut node_idx: usize, point_idx: usize, mut depth: usize) {
        let w = self.weight(point_idx);

        loop {
            {
                let n_dim = self.emb_dimension;
                let start = point_idx * n_dim;
                let point = &self.positions[start..start + n_dim];
                let node = &mut self.nodes[node_idx];
                node.cum_size = node.cum_size + w;
                if node.cum_size > T::zero() {
                    let mult1 = (node.cum_size - w) / node.cum_size;
                    let mult2 = w / node.cum_size;
                    for (com, &p) in node.centre_of_mass.iter_mut().zip(point) {
                        *com = *com * mult1 + mult2 * p;
                    }
                }
            }

            if self.nodes[node_idx].is_leaf() {
                let stored = &self.nodes[node_idx].point_indices;
                let has_duplicate = stored.iter().any(|&o| self.is_duplicate(o, point_idx));
                let distinct = self.count_distinct(node_idx);
                if has_duplicate || distinct < self.capacity || depth >= MAX_TREE_DEPTH {
                    self.nodes[node_idx].point_indices.push(point_idx);
                    return;
                }
                self.subdivide(node_idx, depth);
            }

            let slot = self.nodes[node_idx].child_slot(self.point(point_idx));
            let first_child = match self.nodes[node_idx].first_child {
                Some(c) => c,
                None => return,
            };
            node_idx = first_child + slot;
            depth += 1;
        }
    }

    /// Number of distinct positions stored in a leaf
    fn count_distinct(&self, node_idx: usize) -> usize {
        let stored = &self.nodes[node_idx].point_indices;
        stored
            .iter()
            .enumerate()
            .filter(|&(i, &a)| !stored[..i].iter().any(|&b| self.is_duplicate(a, b)))
            .count()
    }

    /// Split a leaf into `2^D` children and move its points down
    fn subdivide(&mut self, node_idx: usize, depth: usize) {
        let first_child = self.nodes.len();
        let half = T::from_f64(0.5).unwrap();

        for i in 0..self.no_children {
            let parent = &self.nodes[node_idx];
            let mut centre = Vec::with_capacity(self.emb_dimension);
            let mut half_width = Vec::with_capacity(self.emb_dimension);
            for d in 0..self.emb_dimension {
                let w = half * parent.half_width[d];
                half_width.push(w);
                if (i >> d) & 1 == 1 {
                    centre.push(parent.centre[d] - w);
                } else {
                    centre.push(parent.centre[d] + w);
                }
            }
            self.nodes.push(SpNode::new(centre, half_width));
        }

        let moved = std::mem::take(&mut self.nodes[node_idx].point_indices);
        self.nodes[node_idx].first_child = Some(first_child);

        for idx in moved {
            let slot = self.nodes[node_idx].child_slot(self.point(idx));
            self.insert(first_child + slot, idx, depth + 1);
        }
    }

    /// Number of nodes in the arena
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// All nodes; index 0 is the root
    pub fn nodes(&self) -> &[SpNode<T>] {
        &self.nodes
    }

    /// Depth of the tree (a lone root has depth 1)
    pub fn depth(&self) -> usize {
        let mut max_depth = 0;
        let mut stack = vec![(0_usize, 1_usize)];
        while let Some((node_idx, depth)) = stack.pop() {
            max_depth = max_depth.max(depth);
            if let Some(first) = self.nodes[node_idx].first_child {
                for c in first..first + self.no_children {
                    stack.push((c, depth + 1));
                }
            }
        }
        max_depth
    }

    /// Compute the repulsive forces on a point with the Barnes-Hut
    /// approximation
    ///
    /// ### Params
    ///
    /// * `point_idx` - Index of the point in the embedding
    /// * `theta` - Approximation threshold; cells with
    ///   `max_width / distance < theta` are used as a summary. `0` visits
    ///   every point.
    ///
    /// ### Returns
    ///
    /// A tuple `(neg_f, sum_q)` where:
    /// * `neg_f` - Unnormalised repulsive force, one entry per dimension
    /// * `sum_q` - This point's contribution to the normalisation of Q
    pub fn compute_non_edge_forces(&self, point_idx: usize, theta: T) -> (Vec<T>, T) {
        let n_dim = self.emb_dimension;
        let mut neg_f = vec![T::zero(); n_dim];
        let mut sum_q = T::zero();
        let mut diff = vec![T::zero(); n_dim];

        let point = self.point(point_idx);
        let w_i = self.weight(point_idx);

        let mut stack = Vec::with_capacity(64);
        stack.push(0_usize);

        while let Some(node_idx) = stack.pop() {
            let node = &self.nodes[node_idx];
            if node.cum_size <= T::zero() {
                continue;
            }

            if node.is_leaf() {
                // leaves are few points; evaluate them exactly
                for &j in &node.point_indices {
                    if j == point_idx {
                        continue;
                    }
                    let other = self.point(j);
                    let mut dist_sq = T::zero();
                    for d in 0..n_dim {
                        diff[d] = point[d] - other[d];
                        dist_sq = dist_sq + diff[d] * diff[d];
                    }
                    let q = T::one() / (T::one() + dist_sq);
                    let mult = w_i * self.weight(j);
                    sum_q = sum_q + mult * q;
                    for d in 0..n_dim {
                        neg_f[d] = neg_f[d] + mult * q * q * diff[d];
                    }
                }
                continue;
            }

            let mut dist_sq = T::zero();
            for d in 0..n_dim {
                diff[d] = point[d] - node.centre_of_mass[d];
                dist_sq = dist_sq + diff[d] * diff[d];
            }

            if dist_sq > T::zero() && node.max_width() / dist_sq.sqrt() < theta {
                let q = T::one() / (T::one() + dist_sq);
                let mult = w_i * node.cum_size;
                sum_q = sum_q + mult * q;
                for d in 0..n_dim {
                    neg_f[d] = neg_f[d] + mult * q * q * diff[d];
                }
            } else if let Some(first) = node.first_child {
                stack.extend(first..first + self.no_children);
            }
        }

        (neg_f, sum_q)
    }

    /// Compute the attractive forces along the sparse edges of `p`
    ///
    /// ### Params
    ///
    /// * `p` - Joint probabilities, one row per point
    /// * `multiplier` - Scales every force (exaggeration)
    ///
    /// ### Returns
    ///
    /// Flat row-major attractive forces
    pub fn compute_edge_forces(&self, p: &[SparseRow<T>], multiplier: T) -> Vec<T> {
        compute_edge_forces(self.emb_dimension, self.positions, p, multiplier)
    }
}

/// Attractive forces `sum_j p_ij * multiplier * q_ij * (y_i - y_j)` for every
/// row of `p`
///
/// ### Params
///
/// * `emb_dimension` - Dimensionality of the embedding
/// * `positions` - Flat row-major coordinates
/// * `p` - Joint probabilities, one row per point
/// * `multiplier` - Scales every force
///
/// ### Returns
///
/// Flat row-major attractive forces
pub fn compute_edge_forces<T>(
    emb_dimension: usize,
    positions: &[T],
    p: &[SparseRow<T>],
    multiplier: T,
) -> Vec<T>
where
    T: Float + Send + Sync,
{
    let mut pos_f = vec![T::zero(); positions.len()];
    pos_f
        .par_chunks_mut(emb_dimension)
        .zip(p.par_iter())
        .enumerate()
        .for_each(|(i, (force, row))| {
            let yi = &positions[i * emb_dimension..(i + 1) * emb_dimension];
            for (j, p_ij) in row.iter() {
                let yj = &positions[j * emb_dimension..(j + 1) * emb_dimension];
                let mut q_inv = T::one();
                for d in 0..emb_dimension {
                    let diff = yi[d] - yj[d];
                    q_inv = q_inv + diff * diff;
                }
                let res = p_ij * multiplier / q_inv;
                for d in 0..emb_dimension {
                    force[d] = force[d] + res * (yi[d] - yj[d]);
                }
            }
        });
    pos_f
}

/// Exact O(N^2) repulsive forces, the reference the tree approximates
///
/// ### Params
///
/// * `emb_dimension` - Dimensionality of the embedding
/// * `positions` - Flat row-major coordinates
/// * `weights` - Optional per-point weights
///
/// ### Returns
///
/// `(neg_f, sum_q)` with `neg_f` flat row-major and `sum_q` the total over
/// all points
pub fn compute_exact_non_edge_forces<T>(
    emb_dimension: usize,
    positions: &[T],
    weights: Option<&[T]>,
) -> (Vec<T>, T)
where
    T: Float + Send + Sync + std::iter::Sum,
{
    let n = positions.len() / emb_dimension;
    let weight = |i: usize| weights.map_or(T::one(), |w| w[i]);

    let per_point: Vec<(Vec<T>, T)> = (0..n)
        .into_par_iter()
        .map(|i| {
            let yi = &positions[i * emb_dimension..(i + 1) * emb_dimension];
            let mut neg = vec![T::zero(); emb_dimension];
            let mut sum_q = T::zero();
            for j in 0..n {
                if i == j {
                    continue;
                }
                let yj = &positions[j * emb_dimension..(j + 1) * emb_dimension];
                let dist_sq: T = yi.iter().zip(yj).map(|(&a, &b)| (a - b) * (a - b)).sum();
                let q = T::one() / (T::one() + dist_sq);
                let mult = weight(i) * weight(j);
                sum_q = sum_q + mult * q;
                for d in 0..emb_dimension {
                    neg[d] = neg[d] + mult * q * q * (yi[d] - yj[d]);
                }
            }
            (neg, sum_q)
        })
        .collect();

    let sum_q = per_point.iter().map(|(_, q)| *q).sum();
    let neg_f = per_point.into_iter().flat_map(|(f, _)| f).collect();
    (neg_f, sum_q)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn flat(pts: &[(f64, f64)]) -> Vec<f64> {
        pts.iter().flat_map(|&(x, y)| [x, y]).collect()
    }

    fn random_points(n: usize, dim: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * dim).map(|_| rng.random_range(-5.0..5.0)).collect()
    }

    #[test]
    fn test_single_point_tree() {
        let pos = flat(&[(1.0, 2.0)]);
        let tree = SpTree::new(2, &pos);

        assert_eq!(tree.num_nodes(), 1);
        assert_eq!(tree.depth(), 1);
        let root = &tree.nodes()[0];
        assert_relative_eq!(root.centre_of_mass[0], 1.0);
        assert_relative_eq!(root.centre_of_mass[1], 2.0);
        assert_relative_eq!(root.cum_size, 1.0);
        assert!(root.is_leaf());
    }

    #[test]
    fn test_root_cell_bounds() {
        let pos = flat(&[(0.0, 0.0), (4.0, 0.0), (0.0, 2.0), (4.0, 2.0)]);
        let tree = SpTree::new(2, &pos);
        let root = &tree.nodes()[0];

        assert_relative_eq!(root.centre[0], 2.0);
        assert_relative_eq!(root.centre[1], 1.0);
        assert_relative_eq!(root.half_width[0], 2.0 + 1e-5);
        assert_relative_eq!(root.half_width[1], 1.0 + 1e-5);
        assert!(!root.is_leaf());
        // one level of 2^2 children below the root
        assert_eq!(tree.num_nodes(), 5);
        assert_eq!(tree.depth(), 2);
    }

    #[test]
    fn test_weighted_centre_of_mass() {
        let pos = flat(&[(0.0, 0.0), (4.0, 0.0)]);
        let weights = vec![3.0, 1.0];
        let tree = SpTree::with_weights(2, &pos, &weights);
        let root = &tree.nodes()[0];

        assert_relative_eq!(root.cum_size, 4.0);
        assert_relative_eq!(root.centre_of_mass[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(root.centre_of_mass[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_duplicates_share_a_leaf() {
        let pos = flat(&[(5.0, 5.0), (5.0, 5.0), (5.0, 5.0), (1.0, 1.0)]);
        let tree = SpTree::new(2, &pos);

        let leaf = tree
            .nodes()
            .iter()
            .find(|n| n.is_leaf() && n.point_indices.len() == 3)
            .expect("duplicates should be stored together");
        assert_relative_eq!(leaf.cum_size, 3.0);
        assert_relative_eq!(tree.nodes()[0].cum_size, 4.0);

        for i in 0..4 {
            let (neg, sum_q) = tree.compute_non_edge_forces(i, 0.5);
            assert!(neg.iter().all(|f| f.is_finite()));
            assert!(sum_q.is_finite() && sum_q > 0.0);
        }
        // two coincident partners at distance 0 contribute q = 1 each
        let (neg, sum_q) = tree.compute_non_edge_forces(0, 0.0);
        let d2: f64 = 32.0;
        assert_relative_eq!(sum_q, 2.0 + 1.0 / (1.0 + d2), epsilon = 1e-12);
        assert!(neg[0] > 0.0);
    }

    #[test]
    fn test_no_self_interaction() {
        let pos = flat(&[(0.0, 0.0)]);
        let tree = SpTree::new(2, &pos);
        let (neg, sum_q) = tree.compute_non_edge_forces(0, 0.5);

        assert_relative_eq!(neg[0], 0.0);
        assert_relative_eq!(neg[1], 0.0);
        assert_relative_eq!(sum_q, 0.0);
    }

    #[test]
    fn test_force_symmetry_two_points() {
        let pos = flat(&[(0.0, 0.0), (2.0, 0.0)]);
        let tree = SpTree::new(2, &pos);

        let (f0, _) = tree.compute_non_edge_forces(0, 0.5);
        let (f1, _) = tree.compute_non_edge_forces(1, 0.5);

        assert_relative_eq!(f0[0], -f1[0], epsilon = 1e-12);
        // point 0 pushed left, point 1 pushed right
        assert!(f0[0] < 0.0);
        assert!(f1[0] > 0.0);
        assert_relative_eq!(f0[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_theta_zero_matches_brute_force() {
        for &dim in &[1_usize, 2, 3] {
            let pos = random_points(50, dim, 42 + dim as u64);
            let weights: Vec<f64> = (0..50).map(|i| 0.5 + (i % 4) as f64 * 0.25).collect();
            let tree = SpTree::with_weights(dim, &pos, &weights);
            let (exact_f, exact_q) = compute_exact_non_edge_forces(dim, &pos, Some(&weights));

            let mut sum_q = 0.0;
            for i in 0..50 {
                let (neg, q) = tree.compute_non_edge_forces(i, 0.0);
                sum_q += q;
                for d in 0..dim {
                    assert_relative_eq!(neg[d], exact_f[i * dim + d], max_relative = 1e-3, epsilon = 1e-9);
                }
            }
            assert_relative_eq!(sum_q, exact_q, max_relative = 1e-3);
        }
    }

    #[test]
    fn test_barnes_hut_approximation_reasonable() {
        let mut pts = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                pts.push((i as f64 * 2.0, j as f64 * 2.0));
            }
        }
        let pos = flat(&pts);
        let tree = SpTree::new(2, &pos);
        let (exact_f, exact_q) = compute_exact_non_edge_forces(2, &pos, None);

        let q_error = |theta: f64| {
            let approx_q: f64 = (0..100).map(|i| tree.compute_non_edge_forces(i, theta).1).sum();
            (approx_q - exact_q).abs() / exact_q
        };

        // a regular grid sits on the cell boundaries, the worst case for the
        // summary of a cell by its centre of mass
        let coarse = q_error(0.5);
        let fine = q_error(0.1);
        assert!(coarse < 0.1, "sum_q error at theta 0.5: {}", coarse);
        assert!(fine <= coarse, "{} > {}", fine, coarse);
        assert!(q_error(0.0) < 1e-9);

        let (f, _) = tree.compute_non_edge_forces(3, 0.1);
        assert_relative_eq!(f[0], exact_f[6], max_relative = 0.05);
    }

    #[test]
    fn test_edge_forces() {
        let pos = flat(&[(0.0, 0.0), (1.0, 0.0), (0.0, 3.0)]);
        let p = vec![
            SparseRow::from_pairs(vec![(1, 0.5)]),
            SparseRow::from_pairs(vec![(0, 0.5)]),
            SparseRow::new(),
        ];
        let tree = SpTree::new(2, &pos);
        let forces = tree.compute_edge_forces(&p, 2.0);

        // 0.5 * 2 / (1 + 1) * (0 - 1)
        assert_relative_eq!(forces[0], -0.5);
        assert_relative_eq!(forces[2], 0.5);
        assert_relative_eq!(forces[4], 0.0);
        assert_relative_eq!(forces[5], 0.0);
    }

    #[test]
    fn test_high_capacity_leaves() {
        let pos = random_points(30, 2, 3);
        let tree = SpTree::build(2, &pos, None, 4);
        let small = SpTree::new(2, &pos);

        assert!(tree.num_nodes() < small.num_nodes());
        let (f_big, q_big) = tree.compute_non_edge_forces(7, 0.0);
        let (f_small, q_small) = small.compute_non_edge_forces(7, 0.0);
        assert_relative_eq!(q_big, q_small, epsilon = 1e-10);
        assert_relative_eq!(f_big[0], f_small[0], epsilon = 1e-10);
    }
}
