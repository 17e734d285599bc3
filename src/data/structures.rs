use num_traits::Float;
use rayon::prelude::*;

/////////////////////
// Data structures //
/////////////////////

////////////////
// SparseRows //
////////////////

/// SparseRow represents a row in a sparse matrix.
///
/// Column indices are kept sorted and unique, so the row behaves like an
/// ordered map from neighbour index to weight.
///
/// ### Fields
///
/// * `indices` - Vector of column indices corresponding to non-zero values
/// * `data` - Vector of non-zero values in the row
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SparseRow<T> {
    pub indices: Vec<usize>,
    pub data: Vec<T>,
}

impl<T> SparseRow<T>
where
    T: Float,
{
    /// Generate an empty row
    pub fn new() -> Self {
        Self {
            indices: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Generate an empty row with pre-allocated storage
    ///
    /// ### Params
    ///
    /// * `capacity` - Expected number of non-zero entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            indices: Vec::with_capacity(capacity),
            data: Vec::with_capacity(capacity),
        }
    }

    /// Build a row from unordered `(index, value)` pairs
    ///
    /// Duplicated indices are summed.
    ///
    /// ### Params
    ///
    /// * `pairs` - The entries of the row in any order
    ///
    /// ### Returns
    ///
    /// Row with sorted, unique indices
    pub fn from_pairs(mut pairs: Vec<(usize, T)>) -> Self {
        pairs.sort_unstable_by_key(|(idx, _)| *idx);

        let mut row = Self::with_capacity(pairs.len());
        for (idx, val) in pairs {
            match row.indices.last() {
                Some(&last) if last == idx => {
                    let pos = row.data.len() - 1;
                    row.data[pos] = row.data[pos] + val;
                }
                _ => {
                    row.indices.push(idx);
                    row.data.push(val);
                }
            }
        }
        row
    }

    /// Number of stored entries
    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Returns true if the row holds no entries
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Look up the weight stored for a column
    ///
    /// ### Params
    ///
    /// * `idx` - Column index
    ///
    /// ### Returns
    ///
    /// `Some(value)` if the column is present
    #[inline]
    pub fn get(&self, idx: usize) -> Option<T> {
        self.indices
            .binary_search(&idx)
            .ok()
            .map(|pos| self.data[pos])
    }

    /// Add `val` to the entry at `idx`, inserting it if absent
    ///
    /// ### Params
    ///
    /// * `idx` - Column index
    /// * `val` - Value to accumulate
    pub fn add(&mut self, idx: usize, val: T) {
        match self.indices.binary_search(&idx) {
            Ok(pos) => self.data[pos] = self.data[pos] + val,
            Err(pos) => {
                self.indices.insert(pos, idx);
                self.data.insert(pos, val);
            }
        }
    }

    /// Overwrite (or insert) the entry at `idx`
    ///
    /// ### Params
    ///
    /// * `idx` - Column index
    /// * `val` - New value
    pub fn set(&mut self, idx: usize, val: T) {
        match self.indices.binary_search(&idx) {
            Ok(pos) => self.data[pos] = val,
            Err(pos) => {
                self.indices.insert(pos, idx);
                self.data.insert(pos, val);
            }
        }
    }

    /// Iterate over `(index, value)` pairs in ascending index order
    pub fn iter(&self) -> impl Iterator<Item = (usize, T)> + '_ {
        self.indices.iter().copied().zip(self.data.iter().copied())
    }

    /// Sum of all the stored weights
    pub fn sum(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &v| acc + v)
    }

    /// Scale the row so that it sums to one
    ///
    /// Rows with zero mass are left untouched.
    ///
    /// ### Returns
    ///
    /// The sum before normalisation
    pub fn normalise(&mut self) -> T {
        let sum = self.sum();
        if sum > T::zero() {
            let inv_sum = T::one() / sum;
            for v in self.data.iter_mut() {
                *v = *v * inv_sum;
            }
        }
        sum
    }

    /// Drop all entries for which the predicate returns false
    ///
    /// ### Params
    ///
    /// * `keep` - Closure receiving `(index, value)`
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(usize, T) -> bool,
    {
        let mut write = 0;
        for read in 0..self.indices.len() {
            let (idx, val) = (self.indices[read], self.data[read]);
            if keep(idx, val) {
                self.indices[write] = idx;
                self.data[write] = val;
                write += 1;
            }
        }
        self.indices.truncate(write);
        self.data.truncate(write);
    }

    /// Remove every entry smaller than `thresh`
    ///
    /// ### Params
    ///
    /// * `thresh` - Entries `< thresh` are dropped
    pub fn prune_below(&mut self, thresh: T) {
        self.retain(|_, v| v >= thresh);
    }

    /// Clear the underlying storage
    pub fn clear(&mut self) {
        self.indices.clear();
        self.data.clear();
    }
}

/// Row-major sparse matrix: one `SparseRow` per row
pub type SparseMatrix<T> = Vec<SparseRow<T>>;

/// Number of stored entries of a sparse matrix
///
/// ### Params
///
/// * `matrix` - The sparse matrix
///
/// ### Returns
///
/// Total NNZ over all rows
pub fn sparse_matrix_nnz<T>(matrix: &[SparseRow<T>]) -> usize {
    matrix.iter().map(|row| row.indices.len()).sum()
}

/// Transpose a sparse matrix
///
/// ### Params
///
/// * `matrix` - The matrix to invert (`n_rows` rows)
/// * `n_cols` - Number of columns of `matrix`, i.e., rows of the output
///
/// ### Returns
///
/// The transposed matrix with `n_cols` rows
///
/// ### Panics
///
/// Panics if any column index is `>= n_cols`.
pub fn invert_sparse_matrix<T>(matrix: &[SparseRow<T>], n_cols: usize) -> SparseMatrix<T>
where
    T: Float,
{
    let mut counts = vec![0_usize; n_cols];
    for row in matrix {
        for &j in &row.indices {
            counts[j] += 1;
        }
    }

    let mut inverse: SparseMatrix<T> = counts
        .iter()
        .map(|&c| SparseRow::with_capacity(c))
        .collect();

    // rows are visited in ascending order, therefore each output row stays
    // sorted without any further work
    for (i, row) in matrix.iter().enumerate() {
        for (j, v) in row.iter() {
            inverse[j].indices.push(i);
            inverse[j].data.push(v);
        }
    }

    inverse
}

/// Sum of every row of a sparse matrix
///
/// ### Params
///
/// * `matrix` - The sparse matrix
///
/// ### Returns
///
/// Vector with one entry per row
pub fn sparse_row_sums<T>(matrix: &[SparseRow<T>]) -> Vec<T>
where
    T: Float + Send + Sync,
{
    matrix.par_iter().map(|row| row.sum()).collect()
}

/////////
// COO //
/////////

/// Coordinate list
///
/// Represents the graph in COO (Coordinate) format
///
/// ### Fields
///
/// * `row_indices` - Row index
/// * `col_indices` - Column index
/// * `values` - The value stored here
/// * `n_samples` - The number of vertices in the graph
#[derive(Clone, Debug)]
pub struct CoordinateList<T> {
    pub row_indices: Vec<usize>,
    pub col_indices: Vec<usize>,
    pub values: Vec<T>,
    pub n_samples: usize,
}

impl<T> CoordinateList<T>
where
    T: Float,
{
    /// Generate an edge list from the COO
    ///
    /// ### Returns
    ///
    /// A vector of tuples representing the edges and their weights
    pub fn to_edge_list(&self) -> Vec<(usize, usize, T)> {
        self.row_indices
            .iter()
            .zip(&self.col_indices)
            .zip(&self.values)
            .map(|((&r, &c), &v)| (r, c, v))
            .collect()
    }

    /// Returns the number of edges in the graph
    pub fn get_size(&self) -> usize {
        self.row_indices.len()
    }

    /// Convert the COO into the row-major sparse representation
    ///
    /// Duplicate `(row, col)` pairs are summed.
    ///
    /// ### Returns
    ///
    /// Sparse matrix with `n_samples` rows
    pub fn to_sparse_rows(&self) -> SparseMatrix<T> {
        let mut buckets: Vec<Vec<(usize, T)>> = vec![Vec::new(); self.n_samples];
        for ((&r, &c), &v) in self
            .row_indices
            .iter()
            .zip(&self.col_indices)
            .zip(&self.values)
        {
            buckets[r].push((c, v));
        }
        buckets.into_iter().map(SparseRow::from_pairs).collect()
    }

    /// Flatten a row-major sparse matrix into COO format
    ///
    /// ### Params
    ///
    /// * `matrix` - The sparse matrix
    ///
    /// ### Returns
    ///
    /// The coordinate list
    pub fn from_sparse_rows(matrix: &[SparseRow<T>]) -> Self {
        let nnz = sparse_matrix_nnz(matrix);
        let mut row_indices = Vec::with_capacity(nnz);
        let mut col_indices = Vec::with_capacity(nnz);
        let mut values = Vec::with_capacity(nnz);

        for (i, row) in matrix.iter().enumerate() {
            for (j, v) in row.iter() {
                row_indices.push(i);
                col_indices.push(j);
                values.push(v);
            }
        }

        Self {
            row_indices,
            col_indices,
            values,
            n_samples: matrix.len(),
        }
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod test_structures {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_from_pairs_sorts_and_merges() {
        let row = SparseRow::from_pairs(vec![(3, 1.0), (1, 0.5), (3, 2.0), (0, 0.25)]);

        assert_eq!(row.indices, vec![0, 1, 3]);
        assert_relative_eq!(row.data[2], 3.0);
        assert_eq!(row.len(), 3);
    }

    #[test]
    fn test_add_and_get() {
        let mut row = SparseRow::<f64>::new();
        row.add(5, 1.0);
        row.add(2, 0.5);
        row.add(5, 0.5);

        assert_eq!(row.indices, vec![2, 5]);
        assert_eq!(row.get(5), Some(1.5));
        assert_eq!(row.get(7), None);

        row.set(2, 3.0);
        assert_eq!(row.get(2), Some(3.0));
    }

    #[test]
    fn test_normalise_and_prune() {
        let mut row = SparseRow::from_pairs(vec![(0, 1.0), (1, 3.0), (2, 0.001)]);
        let sum = row.normalise();

        assert_relative_eq!(sum, 4.001, epsilon = 1e-12);
        assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-12);

        row.prune_below(0.01);
        assert_eq!(row.indices, vec![0, 1]);
    }

    #[test]
    fn test_normalise_empty_row() {
        let mut row = SparseRow::<f32>::new();
        assert_eq!(row.normalise(), 0.0);
        assert!(row.is_empty());
    }

    #[test]
    fn test_invert_sparse_matrix() {
        let matrix = vec![
            SparseRow::from_pairs(vec![(0, 0.5), (2, 0.5)]),
            SparseRow::from_pairs(vec![(1, 1.0)]),
            SparseRow::from_pairs(vec![(2, 0.2), (0, 0.8)]),
        ];

        let inv = invert_sparse_matrix(&matrix, 3);

        assert_eq!(inv[0].indices, vec![0, 2]);
        assert_relative_eq!(inv[0].data[1], 0.8);
        assert_eq!(inv[1].indices, vec![1]);
        assert_eq!(inv[2].indices, vec![0, 2]);
        assert_eq!(sparse_matrix_nnz(&inv), sparse_matrix_nnz(&matrix));
    }

    #[test]
    fn test_coo_round_trip() {
        let coo = CoordinateList {
            row_indices: vec![0, 0, 1, 2, 0],
            col_indices: vec![1, 2, 0, 1, 1],
            values: vec![0.5, 0.3, 1.0, 0.7, 0.1],
            n_samples: 3,
        };

        let rows = coo.to_sparse_rows();
        assert_eq!(rows[0].indices, vec![1, 2]);
        assert_relative_eq!(rows[0].data[0], 0.6, epsilon = 1e-12);

        let back = CoordinateList::from_sparse_rows(&rows);
        assert_eq!(back.get_size(), 4);
        assert_eq!(back.n_samples, 3);
    }
}
