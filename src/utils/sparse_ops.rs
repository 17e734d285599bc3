//! Sparse operations on the row-major `SparseMatrix` used for transition
//! matrices and areas of influence. The accumulator uses unsafe under the hood.

use num_traits::Float;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::ops::AddAssign;

use crate::data::structures::*;

/////////////////////
// Sparse row sums //
/////////////////////

/// For every row, sum the weights stored in a subset of the columns
///
/// ### Params
///
/// * `mat` - The sparse matrix
/// * `col_indices` - The columns to accumulate
///
/// ### Returns
///
/// A sparse vector (as a `SparseRow`) holding, per row, the summed weight of
/// the selected columns. Rows without any selected column are absent.
pub fn sparse_col_subset_sum<T>(mat: &[SparseRow<T>], col_indices: &[usize]) -> SparseRow<T>
where
    T: Float + Send + Sync,
{
    let selected: FxHashSet<usize> = col_indices.iter().copied().collect();

    let sums: Vec<(usize, T)> = mat
        .par_iter()
        .enumerate()
        .filter_map(|(i, row)| {
            let mut sum = T::zero();
            let mut hit = false;
            for (j, v) in row.iter() {
                if selected.contains(&j) {
                    sum = sum + v;
                    hit = true;
                }
            }
            hit.then_some((i, sum))
        })
        .collect();

    SparseRow {
        indices: sums.iter().map(|(i, _)| *i).collect(),
        data: sums.iter().map(|(_, v)| *v).collect(),
    }
}

////////////////////////
// Sparse composition //
////////////////////////

/// Sparse accumulator for efficient sparse matrix multiplication
///
/// ### Fields
///
/// * `values` - Vector storing accumulated values for each index
/// * `indices` - Vector of active (non-zero) indices
/// * `flags` - Boolean flags indicating which indices are active
pub struct SparseAccumulator<T>
where
    T: Float + AddAssign,
{
    values: Vec<T>,
    indices: Vec<usize>,
    flags: Vec<bool>,
}

impl<T> SparseAccumulator<T>
where
    T: Float + AddAssign,
{
    /// Create a new sparse accumulator
    ///
    /// ### Params
    ///
    /// * `size` - Maximum number of indices to accumulate
    pub fn new(size: usize) -> Self {
        Self {
            values: vec![T::zero(); size],
            indices: Vec::with_capacity(size / 10 + 1),
            flags: vec![false; size],
        }
    }

    /// Add a value to the accumulator at the given index
    ///
    /// ### Params
    ///
    /// * `idx` - Index to accumulate at
    /// * `val` - Value to add
    ///
    /// ### Safety
    ///
    /// `idx` must be less than the size specified during construction
    #[inline]
    pub unsafe fn add(&mut self, idx: usize, val: T) {
        if !*self.flags.get_unchecked(idx) {
            *self.flags.get_unchecked_mut(idx) = true;
            self.indices.push(idx);
            *self.values.get_unchecked_mut(idx) = val;
        } else {
            *self.values.get_unchecked_mut(idx) += val;
        }
    }

    /// Extract the accumulated values as a sorted row and reset the
    /// accumulator
    ///
    /// ### Returns
    ///
    /// `SparseRow` with sorted indices
    #[inline]
    pub fn extract_row(&mut self) -> SparseRow<T> {
        self.indices.sort_unstable();
        let mut row = SparseRow::with_capacity(self.indices.len());
        // SAFETY: all stored indices went through `add`, which requires them
        // to be in bounds
        unsafe {
            for &idx in &self.indices {
                row.indices.push(idx);
                row.data.push(*self.values.get_unchecked(idx));
                *self.flags.get_unchecked_mut(idx) = false;
                *self.values.get_unchecked_mut(idx) = T::zero();
            }
        }
        self.indices.clear();
        row
    }
}

/// Multiply a sparse row vector with a sparse matrix
///
/// ### Params
///
/// * `row` - Row vector whose indices address rows of `mat`
/// * `mat` - Right-hand matrix
/// * `acc` - Re-usable accumulator sized to the number of columns of `mat`
///
/// ### Returns
///
/// `row * mat` as a sparse row
///
/// ### Panics
///
/// Panics if an index of `row` is out of bounds for `mat` or a column of
/// `mat` exceeds the accumulator size.
pub fn sparse_row_times_matrix<T>(
    row: &SparseRow<T>,
    mat: &[SparseRow<T>],
    acc: &mut SparseAccumulator<T>,
) -> SparseRow<T>
where
    T: Float + AddAssign,
{
    for (k, a_val) in row.iter() {
        for (j, b_val) in mat[k].iter() {
            assert!(j < acc.flags.len(), "Column index out of bounds");
            // SAFETY: bounds checked right above
            unsafe { acc.add(j, a_val * b_val) };
        }
    }
    acc.extract_row()
}

/// Multiply two sparse matrices using sparse accumulators and parallel
/// processing
///
/// ### Params
///
/// * `a` - Left matrix
/// * `b` - Right matrix; `a`'s column indices address its rows
/// * `n_cols` - Number of columns of `b`
///
/// ### Returns
///
/// `a * b` in row-major sparse format
pub fn sparse_matmul<T>(a: &[SparseRow<T>], b: &[SparseRow<T>], n_cols: usize) -> SparseMatrix<T>
where
    T: Float + AddAssign + Send + Sync,
{
    a.par_iter()
        .map_init(
            || SparseAccumulator::new(n_cols),
            |acc, row| sparse_row_times_matrix(row, b, acc),
        )
        .collect()
}

/////////////
// L1 norm //
/////////////

/// Normalises the rows of a sparse matrix to a sum of 1 (L1 norm)
///
/// ### Params
///
/// * `mat` - Mutable reference to the matrix (modified in-place)
pub fn normalise_rows_l1<T>(mat: &mut [SparseRow<T>])
where
    T: Float + Send + Sync,
{
    mat.par_iter_mut().for_each(|row| {
        row.normalise();
    });
}

///////////
// Tests //
///////////

#[cfg(test)]
mod test_sparse_ops {
    use super::*;
    use approx::assert_relative_eq;

    fn identity(n: usize) -> SparseMatrix<f64> {
        (0..n)
            .map(|i| SparseRow::from_pairs(vec![(i, 1.0)]))
            .collect()
    }

    #[test]
    fn test_matmul_identity() {
        let a = vec![
            SparseRow::from_pairs(vec![(0, 0.3), (2, 0.7)]),
            SparseRow::from_pairs(vec![(1, 1.0)]),
            SparseRow::new(),
        ];

        let res = sparse_matmul(&a, &identity(3), 3);

        assert_eq!(res, a);
    }

    #[test]
    fn test_matmul_small() {
        // [0.5 0.5] x [[0.2 0.8], [1.0 0.0]] = [0.6 0.4]
        let a = vec![SparseRow::from_pairs(vec![(0, 0.5), (1, 0.5)])];
        let b = vec![
            SparseRow::from_pairs(vec![(0, 0.2), (1, 0.8)]),
            SparseRow::from_pairs(vec![(0, 1.0)]),
        ];

        let res = sparse_matmul(&a, &b, 2);

        assert_eq!(res[0].indices, vec![0, 1]);
        assert_relative_eq!(res[0].data[0], 0.6, epsilon = 1e-12);
        assert_relative_eq!(res[0].data[1], 0.4, epsilon = 1e-12);
    }

    #[test]
    fn test_accumulator_reuse() {
        let b = identity(4);
        let mut acc = SparseAccumulator::new(4);

        let r1 = sparse_row_times_matrix(&SparseRow::from_pairs(vec![(3, 1.0)]), &b, &mut acc);
        let r2 = sparse_row_times_matrix(&SparseRow::from_pairs(vec![(1, 2.0)]), &b, &mut acc);

        assert_eq!(r1.indices, vec![3]);
        assert_eq!(r2.indices, vec![1]);
        assert_relative_eq!(r2.data[0], 2.0);
    }

    #[test]
    fn test_col_subset_sum() {
        let mat = vec![
            SparseRow::from_pairs(vec![(0, 0.5), (1, 0.5)]),
            SparseRow::from_pairs(vec![(2, 1.0)]),
            SparseRow::from_pairs(vec![(0, 0.1), (2, 0.9)]),
        ];

        let res = sparse_col_subset_sum(&mat, &[0, 1]);

        assert_eq!(res.indices, vec![0, 2]);
        assert_relative_eq!(res.data[0], 1.0);
        assert_relative_eq!(res.data[1], 0.1);
    }

    #[test]
    fn test_normalise_rows() {
        let mut mat = vec![
            SparseRow::from_pairs(vec![(0, 2.0), (1, 2.0)]),
            SparseRow::new(),
        ];
        normalise_rows_l1(&mut mat);

        assert_relative_eq!(mat[0].data[0], 0.5);
        assert!(mat[1].is_empty());
    }
}
