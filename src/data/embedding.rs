use num_traits::{Float, FromPrimitive};

use crate::data::structures::*;
use crate::error::{HsneError, Result};

///////////////
// Embedding //
///////////////

/// Low-dimensional embedding stored as one flat row-major buffer
///
/// ### Fields
///
/// * `num_dimensions` - Dimensionality of the embedding (2 in most cases)
/// * `num_data_points` - Number of embedded points
/// * `embedding` - `num_data_points * num_dimensions` coordinates
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Embedding<T> {
    num_dimensions: usize,
    num_data_points: usize,
    embedding: Vec<T>,
}

impl<T> Embedding<T>
where
    T: Float + FromPrimitive,
{
    /// Generate a new embedding filled with `value`
    ///
    /// ### Params
    ///
    /// * `num_dimensions` - Dimensionality of the embedding
    /// * `num_data_points` - Number of points
    /// * `value` - Initial value of every coordinate
    pub fn new(num_dimensions: usize, num_data_points: usize, value: T) -> Self {
        Self {
            num_dimensions,
            num_data_points,
            embedding: vec![value; num_dimensions * num_data_points],
        }
    }

    /// Wrap an existing flat buffer
    ///
    /// ### Params
    ///
    /// * `num_dimensions` - Dimensionality of the embedding
    /// * `embedding` - Row-major coordinates
    ///
    /// ### Returns
    ///
    /// The embedding or an error if the buffer length is not a multiple of
    /// `num_dimensions`
    pub fn from_flat(num_dimensions: usize, embedding: Vec<T>) -> Result<Self> {
        if num_dimensions == 0 || embedding.len() % num_dimensions != 0 {
            return Err(HsneError::InvalidArgument(format!(
                "Buffer of length {} does not hold {}-dimensional points",
                embedding.len(),
                num_dimensions
            )));
        }
        Ok(Self {
            num_dimensions,
            num_data_points: embedding.len() / num_dimensions,
            embedding,
        })
    }

    /// Resize the embedding; new coordinates are set to `value`
    pub fn resize(&mut self, num_dimensions: usize, num_data_points: usize, value: T) {
        self.num_dimensions = num_dimensions;
        self.num_data_points = num_data_points;
        self.embedding
            .resize(num_dimensions * num_data_points, value);
    }

    /// Drop all points
    pub fn clear(&mut self) {
        self.num_dimensions = 0;
        self.num_data_points = 0;
        self.embedding.clear();
    }

    pub fn num_dimensions(&self) -> usize {
        self.num_dimensions
    }

    pub fn num_data_points(&self) -> usize {
        self.num_data_points
    }

    /// The flat coordinate buffer
    pub fn container(&self) -> &[T] {
        &self.embedding
    }

    /// The flat coordinate buffer, mutable
    pub fn container_mut(&mut self) -> &mut [T] {
        &mut self.embedding
    }

    /// Coordinate `d` of point `i`
    #[inline]
    pub fn data_at(&self, i: usize, d: usize) -> T {
        self.embedding[i * self.num_dimensions + d]
    }

    /// Mutable coordinate `d` of point `i`
    #[inline]
    pub fn data_at_mut(&mut self, i: usize, d: usize) -> &mut T {
        &mut self.embedding[i * self.num_dimensions + d]
    }

    /// All coordinates of point `i`
    #[inline]
    pub fn point(&self, i: usize) -> &[T] {
        let start = i * self.num_dimensions;
        &self.embedding[start..start + self.num_dimensions]
    }

    /// One `Vec` per point
    pub fn to_coordinates(&self) -> Vec<Vec<T>> {
        if self.num_dimensions == 0 {
            return Vec::new();
        }
        self.embedding
            .chunks(self.num_dimensions)
            .map(|c| c.to_vec())
            .collect()
    }

    /// Bounding box of the embedding
    ///
    /// ### Params
    ///
    /// * `offset` - Fraction of the extent added as margin (split between
    ///   both sides). `0` returns the tight box.
    /// * `squared_limits` - If true, every dimension gets the extent of the
    ///   widest one
    ///
    /// ### Returns
    ///
    /// `[min_0, max_0, min_1, max_1, ...]`
    pub fn compute_embedding_bbox(&self, offset: T, squared_limits: bool) -> Vec<T> {
        let n_dim = self.num_dimensions;
        let mut limits = Vec::with_capacity(n_dim * 2);
        for _ in 0..n_dim {
            limits.push(T::max_value());
            limits.push(-T::max_value());
        }

        for chunk in self.embedding.chunks(n_dim.max(1)) {
            for (d, &v) in chunk.iter().enumerate() {
                limits[d * 2] = limits[d * 2].min(v);
                limits[d * 2 + 1] = limits[d * 2 + 1].max(v);
            }
        }

        if offset <= T::zero() {
            return limits;
        }

        let two = T::from_f64(2.0).unwrap();
        let mut max_dist = T::zero();
        for d in 0..n_dim {
            let diff = limits[d * 2 + 1] - limits[d * 2];
            limits[d * 2] = limits[d * 2] - diff * offset / two;
            limits[d * 2 + 1] = limits[d * 2 + 1] + diff * offset / two;
            max_dist = max_dist.max(diff);
        }

        if squared_limits {
            let half_width = max_dist / two / (T::one() - offset);
            for d in 0..n_dim {
                let centre = (limits[d * 2 + 1] + limits[d * 2]) / two;
                limits[d * 2] = centre - half_width;
                limits[d * 2 + 1] = centre + half_width;
            }
        }

        limits
    }

    /// Per-dimension shift that moves the bounding box centre to the origin
    fn centring_shifts(&self) -> Vec<T> {
        let limits = self.compute_embedding_bbox(T::zero(), false);
        let half = T::from_f64(0.5).unwrap();
        (0..self.num_dimensions)
            .map(|d| -half * (limits[d * 2 + 1] + limits[d * 2]))
            .collect()
    }

    /// Centre the bounding box on the origin
    pub fn zero_centered(&mut self) {
        if self.num_data_points == 0 {
            return;
        }
        let shifts = self.centring_shifts();
        let n_dim = self.num_dimensions;
        for chunk in self.embedding.chunks_mut(n_dim) {
            for (v, &s) in chunk.iter_mut().zip(&shifts) {
                *v = *v + s;
            }
        }
    }

    /// Centre and scale up the embedding if the extent of the first dimension
    /// is smaller than `diameter`
    pub fn scale_if_smaller_than(&mut self, diameter: T) {
        if self.num_data_points == 0 {
            return;
        }
        let limits = self.compute_embedding_bbox(T::zero(), false);
        let extent = limits[1] - limits[0];
        if extent >= diameter || extent <= T::zero() {
            return;
        }

        let scale_factor = diameter / extent;
        let shifts = self.centring_shifts();
        let n_dim = self.num_dimensions;
        for chunk in self.embedding.chunks_mut(n_dim) {
            for (v, &s) in chunk.iter_mut().zip(&shifts) {
                *v = (*v + s) * scale_factor;
            }
        }
    }
}

/// Place points as the weighted average of embedded landmarks
///
/// ### Params
///
/// * `input` - Embedding of the landmarks
/// * `weights` - One row per output point; column indices address points of
///   `input`
///
/// ### Returns
///
/// New embedding with `weights.len()` points. Rows without any weight are
/// placed at the origin.
pub fn interpolate_embedding_positions<T>(
    input: &Embedding<T>,
    weights: &[SparseRow<T>],
) -> Result<Embedding<T>>
where
    T: Float + FromPrimitive,
{
    let n_dim = input.num_dimensions();
    let mut output = Embedding::new(n_dim, weights.len(), T::zero());

    for (i, row) in weights.iter().enumerate() {
        let mut total_weight = T::zero();
        for (idx, w) in row.iter() {
            if idx >= input.num_data_points() {
                return Err(HsneError::InvalidArgument(format!(
                    "Weight refers to point {} but the embedding holds {}",
                    idx,
                    input.num_data_points()
                )));
            }
            for d in 0..n_dim {
                *output.data_at_mut(i, d) = output.data_at(i, d) + input.data_at(idx, d) * w;
            }
            total_weight = total_weight + w;
        }
        if total_weight > T::zero() {
            for d in 0..n_dim {
                *output.data_at_mut(i, d) = output.data_at(i, d) / total_weight;
            }
        }
    }

    Ok(output)
}

///////////
// Tests //
///////////
