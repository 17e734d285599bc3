use log::debug;
use num_traits::{Float, FromPrimitive};
use rayon::prelude::*;

use crate::assert_same_len;
use crate::data::structures::*;
use crate::error::{HsneError, Result};

///////////////
// Distances //
///////////////

/// Squared Euclidean distance between two vectors
///
/// ### Params
///
/// * `a` - First vector
/// * `b` - Second vector
///
/// ### Returns
///
/// `Σ (a_i - b_i)²`
///
/// ### Panics
///
/// If the two vectors have different lengths.
#[inline]
pub fn euclidean_distance_squared<T: Float>(a: &[T], b: &[T]) -> T {
    assert_same_len!(a, b);
    a.iter().zip(b).fold(T::zero(), |acc, (&x, &y)| {
        let diff = x - y;
        acc + diff * diff
    })
}

/// Euclidean distance between two vectors
///
/// ### Params
///
/// * `a` - First vector
/// * `b` - Second vector
///
/// ### Returns
///
/// The L2 distance
#[inline]
pub fn euclidean_distance<T: Float>(a: &[T], b: &[T]) -> T {
    euclidean_distance_squared(a, b).sqrt()
}

//////////////////////////
// Gaussian calibration //
//////////////////////////

/// Result of fitting a Gaussian kernel to a distance vector
///
/// ### Fields
///
/// * `distribution` - Normalised probabilities, one per distance
/// * `sigma` - Bandwidth of the final kernel
/// * `converged` - `false` if the search ran out of iterations and the
///   uniform fallback was returned
#[derive(Clone, Debug)]
pub struct GaussianFit<T> {
    pub distribution: Vec<T>,
    pub sigma: T,
    pub converged: bool,
}

/// Normalised Gaussian kernel over (non-squared) distances
///
/// ### Params
///
/// * `distances` - Distances to the neighbours
/// * `sigma` - Kernel bandwidth; must be positive
///
/// ### Returns
///
/// `(distribution, sum)` with the sum of the kernel before normalisation
pub fn compute_gaussian_distribution<T>(distances: &[T], sigma: T) -> Result<(Vec<T>, T)>
where
    T: Float + FromPrimitive,
{
    if distances.is_empty() {
        return Err(HsneError::InvalidArgument(
            "Empty distance vector".to_string(),
        ));
    }
    if sigma <= T::zero() {
        return Err(HsneError::InvalidArgument(
            "Sigma must be positive".to_string(),
        ));
    }

    let two = T::from_f64(2.0).unwrap();
    let mult = -T::one() / (two * sigma * sigma);

    let mut distribution: Vec<T> = distances.iter().map(|&d| (d * d * mult).exp()).collect();
    let sum = distribution.iter().fold(T::zero(), |acc, &v| acc + v);
    for v in distribution.iter_mut() {
        *v = *v / sum;
    }

    Ok((distribution, sum))
}

/// Unnormalised Gaussian kernel `alpha * exp(-d² / 2σ²)`
///
/// ### Params
///
/// * `distances` - Distances (not squared)
/// * `sigma` - Kernel bandwidth
/// * `alpha` - Scaling of the kernel
///
/// ### Returns
///
/// `(values, sum)`
pub fn compute_gaussian_function<T>(distances: &[T], sigma: T, alpha: T) -> Result<(Vec<T>, T)>
where
    T: Float + FromPrimitive,
{
    if distances.is_empty() {
        return Err(HsneError::InvalidArgument(
            "Empty distance vector".to_string(),
        ));
    }
    if sigma <= T::zero() || alpha <= T::zero() {
        return Err(HsneError::InvalidArgument(
            "Sigma and alpha must be positive".to_string(),
        ));
    }

    let two = T::from_f64(2.0).unwrap();
    let beta = -T::one() / (two * sigma * sigma);

    let values: Vec<T> = distances
        .iter()
        .map(|&d| alpha * (d * d * beta).exp())
        .collect();
    let sum = values.iter().fold(T::zero(), |acc, &v| acc + v);

    Ok((values, sum))
}

/// Binary search state over the precision β = 1 / 2σ²
struct BetaSearch<T> {
    beta: T,
    min_beta: Option<T>,
    max_beta: Option<T>,
}

impl<T: Float + FromPrimitive> BetaSearch<T> {
    fn new() -> Self {
        Self {
            beta: T::one(),
            min_beta: None,
            max_beta: None,
        }
    }

    /// Kernel too wide, make β larger
    fn increase(&mut self) {
        let two = T::from_f64(2.0).unwrap();
        self.min_beta = Some(self.beta);
        self.beta = match self.max_beta {
            Some(max) => (self.beta + max) / two,
            None => self.beta * two,
        };
    }

    /// Kernel too narrow, make β smaller
    fn decrease(&mut self) {
        let two = T::from_f64(2.0).unwrap();
        self.max_beta = Some(self.beta);
        self.beta = match self.min_beta {
            Some(min) => (self.beta + min) / two,
            None => self.beta / two,
        };
    }

    fn sigma(&self) -> T {
        let two = T::from_f64(2.0).unwrap();
        (T::one() / (two * self.beta)).sqrt()
    }
}

/// Uniform distribution over all but the ignored entry
fn uniform_fallback<T: Float + FromPrimitive>(size: usize, ignore: Option<usize>) -> Vec<T> {
    let effective = match ignore {
        Some(i) if i < size => size - 1,
        _ => size,
    };
    let v = T::one() / T::from_usize(effective.max(1)).unwrap();
    let mut distribution = vec![v; size];
    if let Some(i) = ignore.filter(|&i| i < size) {
        distribution[i] = T::zero();
    }
    distribution
}

/// Gaussian distribution over squared distances calibrated to a perplexity
///
/// Binary search on β such that the entropy (in nats) of the normalised
/// kernel `exp(-β d)` equals `ln(perplexity)`.
///
/// ### Params
///
/// * `distances` - **Squared** distances
/// * `perplexity` - Target perplexity
/// * `max_iter` - Maximum number of search steps (typically 200-500)
/// * `tol` - Tolerance on the entropy (typically 1e-5)
/// * `ignore` - Optional index that receives zero probability (usually the
///   point itself)
///
/// ### Returns
///
/// The `GaussianFit`. If the search does not converge the distribution is
/// uniform over the non-ignored entries.
pub fn compute_gaussian_distribution_with_fixed_perplexity<T>(
    distances: &[T],
    perplexity: T,
    max_iter: usize,
    tol: T,
    ignore: Option<usize>,
) -> Result<GaussianFit<T>>
where
    T: Float + FromPrimitive,
{
    if distances.is_empty() {
        return Err(HsneError::InvalidArgument(
            "Empty distance vector".to_string(),
        ));
    }
    if perplexity <= T::zero() {
        return Err(HsneError::InvalidArgument(
            "Perplexity must be positive".to_string(),
        ));
    }

    let target = perplexity.ln();
    let mut search = BetaSearch::<T>::new();
    let mut distribution = vec![T::zero(); distances.len()];

    for _ in 0..max_iter {
        let mut sum = T::min_positive_value();
        for (idx, (&d, p)) in distances.iter().zip(distribution.iter_mut()).enumerate() {
            if Some(idx) == ignore {
                *p = T::zero();
                continue;
            }
            *p = (-search.beta * d).exp();
            sum = sum + *p;
        }

        let weighted = distances
            .iter()
            .zip(&distribution)
            .fold(T::zero(), |acc, (&d, &p)| acc + d * p);
        let entropy = search.beta * weighted / sum + sum.ln();
        let diff = entropy - target;

        if diff.abs() < tol {
            for p in distribution.iter_mut() {
                *p = *p / sum;
            }
            return Ok(GaussianFit {
                distribution,
                sigma: search.sigma(),
                converged: true,
            });
        }

        if diff > T::zero() {
            search.increase();
        } else {
            search.decrease();
        }
    }

    Ok(GaussianFit {
        distribution: uniform_fallback(distances.len(), ignore),
        sigma: T::zero(),
        converged: false,
    })
}

/// Gaussian distribution over squared distances calibrated to a kernel sum
///
/// Same binary search as the perplexity version but matches the sum of the
/// unnormalised kernel to `weight`.
///
/// ### Params
///
/// * `distances` - **Squared** distances
/// * `weight` - Target sum of the kernel
/// * `max_iter` - Maximum number of search steps
/// * `tol` - Tolerance on the sum
/// * `ignore` - Optional index that receives zero probability
///
/// ### Returns
///
/// `(distribution, kernel_sum)`; the sum is `1` when the uniform fallback is
/// used.
pub fn compute_gaussian_distribution_with_fixed_weight<T>(
    distances: &[T],
    weight: T,
    max_iter: usize,
    tol: T,
    ignore: Option<usize>,
) -> Result<(Vec<T>, T)>
where
    T: Float + FromPrimitive,
{
    if distances.is_empty() {
        return Err(HsneError::InvalidArgument(
            "Empty distance vector".to_string(),
        ));
    }

    let mut search = BetaSearch::<T>::new();
    let mut distribution = vec![T::zero(); distances.len()];

    for _ in 0..max_iter {
        let mut sum = T::min_positive_value();
        for (idx, (&d, p)) in distances.iter().zip(distribution.iter_mut()).enumerate() {
            if Some(idx) == ignore {
                *p = T::zero();
                continue;
            }
            *p = (-search.beta * d).exp();
            sum = sum + *p;
        }

        if (sum - weight).abs() < tol {
            for p in distribution.iter_mut() {
                *p = *p / sum;
            }
            return Ok((distribution, sum));
        }

        if sum > weight {
            search.increase();
        } else {
            search.decrease();
        }
    }

    Ok((uniform_fallback(distances.len(), ignore), T::one()))
}

////////////////
// Perplexity //
////////////////

/// Perplexity `2^H` of a (normalised) distribution, H in bits
pub fn compute_perplexity<T: Float + FromPrimitive>(distribution: &[T]) -> T {
    let entropy = distribution
        .iter()
        .filter(|&&p| p > T::zero())
        .fold(T::zero(), |acc, &p| acc - p * p.log2());
    T::from_f64(2.0).unwrap().powf(entropy)
}

/// Perplexity of a distribution stored as a sparse row
pub fn compute_perplexity_sparse<T: Float + FromPrimitive>(row: &SparseRow<T>) -> T {
    compute_perplexity(&row.data)
}

//////////////////
// Markov chain //
//////////////////

/// Row vector times sparse matrix
///
/// ### Params
///
/// * `a` - Row vector with one entry per row of `b`
/// * `b` - Square sparse matrix
///
/// ### Returns
///
/// `a * b`
pub fn multiply<T: Float>(a: &[T], b: &[SparseRow<T>]) -> Vec<T> {
    assert_same_len!(a, b);
    let mut c = vec![T::zero(); a.len()];
    for (i, &a_i) in a.iter().enumerate() {
        if a_i == T::zero() {
            continue;
        }
        for (j, v) in b[i].iter() {
            c[j] = c[j] + v * a_i;
        }
    }
    c
}

/// Power iteration of a distribution over a finite Markov chain
///
/// Entries falling below `eps` are flushed to zero after every step.
///
/// ### Params
///
/// * `fmc` - Row-stochastic transition matrix
/// * `distribution` - Starting distribution, replaced with the result
/// * `iterations` - Number of steps
/// * `eps` - Flush threshold
pub fn compute_stationary_distribution<T: Float>(
    fmc: &[SparseRow<T>],
    distribution: &mut Vec<T>,
    iterations: usize,
    eps: T,
) {
    assert_same_len!(fmc, distribution);

    let tol = T::from(1e-3).unwrap();
    for (i, row) in fmc.iter().enumerate() {
        let sum = row.sum();
        if (sum - T::one()).abs() > tol {
            debug!(
                "Row {} of the Markov chain sums to {}",
                i,
                sum.to_f64().unwrap_or(f64::NAN)
            );
        }
    }

    for _ in 0..iterations {
        let mut next = multiply(distribution, fmc);
        for v in next.iter_mut() {
            if *v < eps {
                *v = T::zero();
            }
        }
        *distribution = next;
    }
}

/// Stationary distribution of a finite Markov chain
///
/// ### Params
///
/// * `initial` - Initial distribution
/// * `fmc` - Transition matrix
/// * `iterations` - Number of power iterations (typically 1000)
///
/// ### Returns
///
/// The distribution after `iterations` steps
pub fn stationary_distribution_fmc<T: Float>(
    initial: &[T],
    fmc: &[SparseRow<T>],
    iterations: usize,
) -> Vec<T> {
    let mut distribution = initial.to_vec();
    for _ in 0..iterations {
        distribution = multiply(&distribution, fmc);
    }
    distribution
}

/// Per-state heterogeneity of a Markov chain
///
/// For each state, the fraction of mass that is back on the state after five
/// steps of a walk starting there.
///
/// ### Params
///
/// * `fmc` - Transition matrix
///
/// ### Returns
///
/// One value per state
pub fn compute_heterogeneity<T>(fmc: &[SparseRow<T>]) -> Vec<T>
where
    T: Float + FromPrimitive + Send + Sync,
{
    let n = fmc.len();
    let n_t = T::from_usize(n).unwrap();

    (0..n)
        .into_par_iter()
        .map(|i| {
            let mut distr = vec![T::zero(); n];
            distr[i] = n_t;
            compute_stationary_distribution(fmc, &mut distr, 5, T::one());
            distr[i] / n_t
        })
        .collect()
}

///////////
// Tests //
///////////

#[cfg(test)]
mod test_math {
    use super::*;
    use approx::assert_relative_eq;

    fn sparse(pairs: &[&[(usize, f64)]]) -> SparseMatrix<f64> {
        pairs
            .iter()
            .map(|row| SparseRow::from_pairs(row.to_vec()))
            .collect()
    }

    #[test]
    fn test_euclidean_distances() {
        let a = [0.0_f32, 0.0, 0.0];
        let b = [1.0_f32, 1.0, 1.0];
        let c = [2.0_f32, 2.0, 2.0];

        assert_eq!(euclidean_distance(&a, &a), 0.0);
        assert_eq!(euclidean_distance_squared(&a, &b), 3.0);
        assert_eq!(euclidean_distance(&a, &b), 3.0_f32.sqrt());
        assert_eq!(euclidean_distance_squared(&a, &c), 12.0);
    }

    #[test]
    #[should_panic]
    fn test_euclidean_distance_mismatch() {
        euclidean_distance(&[1.0, 2.0], &[1.0]);
    }

    #[test]
    fn test_gaussian_distribution_sums_to_one() {
        assert!(compute_gaussian_distribution::<f64>(&[], 0.5).is_err());

        let distances: Vec<f64> = (0..100)
            .map(|i| {
                let v = (3.1415 / 100.0 * i as f64).sin();
                v * v
            })
            .collect();

        let (distr, norm) = compute_gaussian_distribution(&distances, 0.5).unwrap();
        let sum: f64 = distr.iter().sum();

        assert!(norm > 0.0);
        assert_relative_eq!(sum, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_gaussian_function_sum_matches() {
        let distances: Vec<f32> = (0..100).map(|i| (i as f32 / 100.0).powi(2)).collect();
        let (values, sum) = compute_gaussian_function(&distances, 0.5, 1.0).unwrap();
        let total: f32 = values.iter().sum();

        assert_relative_eq!(total, sum, epsilon = 1e-4);
        assert!(compute_gaussian_function::<f32>(&[], 0.5, 1.0).is_err());
    }

    #[test]
    fn test_fixed_perplexity_hits_target() {
        let distances: Vec<f64> = (0..100).map(|i| i as f64 * 0.1).collect();
        let fit =
            compute_gaussian_distribution_with_fixed_perplexity(&distances, 10.0, 500, 1e-5, None)
                .unwrap();

        let sum: f64 = fit.distribution.iter().sum();
        assert!(fit.converged);
        assert!(fit.sigma > 0.0);
        assert_relative_eq!(sum, 1.0, epsilon = 1e-4);
        assert_relative_eq!(compute_perplexity(&fit.distribution), 10.0, epsilon = 1e-3);
    }

    #[test]
    fn test_fixed_perplexity_ignores_self() {
        let distances = vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let fit =
            compute_gaussian_distribution_with_fixed_perplexity(&distances, 2.0, 200, 1e-5, Some(0))
                .unwrap();

        assert_eq!(fit.distribution[0], 0.0);
        let sum: f64 = fit.distribution.iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_fixed_perplexity_fallback() {
        // unreachable target with a single iteration
        let distances = vec![0.0_f32, 1.0, 4.0, 9.0];
        let fit =
            compute_gaussian_distribution_with_fixed_perplexity(&distances, 3.0, 1, 1e-8, Some(0))
                .unwrap();

        assert!(!fit.converged);
        assert_eq!(fit.distribution[0], 0.0);
        assert_relative_eq!(fit.distribution[1], 1.0 / 3.0);
    }

    #[test]
    fn test_fixed_weight() {
        let distances: Vec<f64> = (1..20).map(|i| i as f64).collect();
        let (distr, sum) =
            compute_gaussian_distribution_with_fixed_weight(&distances, 0.5, 500, 1e-6, None)
                .unwrap();

        assert_relative_eq!(sum, 0.5, epsilon = 1e-5);
        assert_relative_eq!(distr.iter().sum::<f64>(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_perplexity_computation() {
        assert_relative_eq!(compute_perplexity(&[0.1_f64; 10]), 10.0, epsilon = 1e-5);

        let mut peaked = vec![0.0_f32; 10];
        peaked[0] = 1.0;
        assert_relative_eq!(compute_perplexity(&peaked), 1.0, epsilon = 1e-5);

        let row = SparseRow::from_pairs((0..5).map(|i| (i, 0.2)).collect());
        assert_relative_eq!(compute_perplexity_sparse(&row), 5.0, epsilon = 1e-5);
    }

    #[test]
    fn test_vector_matrix_multiplication() {
        let b = sparse(&[&[(0, 0.3), (1, 0.7)], &[(0, 0.8), (1, 0.2)]]);
        let c = multiply(&[0.5, 0.5], &b);

        assert_relative_eq!(c[0], 0.55, epsilon = 1e-5);
        assert_relative_eq!(c[1], 0.45, epsilon = 1e-5);

        let b = sparse(&[&[(0, 0.5), (1, 0.25), (2, 0.25)], &[(1, 1.0)], &[(2, 1.0)]]);
        let mut c = multiply(&[1.0, 0.0, 0.0], &b);
        assert_relative_eq!(c[1], 0.25, epsilon = 1e-5);
        c = multiply(&c, &b);
        assert_relative_eq!(c[0], 0.25, epsilon = 1e-5);
        assert_relative_eq!(c[2], 0.375, epsilon = 1e-5);
        c = multiply(&c, &b);
        assert_relative_eq!(c[1], 0.4375, epsilon = 1e-5);
    }

    #[test]
    fn test_stationary_distribution_absorbing_pair() {
        let fmc = sparse(&[&[(0, 0.5), (1, 0.25), (2, 0.25)], &[(1, 1.0)], &[(2, 1.0)]]);
        let res = stationary_distribution_fmc(&[1.0 / 3.0; 3], &fmc, 1000);

        assert_relative_eq!(res[0], 0.0, epsilon = 1e-4);
        assert_relative_eq!(res[1], 0.5, epsilon = 1e-4);
        assert_relative_eq!(res[2], 0.5, epsilon = 1e-4);
    }

    #[test]
    fn test_stationary_distribution_chain() {
        let mut fmc: SparseMatrix<f32> = (0..8)
            .map(|i| SparseRow::from_pairs(vec![(i, 0.5), (i + 1, 0.3), (i + 2, 0.2)]))
            .collect();
        fmc.push(SparseRow::from_pairs(vec![(8, 0.5), (9, 0.5)]));
        fmc.push(SparseRow::from_pairs(vec![(9, 1.0)]));

        let res = stationary_distribution_fmc(&[0.1; 10], &fmc, 1000);

        for v in res.iter().take(9) {
            assert!(v.abs() < 1e-4);
        }
        assert_relative_eq!(res[9], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_compute_stationary_distribution_flushes() {
        let fmc = sparse(&[&[(0, 0.5), (1, 0.5)], &[(1, 1.0)]]);
        let mut distr = vec![1.0, 0.0];
        compute_stationary_distribution(&fmc, &mut distr, 10, 0.01);

        assert_eq!(distr[0], 0.0);
        assert_relative_eq!(distr[1], 1.0, epsilon = 0.01);
    }

    #[test]
    fn test_heterogeneity() {
        let fmc = sparse(&[&[(0, 1.0)], &[(0, 0.5), (1, 0.5)]]);
        let het = compute_heterogeneity(&fmc);

        assert_relative_eq!(het[0], 1.0);
        // mass below one walker is flushed, so state 1 drains completely
        assert_relative_eq!(het[1], 0.0);
    }
}
