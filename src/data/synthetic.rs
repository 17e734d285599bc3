use faer::Mat;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

/// Generate isotropic Gaussian blobs laid out on a regular grid
///
/// Cluster centres occupy the first two dimensions on a square grid with
/// `spacing` between neighbouring centres; further dimensions are pure noise.
///
/// ### Params
///
/// * `n_per_cluster` - Points per cluster
/// * `n_clusters` - Number of clusters
/// * `dim` - Dimensionality of the data (>= 1)
/// * `spacing` - Distance between neighbouring centres
/// * `cluster_std` - Standard deviation within clusters
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// `(data, labels)` with data of shape `(n_per_cluster * n_clusters, dim)`
pub fn generate_gaussian_blobs(
    n_per_cluster: usize,
    n_clusters: usize,
    dim: usize,
    spacing: f64,
    cluster_std: f64,
    seed: u64,
) -> (Mat<f64>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let n_samples = n_per_cluster * n_clusters;
    let grid_width = (n_clusters as f64).sqrt().ceil().max(1.0) as usize;

    let centres: Vec<Vec<f64>> = (0..n_clusters)
        .map(|c| {
            (0..dim)
                .map(|j| match j {
                    0 => (c % grid_width) as f64 * spacing,
                    1 => (c / grid_width) as f64 * spacing,
                    _ => 0.0,
                })
                .collect()
        })
        .collect();

    let labels: Vec<usize> = (0..n_samples).map(|i| i / n_per_cluster.max(1)).collect();

    let mut data = Mat::<f64>::zeros(n_samples, dim);
    for (i, &label) in labels.iter().enumerate() {
        for j in 0..dim {
            let noise: f64 = StandardNormal.sample(&mut rng);
            data[(i, j)] = centres[label][j] + noise * cluster_std;
        }
    }

    (data, labels)
}

/// Generate clusters with random centres, sizes and spreads
///
/// ### Params
///
/// * `n_samples` - Number of samples
/// * `dim` - Dimensionality
/// * `n_clusters` - Number of distinct clusters
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// `(data, labels)` with data of shape `(n_samples, dim)`
pub fn generate_clustered_data(
    n_samples: usize,
    dim: usize,
    n_clusters: usize,
    seed: u64,
) -> (Mat<f64>, Vec<usize>) {
    use rand::Rng;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Mat::<f64>::zeros(n_samples, dim);

    let centres: Vec<Vec<f64>> = (0..n_clusters)
        .map(|_| (0..dim).map(|_| rng.random_range(-15.0..15.0)).collect())
        .collect();
    let spreads: Vec<f64> = (0..n_clusters)
        .map(|_| rng.random_range(0.5..1.5))
        .collect();

    let mut labels: Vec<usize> = (0..n_samples).map(|i| i % n_clusters.max(1)).collect();
    labels.shuffle(&mut rng);

    for (i, &label) in labels.iter().enumerate() {
        for j in 0..dim {
            let noise: f64 = StandardNormal.sample(&mut rng);
            data[(i, j)] = centres[label][j] + noise * spreads[label];
        }
    }

    (data, labels)
}
