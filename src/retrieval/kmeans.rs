//! Lloyd's k-means over flat row-major matrices.
//!
//! Two flavours are needed by the index: spherical k-means partitions the
//! normalized dataset into leaves (assignment by largest inner product,
//! unit-length centroids), plain squared-L2 k-means trains the per-block
//! product-quantization codebooks.

use rand::Rng;
use rayon::prelude::*;

use crate::domain::error::{HbirdError, HbirdResult};
use crate::retrieval::vector::{dot, normalize, squared_l2};

/// How rows are assigned to centroids and how centroids are updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KMeansMetric {
    /// Maximize inner product, keep centroids on the unit sphere.
    Spherical,
    /// Minimize squared distance, centroids are plain means.
    SquaredL2,
}

/// Training parameters for one k-means run.
///
/// Empty clusters restart from a random row, so `train` always
/// returns `k` centroids.
#[derive(Debug, Clone, Copy)]
pub struct KMeans {
    pub k:          usize,
    pub iterations: usize,
    pub metric:     KMeansMetric,
}

impl KMeans {
    pub fn new(k: usize, iterations: usize, metric: KMeansMetric) -> Self {
        Self { k, iterations, metric }
    }

    /// Train `k` centroids on `data` (`dim`-wide rows). Returns them flattened.
    pub fn train<R: Rng>(&self, data: &[f32], dim: usize, rng: &mut R) -> HbirdResult<Vec<f32>> {
        let n = data.len() / dim;
        if self.k == 0 || self.k > n {
            return Err(HbirdError::IndexBuild(format!(
                "k-means needs 1..={n} clusters, got {}",
                self.k
            )));
        }

        let mut centroids = self.seed_centroids(data, dim, rng);

        let mut assignment = vec![usize::MAX; n];
        for iteration in 0..self.iterations {
            let next = assign(&centroids, data, dim, self.metric);
            let changed = next.iter().zip(&assignment).filter(|(a, b)| a != b).count();
            assignment = next;

            self.update(&mut centroids, data, dim, &assignment, rng);

            tracing::trace!("k-means iteration {}: {} reassignments", iteration, changed);
            if changed == 0 {
                break;
            }
        }
        Ok(centroids)
    }

    /// k-means++ seeding: each new centroid is drawn with probability
    /// proportional to its distance from the closest centroid so far.
    fn seed_centroids<R: Rng>(&self, data: &[f32], dim: usize, rng: &mut R) -> Vec<f32> {
        let n = data.len() / dim;
        let mut centroids = Vec::with_capacity(self.k * dim);
        let first = rng.gen_range(0..n);
        centroids.extend_from_slice(&data[first * dim..(first + 1) * dim]);

        let mut dists: Vec<f32> = data
            .par_chunks_exact(dim)
            .map(|row| self.distance(&centroids[..dim], row))
            .collect();

        while centroids.len() < self.k * dim {
            let total: f64 = dists.iter().map(|&d| d as f64).sum();
            let pick = if total > 0.0 {
                let mut target = rng.gen::<f64>() * total;
                let mut chosen = n - 1;
                for (i, &d) in dists.iter().enumerate() {
                    target -= d as f64;
                    if target <= 0.0 {
                        chosen = i;
                        break;
                    }
                }
                chosen
            } else {
                rng.gen_range(0..n)
            };

            let start = centroids.len();
            centroids.extend_from_slice(&data[pick * dim..(pick + 1) * dim]);
            let newest = &centroids[start..start + dim];
            dists
                .par_iter_mut()
                .zip(data.par_chunks_exact(dim))
                .for_each(|(d, row)| *d = d.min(self.distance(newest, row)));
        }

        if self.metric == KMeansMetric::Spherical {
            centroids.chunks_exact_mut(dim).for_each(normalize);
        }
        centroids
    }

    #[inline]
    fn distance(&self, centroid: &[f32], row: &[f32]) -> f32 {
        match self.metric {
            KMeansMetric::Spherical => (1.0 - dot(centroid, row)).max(0.0),
            KMeansMetric::SquaredL2 => squared_l2(centroid, row),
        }
    }

    fn update<R: Rng>(
        &self,
        centroids:  &mut [f32],
        data:       &[f32],
        dim:        usize,
        assignment: &[usize],
        rng:        &mut R,
    ) {
        let n = assignment.len();
        let mut sums   = vec![0.0f32; self.k * dim];
        let mut counts = vec![0usize; self.k];
        for (row, &cluster) in data.chunks_exact(dim).zip(assignment) {
            counts[cluster] += 1;
            for (s, &x) in sums[cluster * dim..(cluster + 1) * dim].iter_mut().zip(row) {
                *s += x;
            }
        }

        for (cluster, centroid) in centroids.chunks_exact_mut(dim).enumerate() {
            if counts[cluster] == 0 {
                // Empty cluster: restart it from a random row.
                let row = rng.gen_range(0..n);
                centroid.copy_from_slice(&data[row * dim..(row + 1) * dim]);
            } else {
                let inv = 1.0 / counts[cluster] as f32;
                for (c, &s) in centroid.iter_mut().zip(&sums[cluster * dim..(cluster + 1) * dim]) {
                    *c = s * inv;
                }
            }
            if self.metric == KMeansMetric::Spherical {
                normalize(centroid);
            }
        }
    }
}

/// Closest centroid for every row of `data`.
pub fn assign(centroids: &[f32], data: &[f32], dim: usize, metric: KMeansMetric) -> Vec<usize> {
    data.par_chunks_exact(dim)
        .map(|row| nearest(centroids, row, dim, metric))
        .collect()
}

/// Index of the centroid closest to `row` under `metric`.
pub fn nearest(centroids: &[f32], row: &[f32], dim: usize, metric: KMeansMetric) -> usize {
    let mut best       = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, c) in centroids.chunks_exact(dim).enumerate() {
        let score = match metric {
            KMeansMetric::Spherical => dot(c, row),
            KMeansMetric::SquaredL2 => -squared_l2(c, row),
        };
        if score > best_score {
            best       = i;
            best_score = score;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn two_blobs() -> Vec<f32> {
        let mut data = Vec::new();
        for i in 0..20 {
            let jitter = i as f32 * 0.001;
            data.extend_from_slice(&[10.0 + jitter, 10.0 - jitter]);
            data.extend_from_slice(&[-10.0 - jitter, -10.0 + jitter]);
        }
        data
    }

    #[test]
    fn test_l2_separates_blobs() {
        let data = two_blobs();
        let mut rng = StdRng::seed_from_u64(3);
        let centroids = KMeans::new(2, 20, KMeansMetric::SquaredL2)
            .train(&data, 2, &mut rng)
            .unwrap();

        let labels = assign(&centroids, &data, 2, KMeansMetric::SquaredL2);
        // Alternating rows belong to alternating blobs.
        for pair in labels.chunks_exact(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert!(labels.iter().step_by(2).all(|&l| l == labels[0]));
    }

    #[test]
    fn test_spherical_centroids_are_unit() {
        let data = two_blobs();
        let mut rng = StdRng::seed_from_u64(5);
        let centroids = KMeans::new(2, 10, KMeansMetric::Spherical)
            .train(&data, 2, &mut rng)
            .unwrap();
        for c in centroids.chunks_exact(2) {
            assert!((dot(c, c) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_too_many_clusters() {
        let mut rng = StdRng::seed_from_u64(0);
        let r = KMeans::new(3, 5, KMeansMetric::SquaredL2).train(&[0.0, 1.0], 1, &mut rng);
        assert!(r.is_err());
    }
}
