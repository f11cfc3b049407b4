// ============================================================
// Layer 4 — Memory Sampler
// ============================================================
// When the memory bank has a fixed capacity only a few patches
// per training image can be admitted. The sampler picks them
// with a bias toward rare classes:
//
//   histogram[c]  = number of patches in the image containing c
//   score(patch)  = Σ histogram[c] over the patch's classes
//   score        *= U[0, 1)          (fresh draw per patch)
//   keep the `num_sampled_features` lowest scores
//
// A patch made only of common classes gets a high score and is
// rarely kept; the random factor lets different augmentation
// epochs admit different patches of similar rarity.

use std::cmp::Ordering;

use rand::Rng;

use crate::data::patchify::PatchGrid;
use crate::domain::error::{HbirdError, HbirdResult};

/// Score given to patches with no class at all, keeping them last.
pub const EMPTY_PATCH_SCORE: f32 = 1e6;

#[derive(Debug, Clone, Copy)]
pub struct MemorySampler {
    num_sampled_features: usize,
    num_classes:          usize,
}

impl MemorySampler {
    pub fn new(num_sampled_features: usize, num_classes: usize) -> Self {
        Self { num_sampled_features, num_classes }
    }

    /// Patches to keep per image so that a full construction run
    /// (`dataset_size` images × `augmentation_epoch` passes) fits
    /// into `memory_size` rows.
    pub fn num_sampled_for(
        memory_size:        usize,
        dataset_size:       usize,
        augmentation_epoch: usize,
    ) -> HbirdResult<usize> {
        let images = dataset_size * augmentation_epoch;
        if images == 0 {
            return Err(HbirdError::Precondition(
                "dataset size and augmentation epochs must be positive".into(),
            ));
        }
        let per_image = memory_size / images;
        if per_image == 0 {
            return Err(HbirdError::Precondition(format!(
                "memory size {memory_size} is smaller than the {images} images it must cover"
            )));
        }
        Ok(per_image)
    }

    pub fn num_sampled_features(&self) -> usize {
        self.num_sampled_features
    }

    /// How many patches of `image` contain each class.
    pub fn class_frequency(&self, grid: &PatchGrid, image: usize) -> HbirdResult<Vec<u32>> {
        let mut histogram = vec![0u32; self.num_classes];
        for patch in 0..grid.patches_per_image() {
            for class in grid.patch_classes(image, patch).iter() {
                let slot = histogram.get_mut(class).ok_or(HbirdError::InvalidLabel {
                    label:       class,
                    num_classes: self.num_classes,
                })?;
                *slot += 1;
            }
        }
        Ok(histogram)
    }

    /// Deterministic part of the score, plus which patches carry a class.
    pub fn patch_scores(
        &self,
        grid:      &PatchGrid,
        image:     usize,
        histogram: &[u32],
    ) -> (Vec<f32>, Vec<bool>) {
        let n = grid.patches_per_image();
        let mut scores   = Vec::with_capacity(n);
        let mut nonempty = Vec::with_capacity(n);

        for patch in 0..n {
            let classes = grid.patch_classes(image, patch);
            if classes.is_empty() {
                scores.push(EMPTY_PATCH_SCORE);
                nonempty.push(false);
            } else {
                let score: u32 = classes.iter().map(|c| histogram[c]).sum();
                scores.push(score as f32);
                nonempty.push(true);
            }
        }
        (scores, nonempty)
    }

    /// Grid indices of the patches admitted for every image of the batch,
    /// each list ordered by ascending randomized score.
    pub fn sample<R: Rng>(&self, grid: &PatchGrid, rng: &mut R) -> HbirdResult<Vec<Vec<usize>>> {
        let k = self.num_sampled_features;
        let mut selected = Vec::with_capacity(grid.batch());

        for image in 0..grid.batch() {
            let histogram = self.class_frequency(grid, image)?;
            let (mut scores, nonempty) = self.patch_scores(grid, image, &histogram);

            let available = nonempty.iter().filter(|&&x| x).count();
            if k > available {
                return Err(HbirdError::InsufficientPatches { requested: k, available });
            }

            for (score, &keep) in scores.iter_mut().zip(&nonempty) {
                if keep {
                    *score *= rng.gen::<f32>();
                }
            }

            selected.push(lowest_k(&scores, k));
        }

        tracing::trace!("Sampled {} patches from each of {} images", k, grid.batch());
        Ok(selected)
    }
}

/// Indices of the `k` smallest scores, ascending; ties go to the lower index.
fn lowest_k(scores: &[f32], k: usize) -> Vec<usize> {
    let by_score = |a: &usize, b: &usize| -> Ordering {
        scores[*a].total_cmp(&scores[*b]).then(a.cmp(b))
    };

    let mut order: Vec<usize> = (0..scores.len()).collect();
    if k == 0 {
        return Vec::new();
    }
    if k < order.len() {
        order.select_nth_unstable_by(k - 1, by_score);
        order.truncate(k);
    }
    order.sort_unstable_by(by_score);
    order
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::label_map::LabelMapBatch;
    use rand::{rngs::StdRng, SeedableRng};

    /// One row of ten 1x1 patches: nine of class 1, one of class 2.
    fn skewed_grid() -> PatchGrid {
        let mut data = vec![1u8; 10];
        data[6] = 2;
        let labels = LabelMapBatch::new(data, 1, 1, 10).unwrap();
        PatchGrid::from_labels(&labels, 1).unwrap()
    }

    #[test]
    fn test_num_sampled_for() {
        assert_eq!(MemorySampler::num_sampled_for(1000, 10, 2).unwrap(), 50);
        assert_eq!(MemorySampler::num_sampled_for(1001, 10, 2).unwrap(), 50);
        assert!(MemorySampler::num_sampled_for(5, 10, 1).is_err());
        assert!(MemorySampler::num_sampled_for(5, 0, 1).is_err());
    }

    #[test]
    fn test_histogram_counts_patches_not_pixels() {
        // 2x4 map, 2x2 patches: left patch mixes 0 and 3, right patch is all 3
        let labels = LabelMapBatch::new(vec![0, 3, 3, 3, 3, 3, 3, 3], 1, 2, 4).unwrap();
        let grid   = PatchGrid::from_labels(&labels, 2).unwrap();
        let s      = MemorySampler::new(1, 4);

        assert_eq!(s.class_frequency(&grid, 0).unwrap(), vec![1, 0, 0, 2]);

        let (scores, nonempty) = s.patch_scores(&grid, 0, &[1, 0, 0, 2]);
        assert_eq!(scores, vec![3.0, 2.0]);
        assert_eq!(nonempty, vec![true, true]);
    }

    #[test]
    fn test_sample_sizes_and_uniqueness() {
        let labels = LabelMapBatch::filled(1, 3, 8, 8);
        let grid   = PatchGrid::from_labels(&labels, 2).unwrap();
        let s      = MemorySampler::new(5, 2);
        let mut rng = StdRng::seed_from_u64(7);

        let picked = s.sample(&grid, &mut rng).unwrap();
        assert_eq!(picked.len(), 3);
        for indices in &picked {
            assert_eq!(indices.len(), 5);
            let mut sorted = indices.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), 5);
            assert!(indices.iter().all(|&i| i < 16));
        }
    }

    #[test]
    fn test_oversized_request_fails() {
        let grid = skewed_grid();
        let s    = MemorySampler::new(11, 3);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            s.sample(&grid, &mut rng),
            Err(HbirdError::InsufficientPatches { requested: 11, available: 10 })
        ));
    }

    #[test]
    fn test_rare_class_is_favoured() {
        let grid   = skewed_grid();
        let s      = MemorySampler::new(1, 3);
        let mut rng = StdRng::seed_from_u64(1234);
        let trials = 2000;

        let mut rare_hits = 0usize;
        for _ in 0..trials {
            let picked = s.sample(&grid, &mut rng).unwrap();
            if picked[0][0] == 6 {
                rare_hits += 1;
            }
        }

        // A uniform sampler would pick the class-2 patch 10% of the time.
        let rate = rare_hits as f64 / trials as f64;
        assert!(rate > 0.3, "rare class picked at rate {rate}");
    }

    #[test]
    fn test_lowest_k_orders_ascending() {
        let scores = [5.0, 1.0, 3.0, 1.0, 0.5];
        assert_eq!(lowest_k(&scores, 3), vec![4, 1, 3]);
        assert_eq!(lowest_k(&scores, 5), vec![4, 1, 3, 2, 0]);
        assert!(lowest_k(&scores, 0).is_empty());
    }
}
