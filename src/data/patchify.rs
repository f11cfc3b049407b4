// ============================================================
// Layer 4 — Patch Label Encoder
// ============================================================
// Turns per-pixel ground truth into per-patch soft labels,
// the label half of every memory-bank row.
//
//   label map [B, H, W]
//       │  split into non-overlapping P×P blocks
//       ▼
//   PatchGrid [B, H/P, W/P, P*P]
//       │  one-hot every pixel, average inside the block
//       ▼
//   soft labels [B, H/P, W/P, C]
//
// Pixels inside a patch are stored row-major so the grid can
// be inspected without going back to the label map.

use crate::domain::error::{HbirdError, HbirdResult};
use crate::domain::label_map::LabelMapBatch;

/// Label map regrouped by patch.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchGrid {
    data:       Vec<u8>,
    batch:      usize,
    rows:       usize,
    cols:       usize,
    patch_size: usize,
}

impl PatchGrid {
    /// Regroup `labels` into P×P patches.
    ///
    /// Height and width must both be divisible by `patch_size`.
    pub fn from_labels(labels: &LabelMapBatch, patch_size: usize) -> HbirdResult<Self> {
        if patch_size == 0 {
            return Err(HbirdError::InvalidShape("patch size must be positive".into()));
        }
        if labels.height % patch_size != 0 || labels.width % patch_size != 0 {
            return Err(HbirdError::InvalidShape(format!(
                "label map {}x{} is not divisible into {patch_size}x{patch_size} patches",
                labels.height, labels.width
            )));
        }

        let rows  = labels.height / patch_size;
        let cols  = labels.width / patch_size;
        let area  = patch_size * patch_size;
        let mut data = Vec::with_capacity(labels.data.len());

        for b in 0..labels.batch {
            for r in 0..rows {
                for c in 0..cols {
                    for py in 0..patch_size {
                        let y = r * patch_size + py;
                        let start = (b * labels.height + y) * labels.width + c * patch_size;
                        data.extend_from_slice(&labels.data[start..start + patch_size]);
                    }
                }
            }
        }
        debug_assert_eq!(data.len(), labels.batch * rows * cols * area);

        Ok(Self { data, batch: labels.batch, rows, cols, patch_size })
    }

    pub fn batch(&self) -> usize { self.batch }

    pub fn rows(&self) -> usize { self.rows }

    pub fn cols(&self) -> usize { self.cols }

    /// Patches per image (rows × cols).
    pub fn patches_per_image(&self) -> usize { self.rows * self.cols }

    pub fn patch_area(&self) -> usize { self.patch_size * self.patch_size }

    /// Pixel classes of one patch, `patch` being the flat row-major
    /// index into the image's grid.
    pub fn patch(&self, image: usize, patch: usize) -> &[u8] {
        let area  = self.patch_area();
        let start = (image * self.patches_per_image() + patch) * area;
        &self.data[start..start + area]
    }

    /// Distinct classes present in one patch.
    pub fn patch_classes(&self, image: usize, patch: usize) -> ClassSet {
        let mut set = ClassSet::default();
        for &label in self.patch(image, patch) {
            set.insert(label);
        }
        set
    }

    /// Per-patch class fractions, laid out `[batch, rows, cols, num_classes]`.
    pub fn soft_labels(&self, num_classes: usize) -> HbirdResult<Vec<f32>> {
        let area   = self.patch_area();
        let scale  = 1.0 / area as f32;
        let total  = self.batch * self.patches_per_image();
        let mut out = vec![0.0f32; total * num_classes];

        for (p, pixels) in self.data.chunks_exact(area).enumerate() {
            let row = &mut out[p * num_classes..(p + 1) * num_classes];
            for &label in pixels {
                let label = label as usize;
                if label >= num_classes {
                    return Err(HbirdError::InvalidLabel { label, num_classes });
                }
                row[label] += 1.0;
            }
            for v in row.iter_mut() {
                *v *= scale;
            }
        }
        Ok(out)
    }
}

/// Fixed 256-slot membership table for u8 class ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassSet([u64; 4]);

impl ClassSet {
    #[inline]
    pub fn insert(&mut self, class: u8) {
        self.0[(class >> 6) as usize] |= 1u64 << (class & 63);
    }

    #[inline]
    pub fn contains(&self, class: u8) -> bool {
        self.0[(class >> 6) as usize] & (1u64 << (class & 63)) != 0
    }

    pub fn len(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    /// Classes in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(word, &bits)| {
            (0..64usize).filter(move |&bit| bits & (1u64 << bit) != 0).map(move |bit| word * 64 + bit)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_map_gives_one_hot_patches() {
        let labels = LabelMapBatch::filled(3, 2, 8, 8);
        let grid   = PatchGrid::from_labels(&labels, 4).unwrap();
        let soft   = grid.soft_labels(5).unwrap();

        assert_eq!(soft.len(), 2 * 2 * 2 * 5);
        for row in soft.chunks_exact(5) {
            assert_eq!(row, &[0.0, 0.0, 0.0, 1.0, 0.0]);
        }
    }

    #[test]
    fn test_patch_order_is_row_major() {
        // 4x4 map, 2x2 patches: top-left 0, top-right 1, bottom-left 2, bottom-right 3
        #[rustfmt::skip]
        let data = vec![
            0, 0, 1, 1,
            0, 0, 1, 1,
            2, 2, 3, 3,
            2, 2, 3, 3,
        ];
        let labels = LabelMapBatch::new(data, 1, 4, 4).unwrap();
        let grid   = PatchGrid::from_labels(&labels, 2).unwrap();

        assert_eq!(grid.rows(), 2);
        assert_eq!(grid.cols(), 2);
        for p in 0..4 {
            assert!(grid.patch(0, p).iter().all(|&v| v as usize == p));
        }
    }

    #[test]
    fn test_mixed_patch_fractions() {
        let labels = LabelMapBatch::new(vec![0, 1, 1, 1], 1, 2, 2).unwrap();
        let grid   = PatchGrid::from_labels(&labels, 2).unwrap();
        let soft   = grid.soft_labels(3).unwrap();
        assert_eq!(soft, vec![0.25, 0.75, 0.0]);

        let classes: Vec<usize> = grid.patch_classes(0, 0).iter().collect();
        assert_eq!(classes, vec![0, 1]);
    }

    #[test]
    fn test_rectangular_map() {
        let labels = LabelMapBatch::filled(1, 1, 4, 8);
        let grid   = PatchGrid::from_labels(&labels, 4).unwrap();
        assert_eq!((grid.rows(), grid.cols()), (1, 2));
        assert_eq!(grid.patches_per_image(), 2);
    }

    #[test]
    fn test_indivisible_size_is_rejected() {
        let labels = LabelMapBatch::filled(0, 1, 6, 6);
        assert!(matches!(
            PatchGrid::from_labels(&labels, 4),
            Err(HbirdError::InvalidShape(_))
        ));
        assert!(PatchGrid::from_labels(&labels, 0).is_err());
    }

    #[test]
    fn test_label_beyond_classes_is_rejected() {
        let labels = LabelMapBatch::filled(9, 1, 2, 2);
        let grid   = PatchGrid::from_labels(&labels, 2).unwrap();
        assert!(matches!(
            grid.soft_labels(4),
            Err(HbirdError::InvalidLabel { label: 9, num_classes: 4 })
        ));
    }

    #[test]
    fn test_class_set_membership() {
        let mut set = ClassSet::default();
        assert!(set.is_empty());
        set.insert(0);
        set.insert(200);
        set.insert(200);
        assert_eq!(set.len(), 2);
        assert!(set.contains(200));
        assert!(!set.contains(1));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 200]);
    }
}
