// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The evaluator talks to its collaborators through these
// traits only:
//   - SegmentationSource → PascalVocDataModule, InMemorySegmentation
//   - SegmentationMetric → ConfusionMatrixIoU
//
// The feature extractor trait needs tensor types, so it lives
// in the ML layer (ml::extractor) instead of here.
//
// Sources hand out Burn data loaders. Batches stay host-side
// plain data, so the loader backend is only nominal.

use std::sync::Arc;

use burn::data::dataloader::DataLoader;
use serde::{Deserialize, Serialize};

use crate::domain::error::{HbirdResult, LoadFailure};
use crate::domain::label_map::SegmentationBatch;

/// Backend the loaders are parameterized over.
pub type LoaderBackend = burn::backend::NdArray;

/// One loader item; a failed sample fails its whole batch.
pub type BatchLoad = Result<SegmentationBatch, LoadFailure>;

pub type SegmentationLoader = Arc<dyn DataLoader<LoaderBackend, BatchLoad>>;

// ─── SegmentationSource ──────────────────────────────────────────────────────
/// Any dataset that can feed the memory-creation and evaluation loops.
pub trait SegmentationSource {
    /// Number of training images (one augmentation epoch).
    fn train_dataset_size(&self) -> usize;

    fn num_classes(&self) -> usize;

    /// Training loader for one augmentation epoch. `epoch` lets the
    /// source reshuffle and redraw augmentations per pass.
    fn train_loader(&self, epoch: usize) -> HbirdResult<SegmentationLoader>;

    /// Evaluation loader, unaugmented and in a fixed order.
    fn val_loader(&self) -> HbirdResult<SegmentationLoader>;
}

// ─── SegmentationMetric ──────────────────────────────────────────────────────
/// Accumulates prediction statistics over an evaluation run.
pub trait SegmentationMetric {
    /// Add one set of valid (already ignore-masked) pixels.
    /// Both slices hold class indices and must be the same length.
    fn update(&mut self, ground_truth: &[usize], predicted: &[usize]) -> HbirdResult<()>;

    fn compute(&self) -> MetricReport;
}

/// Global statistics returned at the end of an evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    /// Per-class intersection over union. NaN where a class never
    /// appears in either the ground truth or the prediction.
    pub jaccard: Vec<f64>,
    pub tp: Vec<u64>,
    pub fp: Vec<u64>,
    pub fn_: Vec<u64>,
    /// `matched_clusters[c]` is the predicted id scored as class `c`.
    pub matched_clusters: Vec<usize>,
    /// Mean Jaccard over classes with a non-empty union.
    pub mean_iou: f64,
}
