// ============================================================
// Layer 4 — Segmentation Batcher
// ============================================================
// Implements Burn's Batcher trait for segmentation samples and
// builds the data loaders every source hands out.
//
// How batching works here:
//   Input:  N samples, each image [3, H, W] and label [H, W]
//   Output: images [N, 3, H, W] and labels [N, H, W]
//
//   Sample buffers are appended one after another, so the
//   flat layout is already batch-major:
//   [s1_c1..., s1_c3..., s2_c1..., ..., sN_c3...]
//
// Every sample must share the same H×W; the transforms make
// sure of that before samples reach the batcher.
//
// Batches are plain host data. The evaluator uploads them to
// whatever backend it runs on, so the device handed to
// `batch` is not used.
//
// Reference: Burn Book §4.2 (Batcher)

use burn::data::dataloader::{batcher::Batcher, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::tensor::backend::Backend;

use crate::data::dataset::{SampleLoad, SegmentationSample};
use crate::domain::error::{HbirdError, HbirdResult, LoadFailure};
use crate::domain::label_map::{LabelMapBatch, SegmentationBatch};
use crate::domain::traits::{BatchLoad, SegmentationLoader};

/// Stack samples of equal size into a batch.
pub fn collate(items: Vec<SegmentationSample>) -> HbirdResult<SegmentationBatch> {
    let first = items
        .first()
        .ok_or_else(|| HbirdError::InvalidShape("cannot collate an empty batch".into()))?;
    let (height, width) = (first.height, first.width);
    let batch_size      = items.len();

    let mut images = Vec::with_capacity(batch_size * first.image.len());
    let mut labels = Vec::with_capacity(batch_size * height * width);
    for item in items {
        if (item.height, item.width) != (height, width) {
            return Err(HbirdError::shape(
                format!("{height}x{width} samples"),
                format!("{}x{}", item.height, item.width),
            ));
        }
        images.extend(item.image);
        labels.extend(item.label);
    }

    SegmentationBatch::new(images, LabelMapBatch::new(labels, batch_size, height, width)?)
}

#[derive(Clone, Debug, Default)]
pub struct SegmentationBatcher;

impl<B: Backend> Batcher<B, SampleLoad, BatchLoad> for SegmentationBatcher {
    fn batch(&self, items: Vec<SampleLoad>, _device: &B::Device) -> BatchLoad {
        let samples = items.into_iter().collect::<Result<Vec<_>, LoadFailure>>()?;
        collate(samples).map_err(LoadFailure::from)
    }
}

/// Sequential loader over `dataset` in chunks of `batch_size`.
///
/// The last batch may be shorter. Samples are decoded when their
/// batch is pulled, in dataset order.
pub fn segmentation_loader<D>(dataset: D, batch_size: usize) -> SegmentationLoader
where
    D: Dataset<SampleLoad> + 'static,
{
    DataLoaderBuilder::new(SegmentationBatcher)
        .batch_size(batch_size.max(1))
        .build(dataset)
}
