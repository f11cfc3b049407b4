use std::sync::Arc;

use burn::data::dataset::Dataset;

use crate::data::batcher::segmentation_loader;
use crate::domain::error::{HbirdError, HbirdResult, LoadFailure};
use crate::domain::label_map::IMAGE_CHANNELS;
use crate::domain::traits::{SegmentationLoader, SegmentationSource};

/// Item type of every sample dataset fed to a loader.
pub type SampleLoad = Result<SegmentationSample, LoadFailure>;

/// One image and its label map, both at the model input size.
/// Image layout is CHW, already normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationSample {
    pub image:  Vec<f32>,
    pub label:  Vec<u8>,
    pub height: usize,
    pub width:  usize,
}

impl SegmentationSample {
    pub fn new(image: Vec<f32>, label: Vec<u8>, height: usize, width: usize) -> HbirdResult<Self> {
        let pixels = height * width;
        if label.len() != pixels || image.len() != IMAGE_CHANNELS * pixels {
            return Err(HbirdError::shape(
                format!("{} image values and {pixels} labels for {height}x{width}", IMAGE_CHANNELS * pixels),
                format!("{} image values and {} labels", image.len(), label.len()),
            ));
        }
        Ok(Self { image, label, height, width })
    }
}

/// Vec-backed split.
pub struct SampleDataset {
    samples: Vec<SegmentationSample>,
}

impl SampleDataset {
    pub fn new(samples: Vec<SegmentationSample>) -> Self { Self { samples } }
}

impl Dataset<SampleLoad> for SampleDataset {
    fn get(&self, index: usize) -> Option<SampleLoad> {
        self.samples.get(index).cloned().map(Ok)
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Train and validation splits held in memory, served in order.
pub struct InMemorySegmentation {
    train:       Arc<SampleDataset>,
    val:         Arc<SampleDataset>,
    batch_size:  usize,
    num_classes: usize,
}

impl InMemorySegmentation {
    pub fn new(
        train:       Vec<SegmentationSample>,
        val:         Vec<SegmentationSample>,
        batch_size:  usize,
        num_classes: usize,
    ) -> HbirdResult<Self> {
        if batch_size == 0 {
            return Err(HbirdError::Precondition("batch size must be positive".into()));
        }
        Ok(Self {
            train: Arc::new(SampleDataset::new(train)),
            val:   Arc::new(SampleDataset::new(val)),
            batch_size,
            num_classes,
        })
    }
}

impl SegmentationSource for InMemorySegmentation {
    fn train_dataset_size(&self) -> usize { self.train.len() }

    fn num_classes(&self) -> usize { self.num_classes }

    fn train_loader(&self, _epoch: usize) -> HbirdResult<SegmentationLoader> {
        Ok(segmentation_loader(Arc::clone(&self.train), self.batch_size))
    }

    fn val_loader(&self) -> HbirdResult<SegmentationLoader> {
        Ok(segmentation_loader(Arc::clone(&self.val), self.batch_size))
    }
}
