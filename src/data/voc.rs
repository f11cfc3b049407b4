// ============================================================
// Layer 4 — Pascal VOC Data Module
// ============================================================
// Reads the augmented Pascal VOC 2012 segmentation layout:
//
//   <data_dir>/
//     ImageSets/Segmentation/trainaug.txt   ← one id per line
//     ImageSets/Segmentation/val.txt
//     JPEGImages/<id>.jpg                   ← RGB image
//     SegmentationClassAug/<id>.png         ← 8-bit class ids,
//                                              255 = ignore
//
// 21 classes (background + 20 objects). Samples are decoded
// and transformed only when their batch is pulled.
//
// The training split is limited with a PartialDataset and
// reshuffled every augmentation epoch with a ShuffledDataset.
// Each sample draws its crop/flip from an RNG seeded by
// (seed, epoch, position in the split), so a run is
// reproducible.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::data::dataset::transform::{Mapper, MapperDataset, PartialDataset, ShuffledDataset};
use burn::data::dataset::Dataset;
use rand::{rngs::StdRng, SeedableRng};

use crate::data::batcher::segmentation_loader;
use crate::data::dataset::{SampleLoad, SegmentationSample};
use crate::data::transforms::SegmentationTransform;
use crate::domain::error::{HbirdError, HbirdResult, LoadFailure};
use crate::domain::traits::{SegmentationLoader, SegmentationSource};

pub const VOC_NUM_CLASSES: usize = 21;

#[derive(Debug, Clone)]
pub struct VocConfig {
    pub data_dir:          PathBuf,
    pub input_size:        u32,
    pub batch_size:        usize,
    /// Keep only the first N training ids.
    pub num_train_samples: Option<usize>,
    pub seed:              u64,
    pub train_split:       String,
    pub val_split:         String,
}

impl VocConfig {
    pub fn new(data_dir: impl Into<PathBuf>, input_size: u32, batch_size: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            input_size,
            batch_size,
            num_train_samples: None,
            seed:              42,
            train_split:       "trainaug".into(),
            val_split:         "val".into(),
        }
    }
}

/// Paths of one VOC sample.
#[derive(Debug, Clone, PartialEq)]
pub struct VocRecord {
    pub id:         String,
    /// Line number in the split list (blank lines skipped).
    pub position:   usize,
    pub image_path: PathBuf,
    pub mask_path:  PathBuf,
}

/// The records listed in one `ImageSets/Segmentation/<split>.txt`.
pub struct VocSplit {
    records: Vec<VocRecord>,
}

impl VocSplit {
    pub fn read(root: &Path, split: &str) -> HbirdResult<Self> {
        let list = root.join("ImageSets").join("Segmentation").join(format!("{split}.txt"));
        let text = fs::read_to_string(&list).map_err(|e| HbirdError::io(&list, e))?;

        let records = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .enumerate()
            .map(|(position, id)| VocRecord {
                id:         id.to_string(),
                position,
                image_path: root.join("JPEGImages").join(format!("{id}.jpg")),
                mask_path:  root.join("SegmentationClassAug").join(format!("{id}.png")),
            })
            .collect();
        Ok(Self { records })
    }
}

impl Dataset<VocRecord> for VocSplit {
    fn get(&self, index: usize) -> Option<VocRecord> {
        self.records.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Decodes a record and applies the split's transform.
#[derive(Debug, Clone, Copy)]
pub struct VocDecoder {
    transform: SegmentationTransform,
    seed:      u64,
}

impl VocDecoder {
    fn decode(&self, record: &VocRecord) -> HbirdResult<SegmentationSample> {
        let image = image::open(&record.image_path)
            .map_err(|e| HbirdError::Artifact(format!("cannot decode '{}': {e}", record.image_path.display())))?
            .to_rgb8();
        let mask = image::open(&record.mask_path)
            .map_err(|e| HbirdError::Artifact(format!("cannot decode '{}': {e}", record.mask_path.display())))?
            .to_luma8();

        let mut rng = StdRng::seed_from_u64(self.seed ^ record.position as u64);
        self.transform.apply(image, mask, &mut rng)
    }
}

impl Mapper<VocRecord, SampleLoad> for VocDecoder {
    fn map(&self, record: &VocRecord) -> SampleLoad {
        self.decode(record).map_err(LoadFailure::from)
    }
}

type TrainRecords = PartialDataset<VocSplit, VocRecord>;

pub struct PascalVocDataModule {
    config: VocConfig,
    train:  Arc<TrainRecords>,
    val:    Arc<VocSplit>,
}

impl PascalVocDataModule {
    pub fn setup(config: VocConfig) -> HbirdResult<Self> {
        if config.batch_size == 0 {
            return Err(HbirdError::Precondition("batch size must be positive".into()));
        }
        let train = VocSplit::read(&config.data_dir, &config.train_split)?;
        let val   = VocSplit::read(&config.data_dir, &config.val_split)?;
        let keep  = config.num_train_samples.map_or(train.len(), |n| n.min(train.len()));
        let train = PartialDataset::new(train, 0, keep);

        tracing::info!(
            "Pascal VOC at '{}': {} train ({}), {} val ({})",
            config.data_dir.display(),
            train.len(),
            config.train_split,
            val.len(),
            config.val_split
        );
        Ok(Self { config, train: Arc::new(train), val: Arc::new(val) })
    }
}

impl SegmentationSource for PascalVocDataModule {
    fn train_dataset_size(&self) -> usize { self.train.len() }

    fn num_classes(&self) -> usize { VOC_NUM_CLASSES }

    fn train_loader(&self, epoch: usize) -> HbirdResult<SegmentationLoader> {
        let epoch_seed = self.config.seed ^ ((epoch as u64) << 32);
        let decoder = VocDecoder {
            transform: SegmentationTransform::train(self.config.input_size),
            seed:      epoch_seed,
        };
        let samples  = MapperDataset::new(Arc::clone(&self.train), decoder);
        let shuffled = ShuffledDataset::with_seed(samples, epoch_seed);
        Ok(segmentation_loader(shuffled, self.config.batch_size))
    }

    fn val_loader(&self) -> HbirdResult<SegmentationLoader> {
        let decoder = VocDecoder { transform: SegmentationTransform::val(self.config.input_size), seed: 0 };
        Ok(segmentation_loader(MapperDataset::new(Arc::clone(&self.val), decoder), self.config.batch_size))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::testing::write_voc;

    #[test]
    fn test_setup_reads_splits_and_prefix() {
        let dir = tempfile::tempdir().unwrap();
        write_voc(dir.path(), &["a", "b", "c"], &["d"]);

        let mut config = VocConfig::new(dir.path(), 8, 2);
        config.num_train_samples = Some(2);
        let voc = PascalVocDataModule::setup(config).unwrap();
        assert_eq!(voc.train_dataset_size(), 2);
        assert_eq!(voc.num_classes(), 21);
        assert_eq!(voc.val.len(), 1);
        let second = voc.train.get(1).unwrap();
        assert_eq!((second.id.as_str(), second.position), ("b", 1));
        assert!(voc.train.get(2).is_none());
    }

    #[test]
    fn test_val_batches_keep_mask_ids() {
        let dir = tempfile::tempdir().unwrap();
        write_voc(dir.path(), &["a"], &["v1", "v2", "v3"]);
        let voc = PascalVocDataModule::setup(VocConfig::new(dir.path(), 8, 2)).unwrap();

        let batches: Vec<_> = voc.val_loader().unwrap().iter().map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].image_shape(), [2, 3, 8, 8]);

        let labels = &batches[0].labels;
        assert_eq!(labels.pixel(0, 0, 3), 255);
        assert_eq!(labels.pixel(0, 5, 1), 0);
        assert_eq!(labels.pixel(1, 5, 6), 15);
    }

    #[test]
    fn test_train_epochs_are_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        write_voc(dir.path(), &["a", "b", "c", "d"], &["v"]);
        let voc = PascalVocDataModule::setup(VocConfig::new(dir.path(), 4, 4)).unwrap();

        let first: Vec<_>  = voc.train_loader(1).unwrap().iter().map(|b| b.unwrap().labels.data).collect();
        let second: Vec<_> = voc.train_loader(1).unwrap().iter().map(|b| b.unwrap().labels.data).collect();
        assert_eq!(first, second);
        assert_eq!(first[0].len(), 4 * 16);
    }

    #[test]
    fn test_train_sample_limit_larger_than_split() {
        let dir = tempfile::tempdir().unwrap();
        write_voc(dir.path(), &["a", "b"], &["v"]);
        let mut config = VocConfig::new(dir.path(), 8, 4);
        config.num_train_samples = Some(10);
        let voc = PascalVocDataModule::setup(config).unwrap();
        assert_eq!(voc.train_dataset_size(), 2);
        assert_eq!(voc.train_loader(0).unwrap().iter().count(), 1);
    }

    #[test]
    fn test_unreadable_image_fails_its_batch() {
        let dir = tempfile::tempdir().unwrap();
        write_voc(dir.path(), &["a"], &["v1", "v2"]);
        std::fs::write(dir.path().join("JPEGImages").join("v2.jpg"), b"not a jpeg").unwrap();
        let voc = PascalVocDataModule::setup(VocConfig::new(dir.path(), 8, 1)).unwrap();

        let batches: Vec<_> = voc.val_loader().unwrap().iter().collect();
        assert!(batches[0].is_ok());
        let failure = batches[1].clone().unwrap_err();
        assert!(failure.0.contains("v2.jpg"), "{failure}");
    }

    #[test]
    fn test_missing_split_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            PascalVocDataModule::setup(VocConfig::new(dir.path(), 8, 1)),
            Err(HbirdError::Io { .. })
        ));
    }
}
