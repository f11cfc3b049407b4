// ============================================================
// Layer 2 — EvalUseCase
// ============================================================
// Orchestrates one Hummingbird evaluation run in order:
//
//   Step 1: Validate the configuration     (Layer 2)
//   Step 2: Open the dataset               (Layer 4 - data)
//   Step 3: Pick the device / backend      (Layer 6 - ml)
//   Step 4: Build the feature extractor    (Layer 6 - ml)
//   Step 5: Load or create the memory bank (Layer 6 + 7)
//   Step 6: Load or build the index        (Layer 5 + 7)
//   Step 7: Evaluate on the val split      (Layer 6 - ml)
//   Step 8: Write the report and config    (Layer 7 - infra)
//
// Reference: Rust Book §10 (Generic Types, Traits)
//            Burn Book §3 (Backends)

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::NdArray;
use burn::tensor::backend::Backend;

use crate::application::config::{DeviceKind, HbirdConfig};
use crate::data::voc::{PascalVocDataModule, VocConfig};
use crate::domain::error::{HbirdError, HbirdResult};
use crate::domain::traits::{MetricReport, SegmentationSource};
use crate::infra::artifacts::ArtifactStore;
use crate::infra::metrics::{ConfusionMatrixIoU, MetricsLogger};
use crate::ml::evaluator::{EvaluatorSettings, HbirdEvaluator, KnnDetails};
use crate::ml::extractor::{RandomPatchEncoder, RandomPatchEncoderConfig};
use crate::retrieval::index::NeighborIndex;
use crate::retrieval::memory_bank::MemoryBank;

pub(crate) type Evaluator<B> = HbirdEvaluator<B, RandomPatchEncoder<B>>;

/// What a finished evaluation hands back to the caller.
#[derive(Debug, Clone)]
pub struct EvalSummary {
    pub report:      MetricReport,
    pub memory_rows: usize,
    pub knn:         Option<KnnDetails>,
    /// Set when `output_dir` was configured.
    pub csv_path:    Option<PathBuf>,
}

// ─── Dataset ─────────────────────────────────────────────────────────────────

/// Open a segmentation dataset by name. Only Pascal VOC is available.
pub fn open_dataset(name: &str, config: &HbirdConfig) -> HbirdResult<Box<dyn SegmentationSource>> {
    match name {
        "voc" => {
            let input_size = u32::try_from(config.input_size)
                .map_err(|_| HbirdError::Precondition(format!("input size {} is too large", config.input_size)))?;
            let mut voc = VocConfig::new(&config.data_dir, input_size, config.batch_size);
            voc.num_train_samples = config.num_train_samples;
            voc.seed              = config.seed;
            Ok(Box::new(PascalVocDataModule::setup(voc)?))
        }
        other => Err(HbirdError::UnsupportedConfiguration(format!("unknown dataset '{other}'"))),
    }
}

// ─── Shared run steps ────────────────────────────────────────────────────────

pub(crate) fn evaluator_settings(config: &HbirdConfig, source: &dyn SegmentationSource) -> EvaluatorSettings {
    EvaluatorSettings {
        num_neighbour:      config.num_neighbour,
        augmentation_epoch: config.augmentation_epoch,
        num_classes:        source.num_classes(),
        memory_size:        config.memory_size,
        dataset_size:       source.train_dataset_size(),
        temperature:        config.temperature,
        seed:               config.seed,
        ann:                config.ann.clone(),
    }
}

pub(crate) fn build_extractor<B: Backend>(config: &HbirdConfig, device: &B::Device) -> Result<RandomPatchEncoder<B>> {
    let encoder = RandomPatchEncoderConfig::new(config.input_size, config.patch_size, config.d_model)
        .with_seed(config.seed)
        .init::<B>(device)
        .context("Failed to build the patch encoder")?;

    match &config.extractor_weights {
        Some(path) => encoder
            .load_weights(path, device)
            .with_context(|| format!("Failed to load extractor weights from '{}'", path.display())),
        None => Ok(encoder),
    }
}

/// Build a fresh bank and write it out when the store paths are set.
pub(crate) fn create_and_save_memory<B: Backend>(
    config:    &HbirdConfig,
    extractor: &RandomPatchEncoder<B>,
    source:    &dyn SegmentationSource,
    settings:  &EvaluatorSettings,
    device:    &B::Device,
) -> Result<MemoryBank> {
    let bank = Evaluator::<B>::create_memory(extractor, source, settings, device)
        .context("Failed to create the memory bank")?;

    match (&config.feature_memory_path, &config.label_memory_path) {
        (None, None) => {}
        _ => {
            let (features, labels) = config.memory_paths()?;
            ArtifactStore::save_memory(&bank, features, labels).context("Failed to save the memory bank")?;
        }
    }
    Ok(bank)
}

/// Build the index and write it out when `nn_index_path` is set.
pub(crate) fn build_and_save_index<B: Backend>(
    config:   &HbirdConfig,
    bank:     &MemoryBank,
    settings: &EvaluatorSettings,
) -> Result<NeighborIndex> {
    let index = Evaluator::<B>::build_index(bank, settings).context("Failed to build the neighbor index")?;
    if let Some(path) = &config.nn_index_path {
        ArtifactStore::save_index(&index, path).context("Failed to save the neighbor index")?;
    }
    Ok(index)
}

// ─── EvalUseCase ─────────────────────────────────────────────────────────────
pub struct EvalUseCase {
    config: HbirdConfig,
}

impl EvalUseCase {
    pub fn new(config: HbirdConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<EvalSummary> {
        // ── Step 1: Fail fast on bad parameters ──────────────────────────────
        self.config.validate().context("Invalid run configuration")?;

        // ── Step 2: Dataset ───────────────────────────────────────────────────
        let source = open_dataset(&self.config.dataset_name, &self.config)
            .with_context(|| format!("Failed to open dataset '{}'", self.config.dataset_name))?;

        // ── Step 3: Backend dispatch ──────────────────────────────────────────
        match self.config.device_kind()? {
            DeviceKind::Cpu => self.run::<NdArray>(source.as_ref(), Default::default()),
            #[cfg(feature = "wgpu")]
            DeviceKind::Wgpu => self.run::<burn::backend::Wgpu>(source.as_ref(), Default::default()),
            #[cfg(not(feature = "wgpu"))]
            DeviceKind::Wgpu => anyhow::bail!("this build has no wgpu backend"),
        }
    }

    fn run<B: Backend>(&self, source: &dyn SegmentationSource, device: B::Device) -> Result<EvalSummary> {
        let cfg      = &self.config;
        let settings = evaluator_settings(cfg, source);
        tracing::info!(
            "Evaluating on '{}' ({} train images, {} classes, device {})",
            cfg.dataset_name,
            settings.dataset_size,
            settings.num_classes,
            cfg.device
        );

        // ── Step 4: Feature extractor ─────────────────────────────────────────
        let extractor = build_extractor::<B>(cfg, &device)?;

        // ── Step 5: Memory bank ──────────────────────────────────────────────
        // A stored index is only reused over a restored bank.
        let restored = if cfg.load_memory {
            let (features, labels) = cfg.memory_paths()?;
            let bank = ArtifactStore::load_memory(features, labels).context("Failed to load the memory bank")?;
            if bank.is_none() {
                tracing::warn!(
                    "Memory stores '{}' / '{}' not found, rebuilding from the training split",
                    features.display(),
                    labels.display()
                );
            }
            bank
        } else {
            None
        };
        let loaded = restored.is_some();
        let bank = match restored {
            Some(bank) => bank,
            None => create_and_save_memory(cfg, &extractor, source, &settings, &device)?,
        };

        // ── Step 6: Neighbor index ────────────────────────────────────────────
        let index = match &cfg.nn_index_path {
            Some(path) if loaded && path.exists() => {
                ArtifactStore::load_index(path, &bank).context("Failed to load the neighbor index")?
            }
            _ => build_and_save_index::<B>(cfg, &bank, &settings)?,
        };

        // ── Step 7: Evaluate ─────────────────────────────────────────────────
        let memory_rows = bank.len();
        let mut metric  = ConfusionMatrixIoU::new(settings.num_classes);
        let evaluator   = Evaluator::<B>::new(extractor, device, bank, index, settings)
            .context("Memory bank and index do not fit the extractor")?;
        let outcome = evaluator
            .evaluate(source, &mut metric, cfg.return_knn_details)
            .context("Evaluation failed")?;

        // ── Step 8: Report ───────────────────────────────────────────────────
        let csv_path = match &cfg.output_dir {
            Some(dir) => {
                let logger = MetricsLogger::new(dir)?;
                logger.log(&outcome.report)?;
                ArtifactStore::save_config(cfg, dir)?;
                Some(logger.csv_path().to_path_buf())
            }
            None => None,
        };

        tracing::info!("mIoU = {:.4} over {} memory rows", outcome.report.mean_iou, memory_rows);
        Ok(EvalSummary { report: outcome.report, memory_rows, knn: outcome.knn, csv_path })
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;

    use crate::data::testing::write_voc;
    use crate::retrieval::index::AnnParams;

    pub(crate) fn tiny_config(root: &Path) -> HbirdConfig {
        HbirdConfig {
            input_size:    8,
            patch_size:    4,
            data_dir:      root.join("voc"),
            batch_size:    2,
            num_neighbour: 2,
            d_model:       8,
            ann: AnnParams { num_leaves: 4, num_leaves_to_search: 2, ..AnnParams::default() },
            ..HbirdConfig::default()
        }
    }

    #[test]
    fn test_unknown_dataset_is_unsupported() {
        let cfg = HbirdConfig::default();
        assert!(matches!(
            open_dataset("cityscapes", &cfg),
            Err(HbirdError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn test_end_to_end_run_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        write_voc(&dir.path().join("voc"), &["a", "b", "c"], &["v1", "v2"]);
        let cfg = HbirdConfig {
            output_dir:          Some(dir.path().join("out")),
            feature_memory_path: Some(dir.path().join("mem").join("features.bin")),
            label_memory_path:   Some(dir.path().join("mem").join("labels.bin")),
            ..tiny_config(dir.path())
        };

        let summary = EvalUseCase::new(cfg.clone()).execute().unwrap();
        // 3 images × 2 × 2 patches, unbounded.
        assert_eq!(summary.memory_rows, 12);
        assert_eq!(summary.report.jaccard.len(), 21);
        assert!(summary.report.mean_iou > 0.5, "mIoU {}", summary.report.mean_iou);
        assert!(summary.csv_path.unwrap().exists());
        assert!(dir.path().join("out").join("run_config.json").exists());
        assert!(dir.path().join("mem").join("features.bin").exists());

        // Second run restores the stores instead of re-extracting.
        let reloaded = EvalUseCase::new(HbirdConfig { load_memory: true, ..cfg }).execute().unwrap();
        assert_eq!(reloaded.memory_rows, 12);
        assert_eq!(reloaded.report.tp, summary.report.tp);
    }

    #[test]
    fn test_missing_stores_fall_back_to_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        write_voc(&dir.path().join("voc"), &["a", "b"], &["v"]);
        let cfg = HbirdConfig {
            load_memory:         true,
            feature_memory_path: Some(dir.path().join("absent_f.bin")),
            label_memory_path:   Some(dir.path().join("absent_l.bin")),
            ..tiny_config(dir.path())
        };
        let summary = EvalUseCase::new(cfg).execute().unwrap();
        assert_eq!(summary.memory_rows, 8);
        assert!(dir.path().join("absent_f.bin").exists());
    }

    #[test]
    fn test_single_store_path_fails_instead_of_skipping_save() {
        let dir = tempfile::tempdir().unwrap();
        write_voc(&dir.path().join("voc"), &["a", "b"], &["v"]);
        let cfg = HbirdConfig {
            feature_memory_path: Some(dir.path().join("features.bin")),
            ..tiny_config(dir.path())
        };
        let err = EvalUseCase::new(cfg).execute().unwrap_err();
        assert!(format!("{err:#}").contains("label_memory_path"));
        assert!(!dir.path().join("features.bin").exists());
    }

    #[test]
    fn test_invalid_config_stops_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = HbirdConfig { temperature: 0.0, ..tiny_config(dir.path()) };
        let err = EvalUseCase::new(cfg).execute().unwrap_err();
        assert!(format!("{err:#}").contains("temperature"));
    }
}
