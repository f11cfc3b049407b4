// ============================================================
// Layer 2 — MemoryUseCase
// ============================================================
// Builds the memory bank ahead of time so later evaluation
// runs can start from the stores with --load-memory:
//
//   Step 1: Validate + require both store paths
//   Step 2: Open the dataset and pick the backend
//   Step 3: Extract and sample the training patches
//   Step 4: Save features and labels
//   Step 5: Build and save the index (only with nn_index_path)

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::NdArray;
use burn::tensor::backend::Backend;

use crate::application::config::{DeviceKind, HbirdConfig};
use crate::application::eval_use_case::{
    build_and_save_index, build_extractor, create_and_save_memory, evaluator_settings, open_dataset,
};
use crate::domain::traits::SegmentationSource;

/// Where a memory build left its artifacts.
#[derive(Debug, Clone)]
pub struct MemorySummary {
    pub rows:          usize,
    pub feature_path:  PathBuf,
    pub label_path:    PathBuf,
    pub index_path:    Option<PathBuf>,
}

pub struct MemoryUseCase {
    config: HbirdConfig,
}

impl MemoryUseCase {
    pub fn new(config: HbirdConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<MemorySummary> {
        // ── Step 1: Validate ─────────────────────────────────────────────────
        self.config.validate().context("Invalid run configuration")?;
        self.config
            .memory_paths()
            .context("build-memory needs both --feature-memory-path and --label-memory-path")?;

        // ── Step 2: Dataset + backend ────────────────────────────────────────
        let source = open_dataset(&self.config.dataset_name, &self.config)
            .with_context(|| format!("Failed to open dataset '{}'", self.config.dataset_name))?;

        match self.config.device_kind()? {
            DeviceKind::Cpu => self.run::<NdArray>(source.as_ref(), Default::default()),
            #[cfg(feature = "wgpu")]
            DeviceKind::Wgpu => self.run::<burn::backend::Wgpu>(source.as_ref(), Default::default()),
            #[cfg(not(feature = "wgpu"))]
            DeviceKind::Wgpu => anyhow::bail!("this build has no wgpu backend"),
        }
    }

    fn run<B: Backend>(&self, source: &dyn SegmentationSource, device: B::Device) -> Result<MemorySummary> {
        let cfg      = &self.config;
        let settings = evaluator_settings(cfg, source);

        // ── Steps 3–4: Extract, sample, save ─────────────────────────────────
        let extractor = build_extractor::<B>(cfg, &device)?;
        let bank      = create_and_save_memory(cfg, &extractor, source, &settings, &device)?;

        // ── Step 5: Optional index ───────────────────────────────────────────
        if cfg.nn_index_path.is_some() {
            build_and_save_index::<B>(cfg, &bank, &settings)?;
        }

        let (feature_path, label_path) = cfg.memory_paths()?;
        Ok(MemorySummary {
            rows:         bank.len(),
            feature_path: feature_path.to_path_buf(),
            label_path:   label_path.to_path_buf(),
            index_path:   cfg.nn_index_path.clone(),
        })
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::eval_use_case::tests::tiny_config;
    use crate::application::eval_use_case::EvalUseCase;
    use crate::data::testing::write_voc;
    use crate::infra::artifacts::ArtifactStore;

    #[test]
    fn test_requires_both_paths() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = HbirdConfig {
            feature_memory_path: Some(dir.path().join("f.bin")),
            ..tiny_config(dir.path())
        };
        let err = MemoryUseCase::new(cfg).execute().unwrap_err();
        assert!(format!("{err:#}").contains("label_memory_path"));
    }

    #[test]
    fn test_bounded_build_then_evaluate_from_stores() {
        let dir = tempfile::tempdir().unwrap();
        write_voc(&dir.path().join("voc"), &["a", "b", "c", "d"], &["v"]);
        let cfg = HbirdConfig {
            memory_size:         Some(8),
            feature_memory_path: Some(dir.path().join("features.bin")),
            label_memory_path:   Some(dir.path().join("labels.bin")),
            nn_index_path:       Some(dir.path().join("index.bin")),
            ..tiny_config(dir.path())
        };

        let summary = MemoryUseCase::new(cfg.clone()).execute().unwrap();
        // 8 rows / 4 images = 2 patches per image.
        assert_eq!(summary.rows, 8);
        assert!(summary.index_path.unwrap().exists());

        let bank = ArtifactStore::load_memory(&summary.feature_path, &summary.label_path)
            .unwrap()
            .unwrap();
        assert_eq!((bank.len(), bank.dim(), bank.num_classes()), (8, 8, 21));

        let eval = EvalUseCase::new(HbirdConfig { load_memory: true, ..cfg }).execute().unwrap();
        assert_eq!(eval.memory_rows, 8);
    }

    #[test]
    fn test_index_skipped_without_path() {
        let dir = tempfile::tempdir().unwrap();
        write_voc(&dir.path().join("voc"), &["a", "b"], &["v"]);
        let cfg = HbirdConfig {
            feature_memory_path: Some(dir.path().join("f.bin")),
            label_memory_path:   Some(dir.path().join("l.bin")),
            ..tiny_config(dir.path())
        };
        let summary = MemoryUseCase::new(cfg).execute().unwrap();
        assert_eq!(summary.rows, 8);
        assert!(summary.index_path.is_none());
    }
}
