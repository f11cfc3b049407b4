// ============================================================
// Layer 2 — Run Configuration
// ============================================================
// Every parameter of an evaluation or memory-building run.
// Serialisable so the resolved values can be written next to
// the results (run_config.json) and reloaded later.
//
// validate() runs every fail-fast check before any data is
// touched: a bad run stops here, not halfway through building
// the memory bank.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::error::{HbirdError, HbirdResult};
use crate::retrieval::index::AnnParams;

// ─── Device ──────────────────────────────────────────────────────────────────
/// Where the tensor math runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// burn NdArray backend
    Cpu,
    /// burn Wgpu backend (cargo feature `wgpu`)
    Wgpu,
}

impl FromStr for DeviceKind {
    type Err = HbirdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "wgpu" | "gpu" | "cuda" if cfg!(feature = "wgpu") => Ok(Self::Wgpu),
            "wgpu" | "gpu" | "cuda" => Err(HbirdError::UnsupportedConfiguration(format!(
                "device '{s}' needs a build with the `wgpu` feature"
            ))),
            other => Err(HbirdError::UnsupportedConfiguration(format!(
                "unknown device '{other}' (expected cpu or wgpu)"
            ))),
        }
    }
}

// ─── HbirdConfig ─────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HbirdConfig {
    /// Square side length images are resized to before extraction.
    pub input_size:         usize,
    pub patch_size:         usize,
    pub dataset_name:       String,
    pub data_dir:           PathBuf,
    pub batch_size:         usize,
    pub augmentation_epoch: usize,
    pub device:             String,
    pub num_neighbour:      usize,
    pub ann:                AnnParams,
    /// `None` keeps every training patch.
    pub memory_size:        Option<usize>,
    pub temperature:        f64,
    pub d_model:            usize,
    pub num_train_samples:  Option<usize>,
    pub feature_memory_path: Option<PathBuf>,
    pub label_memory_path:   Option<PathBuf>,
    pub nn_index_path:       Option<PathBuf>,
    /// Try the memory stores before rebuilding.
    pub load_memory:        bool,
    pub return_knn_details: bool,
    pub seed:               u64,
    pub extractor_weights:  Option<PathBuf>,
    pub output_dir:         Option<PathBuf>,
}

impl Default for HbirdConfig {
    fn default() -> Self {
        Self {
            input_size:          224,
            patch_size:          16,
            dataset_name:        "voc".to_string(),
            data_dir:            PathBuf::from("data/VOCSegmentation"),
            batch_size:          64,
            augmentation_epoch:  1,
            device:              "cpu".to_string(),
            num_neighbour:       30,
            ann:                 AnnParams::default(),
            memory_size:         None,
            temperature:         0.02,
            d_model:             768,
            num_train_samples:   None,
            feature_memory_path: None,
            label_memory_path:   None,
            nn_index_path:       None,
            load_memory:         false,
            return_knn_details:  false,
            seed:                42,
            extractor_weights:   None,
            output_dir:          None,
        }
    }
}

impl HbirdConfig {
    pub fn device_kind(&self) -> HbirdResult<DeviceKind> {
        self.device.parse()
    }

    /// Both memory store paths, or a precondition error naming the missing one.
    pub fn memory_paths(&self) -> HbirdResult<(&Path, &Path)> {
        match (&self.feature_memory_path, &self.label_memory_path) {
            (Some(f), Some(l)) => Ok((f.as_path(), l.as_path())),
            (None, _) => Err(HbirdError::Precondition("feature_memory_path is required".into())),
            (_, None) => Err(HbirdError::Precondition("label_memory_path is required".into())),
        }
    }

    pub fn validate(&self) -> HbirdResult<()> {
        let fail = |msg: String| Err(HbirdError::Precondition(msg));

        if self.input_size == 0 || self.patch_size == 0 || self.input_size % self.patch_size != 0 {
            return fail(format!(
                "input size {} must be a positive multiple of patch size {}",
                self.input_size, self.patch_size
            ));
        }
        if self.batch_size == 0 {
            return fail("batch_size must be positive".into());
        }
        if self.augmentation_epoch == 0 {
            return fail("augmentation_epoch must be at least 1".into());
        }
        if self.num_neighbour == 0 {
            return fail("num_neighbour must be positive".into());
        }
        if self.d_model == 0 {
            return fail("d_model must be positive".into());
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return fail(format!("temperature must be positive, got {}", self.temperature));
        }
        if self.memory_size == Some(0) {
            return fail("memory_size must be positive when given".into());
        }

        // ── Index parameters ──
        let ann = &self.ann;
        if ann.num_leaves == 0 || ann.num_leaves_to_search == 0 {
            return fail("num_leaves and num_leaves_to_search must be positive".into());
        }
        if ann.dimensions_per_block == 0 {
            return fail("dimensions_per_block must be positive".into());
        }
        let t = ann.anisotropic_quantization_threshold;
        if !(0.0..1.0).contains(&t) {
            return fail(format!("anisotropic_quantization_threshold must be in [0, 1), got {t}"));
        }

        // ── Persistence ──
        // The two stores are written and read as a pair.
        let any_store = self.feature_memory_path.is_some() || self.label_memory_path.is_some();
        if self.load_memory || any_store {
            self.memory_paths()?;
        }
        self.device_kind()?;
        Ok(())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = HbirdConfig::default();
        assert_eq!(cfg.num_neighbour, 30);
        assert_eq!(cfg.ann.num_leaves, 512);
        assert!(cfg.memory_size.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_temperature() {
        for t in [0.0, -0.5, f64::NAN] {
            let cfg = HbirdConfig { temperature: t, ..HbirdConfig::default() };
            assert!(matches!(cfg.validate(), Err(HbirdError::Precondition(_))));
        }
    }

    #[test]
    fn test_rejects_indivisible_patch_size() {
        let cfg = HbirdConfig { input_size: 225, ..HbirdConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_memory_requires_both_paths() {
        let cfg = HbirdConfig {
            load_memory: true,
            feature_memory_path: Some("f.bin".into()),
            ..HbirdConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("label_memory_path"));

        let cfg = HbirdConfig { label_memory_path: Some("l.bin".into()), ..cfg };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_single_store_path_is_rejected_without_load() {
        let only_features = HbirdConfig { feature_memory_path: Some("f.bin".into()), ..HbirdConfig::default() };
        let err = only_features.validate().unwrap_err();
        assert!(err.to_string().contains("label_memory_path"));

        let only_labels = HbirdConfig { label_memory_path: Some("l.bin".into()), ..HbirdConfig::default() };
        let err = only_labels.validate().unwrap_err();
        assert!(err.to_string().contains("feature_memory_path"));
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<DeviceKind>().unwrap(), DeviceKind::Cpu);
        assert!(matches!(
            "tpu".parse::<DeviceKind>(),
            Err(HbirdError::UnsupportedConfiguration(_))
        ));
        assert_eq!("wgpu".parse::<DeviceKind>().is_ok(), cfg!(feature = "wgpu"));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: HbirdConfig =
            serde_json::from_str(r#"{ "memory_size": 1000, "ann": { "num_leaves": 64 } }"#).unwrap();
        assert_eq!(cfg.memory_size, Some(1000));
        assert_eq!(cfg.ann.num_leaves, 64);
        assert_eq!(cfg.ann.num_leaves_to_search, 32);
        assert_eq!(cfg.patch_size, 16);
    }
}
