// ============================================================
// Layer 7 — Artifact Store
// ============================================================
// Persists what a run can reuse:
//
//   feature store  (.bin)  ← bank features [M, D]
//   label store    (.bin)  ← bank soft labels [M, C]
//   neighbor index (.bin)  ← tree, codebooks, codes, snapshot
//   run_config.json        ← the resolved HbirdConfig
//
// Stores and index are bincode-encoded serde values. f32s are
// written as their raw bits, so a round trip is exact.
// The bank is only restored when both stores exist; otherwise
// load_memory returns None and the caller rebuilds.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::application::config::HbirdConfig;
use crate::domain::error::{HbirdError, HbirdResult};
use crate::retrieval::index::NeighborIndex;
use crate::retrieval::memory_bank::MemoryBank;

/// A dense row-major f32 matrix as kept in a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMatrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl StoredMatrix {
    fn check(&self) -> Result<(), String> {
        match self.rows.checked_mul(self.cols) {
            Some(n) if n == self.data.len() => Ok(()),
            Some(n) => Err(format!("{}x{} matrix holds {} values, expected {n}", self.rows, self.cols, self.data.len())),
            None => Err(format!("{}x{} matrix dimensions overflow", self.rows, self.cols)),
        }
    }
}

fn create_parent(path: &Path) -> HbirdResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| HbirdError::io(parent, e))
        }
        _ => Ok(()),
    }
}

fn write_bincode<T: Serialize>(path: &Path, value: &T) -> HbirdResult<()> {
    create_parent(path)?;
    let file = File::create(path).map_err(|e| HbirdError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, value)
        .map_err(|e| HbirdError::Artifact(format!("cannot write '{}': {e}", path.display())))?;
    writer.flush().map_err(|e| HbirdError::io(path, e))
}

fn read_bincode<T: DeserializeOwned>(path: &Path) -> HbirdResult<T> {
    let file = File::open(path).map_err(|e| HbirdError::io(path, e))?;
    bincode::deserialize_from(BufReader::new(file))
        .map_err(|e| HbirdError::Artifact(format!("cannot read '{}': {e}", path.display())))
}

pub fn save_matrix(path: &Path, data: &[f32], rows: usize, cols: usize) -> HbirdResult<()> {
    if rows.checked_mul(cols) != Some(data.len()) {
        return Err(HbirdError::shape(format!("{rows}x{cols} values"), data.len()));
    }
    write_bincode(path, &StoredMatrix { rows, cols, data: data.to_vec() })
}

pub fn load_matrix(path: &Path) -> HbirdResult<StoredMatrix> {
    let matrix: StoredMatrix = read_bincode(path)?;
    matrix
        .check()
        .map_err(|what| HbirdError::Artifact(format!("'{}': {what}", path.display())))?;
    Ok(matrix)
}

/// Reads and writes the artifacts of an evaluation run.
pub struct ArtifactStore;

impl ArtifactStore {
    /// Restore a bank, or `None` when either store is missing.
    pub fn load_memory(feature_path: &Path, label_path: &Path) -> HbirdResult<Option<MemoryBank>> {
        let missing: Vec<&Path> = [feature_path, label_path].into_iter().filter(|p| !p.exists()).collect();
        if !missing.is_empty() {
            tracing::debug!("Memory stores not found: {:?}", missing);
            return Ok(None);
        }

        let features = load_matrix(feature_path)?;
        let labels   = load_matrix(label_path)?;
        if features.rows != labels.rows {
            return Err(HbirdError::Artifact(format!(
                "feature store has {} rows, label store has {}",
                features.rows, labels.rows
            )));
        }

        let bank = MemoryBank::from_parts(features.data, labels.data, features.cols, labels.cols)?;
        tracing::info!(
            "Loaded memory bank: {} rows from '{}' and '{}'",
            bank.len(),
            feature_path.display(),
            label_path.display()
        );
        Ok(Some(bank))
    }

    pub fn save_memory(bank: &MemoryBank, feature_path: &Path, label_path: &Path) -> HbirdResult<()> {
        save_matrix(feature_path, bank.features(), bank.len(), bank.dim())?;
        save_matrix(label_path, bank.labels(), bank.len(), bank.num_classes())?;
        tracing::info!(
            "Saved memory bank ({} rows) to '{}' and '{}'",
            bank.len(),
            feature_path.display(),
            label_path.display()
        );
        Ok(())
    }

    pub fn save_index(index: &NeighborIndex, path: &Path) -> HbirdResult<()> {
        write_bincode(path, index)?;
        tracing::info!("Saved neighbor index to '{}'", path.display());
        Ok(())
    }

    /// Load an index and check it was built over `bank`.
    pub fn load_index(path: &Path, bank: &MemoryBank) -> HbirdResult<NeighborIndex> {
        let index: NeighborIndex = read_bincode(path)?;

        if index.len() != bank.len() || index.dim() != bank.dim() {
            return Err(HbirdError::Artifact(format!(
                "index '{}' covers {} rows of {} dims, bank has {} rows of {} dims",
                path.display(),
                index.len(),
                index.dim(),
                bank.len(),
                bank.dim()
            )));
        }
        tracing::info!("Loaded neighbor index from '{}' ({} leaves)", path.display(), index.num_leaves());
        Ok(index)
    }

    /// Write `run_config.json` into `dir`.
    pub fn save_config(config: &HbirdConfig, dir: &Path) -> HbirdResult<PathBuf> {
        fs::create_dir_all(dir).map_err(|e| HbirdError::io(dir, e))?;
        let path = dir.join("run_config.json");
        let json = serde_json::to_string_pretty(config)
            .map_err(|e| HbirdError::Artifact(format!("cannot serialize config: {e}")))?;
        fs::write(&path, json).map_err(|e| HbirdError::io(&path, e))?;
        tracing::debug!("Saved run config to '{}'", path.display());
        Ok(path)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::index::{DistanceMeasure, NeighborIndexBuilder};

    fn bank() -> MemoryBank {
        let features = vec![1.0, 0.0, 0.6, 0.8, 0.0, 1.0, -0.6, 0.8];
        let labels   = vec![1.0, 0.0, 0.25, 0.75, 0.0, 1.0, 0.5, 0.5];
        MemoryBank::from_parts(features, labels, 2, 2).unwrap()
    }

    #[test]
    fn test_matrix_round_trip_is_bit_exact() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("m.bin");
        let data = vec![0.1, -0.0, f32::MIN_POSITIVE / 2.0, f32::NAN, 1e30, -7.25];
        save_matrix(&path, &data, 2, 3).unwrap();

        let m = load_matrix(&path).unwrap();
        assert_eq!((m.rows, m.cols), (2, 3));
        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&m.data), bits(&data));
    }

    #[test]
    fn test_memory_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (f, l) = (dir.path().join("f.bin"), dir.path().join("l.bin"));
        let original = bank();
        ArtifactStore::save_memory(&original, &f, &l).unwrap();

        let restored = ArtifactStore::load_memory(&f, &l).unwrap().unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_missing_store_means_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let (f, l) = (dir.path().join("f.bin"), dir.path().join("l.bin"));
        save_matrix(&f, &[1.0], 1, 1).unwrap();
        assert!(ArtifactStore::load_memory(&f, &l).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_stores_are_rejected() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        fs::write(&path, b"short").unwrap();
        assert!(matches!(load_matrix(&path), Err(HbirdError::Artifact(_))));

        save_matrix(&path, &[1.0, 2.0], 1, 2).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        bytes.pop();
        fs::write(&path, bytes).unwrap();
        assert!(matches!(load_matrix(&path), Err(HbirdError::Artifact(_))));
    }

    #[test]
    fn test_untrusted_dimensions_are_rejected() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.bin");

        // rows × cols overflows usize.
        let overflowing = StoredMatrix { rows: usize::MAX, cols: 2, data: vec![1.0] };
        fs::write(&path, bincode::serialize(&overflowing).unwrap()).unwrap();
        let err = load_matrix(&path).unwrap_err();
        assert!(err.to_string().contains("overflow"), "{err}");

        // A payload length far beyond the file must fail, not allocate.
        let mut bytes = bincode::serialize(&StoredMatrix { rows: 1, cols: 1, data: vec![] }).unwrap();
        let len_at = bytes.len() - 8;
        bytes[len_at..].copy_from_slice(&u64::MAX.to_le_bytes());
        fs::write(&path, bytes).unwrap();
        assert!(matches!(load_matrix(&path), Err(HbirdError::Artifact(_))));

        // Consistent encoding, inconsistent shape.
        fs::write(&path, bincode::serialize(&StoredMatrix { rows: 2, cols: 2, data: vec![0.0; 3] }).unwrap()).unwrap();
        assert!(load_matrix(&path).is_err());
    }

    #[test]
    fn test_index_round_trip_and_check() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");
        let bank = bank();
        let index = NeighborIndexBuilder::new(bank.features(), 2, 2, DistanceMeasure::DotProduct)
            .score_ah(1, 0.2)
            .build()
            .unwrap();
        ArtifactStore::save_index(&index, &path).unwrap();

        let loaded = ArtifactStore::load_index(&path, &bank).unwrap();
        assert_eq!(loaded.search(&[1.0, 0.1]).unwrap(), index.search(&[1.0, 0.1]).unwrap());

        let smaller = MemoryBank::from_parts(vec![1.0, 0.0], vec![1.0, 0.0], 2, 2).unwrap();
        assert!(ArtifactStore::load_index(&path, &smaller).is_err());
    }

    #[test]
    fn test_save_config() {
        let dir  = tempfile::tempdir().unwrap();
        let path = ArtifactStore::save_config(&HbirdConfig::default(), dir.path()).unwrap();
        let back: HbirdConfig = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back.num_neighbour, 30);
    }
}
