// ============================================================
// Layer 5 — Memory Bank
// ============================================================
// The store of (feature, soft label) rows that evaluation
// queries vote with. Row i of `features` and row i of `labels`
// always describe the same training patch.
//
// Two construction modes behind one append/finish interface:
//
//   Unbounded → every patch of every batch is appended
//   Bounded   → storage for `capacity` rows is allocated up
//               front and filled through a write cursor
//
// The bank lives in host memory. Evaluation gathers the rows
// it needs per query batch and uploads only those.

use std::ops::Range;

use crate::domain::error::{HbirdError, HbirdResult};
use crate::retrieval::vector::{gather_rows, normalize_rows};

/// Growable or fixed-capacity accumulator for bank rows.
#[derive(Debug, Clone)]
pub enum MemoryBankBuilder {
    Unbounded {
        features:    Vec<f32>,
        labels:      Vec<f32>,
        dim:         usize,
        num_classes: usize,
    },
    Bounded {
        features:    Vec<f32>,
        labels:      Vec<f32>,
        dim:         usize,
        num_classes: usize,
        capacity:    usize,
        cursor:      usize,
    },
}

impl MemoryBankBuilder {
    pub fn unbounded(dim: usize, num_classes: usize) -> Self {
        Self::Unbounded { features: Vec::new(), labels: Vec::new(), dim, num_classes }
    }

    pub fn bounded(capacity: usize, dim: usize, num_classes: usize) -> Self {
        Self::Bounded {
            features: vec![0.0; capacity * dim],
            labels:   vec![0.0; capacity * num_classes],
            dim,
            num_classes,
            capacity,
            cursor: 0,
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Self::Unbounded { dim, .. } | Self::Bounded { dim, .. } => *dim,
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            Self::Unbounded { num_classes, .. } | Self::Bounded { num_classes, .. } => *num_classes,
        }
    }

    /// Rows written so far.
    pub fn written(&self) -> usize {
        match self {
            Self::Unbounded { features, dim, .. } => features.len() / dim.max(&1),
            Self::Bounded { cursor, .. } => *cursor,
        }
    }

    /// Fixed capacity, `None` in unbounded mode.
    pub fn capacity(&self) -> Option<usize> {
        match self {
            Self::Unbounded { .. } => None,
            Self::Bounded { capacity, .. } => Some(*capacity),
        }
    }

    /// Admit a block of rows. Features are L2-normalized on the way in.
    /// Returns the slot range the rows occupy.
    pub fn append(&mut self, new_features: &[f32], new_labels: &[f32]) -> HbirdResult<Range<usize>> {
        let (dim, num_classes) = (self.dim(), self.num_classes());
        if dim == 0 || new_features.len() % dim != 0 {
            return Err(HbirdError::shape(
                format!("a multiple of {dim} feature values"),
                new_features.len(),
            ));
        }
        let rows = new_features.len() / dim;
        if new_labels.len() != rows * num_classes {
            return Err(HbirdError::shape(
                format!("{} label values for {rows} rows", rows * num_classes),
                new_labels.len(),
            ));
        }

        match self {
            Self::Unbounded { features, labels, .. } => {
                let start = features.len() / dim;
                let offset = features.len();
                features.extend_from_slice(new_features);
                normalize_rows(&mut features[offset..], dim);
                labels.extend_from_slice(new_labels);
                Ok(start..start + rows)
            }
            Self::Bounded { features, labels, capacity, cursor, .. } => {
                let start = *cursor;
                let end   = start + rows;
                if end > *capacity {
                    return Err(HbirdError::CapacityExceeded {
                        capacity:      *capacity,
                        requested_end: end,
                    });
                }
                let slot = &mut features[start * dim..end * dim];
                slot.copy_from_slice(new_features);
                normalize_rows(slot, dim);
                labels[start * num_classes..end * num_classes].copy_from_slice(new_labels);
                *cursor = end;
                Ok(start..end)
            }
        }
    }

    /// Freeze into an immutable bank holding the written rows.
    pub fn finish(self) -> MemoryBank {
        match self {
            Self::Unbounded { features, labels, dim, num_classes } => {
                MemoryBank { features, labels, dim, num_classes }
            }
            Self::Bounded { mut features, mut labels, dim, num_classes, capacity, cursor } => {
                if cursor < capacity {
                    tracing::warn!(
                        "Bounded memory bank under-filled: {} of {} rows written",
                        cursor,
                        capacity
                    );
                }
                features.truncate(cursor * dim);
                labels.truncate(cursor * num_classes);
                MemoryBank { features, labels, dim, num_classes }
            }
        }
    }
}

/// Finalized, read-only bank of normalized features and soft labels.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryBank {
    features:    Vec<f32>,
    labels:      Vec<f32>,
    dim:         usize,
    num_classes: usize,
}

impl MemoryBank {
    /// Rebuild a bank from stored matrices, e.g. after loading artifacts.
    pub fn from_parts(
        features:    Vec<f32>,
        labels:      Vec<f32>,
        dim:         usize,
        num_classes: usize,
    ) -> HbirdResult<Self> {
        if dim == 0 || num_classes == 0 {
            return Err(HbirdError::InvalidShape(
                "feature dimension and class count must be positive".into(),
            ));
        }
        if features.len() % dim != 0 || labels.len() % num_classes != 0 {
            return Err(HbirdError::InvalidShape(format!(
                "{} feature values / {} label values do not form {dim}- and {num_classes}-wide rows",
                features.len(),
                labels.len()
            )));
        }
        let rows = features.len() / dim;
        if labels.len() / num_classes != rows {
            return Err(HbirdError::shape(
                format!("{rows} label rows"),
                labels.len() / num_classes,
            ));
        }
        Ok(Self { features, labels, dim, num_classes })
    }

    pub fn len(&self) -> usize {
        self.features.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn dim(&self) -> usize { self.dim }

    pub fn num_classes(&self) -> usize { self.num_classes }

    pub fn features(&self) -> &[f32] { &self.features }

    pub fn labels(&self) -> &[f32] { &self.labels }

    pub fn feature_row(&self, i: usize) -> &[f32] {
        &self.features[i * self.dim..(i + 1) * self.dim]
    }

    pub fn label_row(&self, i: usize) -> &[f32] {
        &self.labels[i * self.num_classes..(i + 1) * self.num_classes]
    }

    /// Feature rows for the given ids, flattened in id order.
    pub fn gather_features(&self, ids: &[usize]) -> HbirdResult<Vec<f32>> {
        self.check_ids(ids)?;
        Ok(gather_rows(&self.features, self.dim, ids))
    }

    pub fn gather_labels(&self, ids: &[usize]) -> HbirdResult<Vec<f32>> {
        self.check_ids(ids)?;
        Ok(gather_rows(&self.labels, self.num_classes, ids))
    }

    fn check_ids(&self, ids: &[usize]) -> HbirdResult<()> {
        let len = self.len();
        match ids.iter().find(|&&id| id >= len) {
            Some(&id) => Err(HbirdError::IndexQuery(format!(
                "neighbour id {id} is outside the {len}-row memory bank"
            ))),
            None => Ok(()),
        }
    }

    /// Release the storage and return its size in bytes, for logging.
    pub fn release(self) -> usize {
        (self.features.len() + self.labels.len()) * std::mem::size_of::<f32>()
    }
}
