// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything from files on disk to label rows the memory
// bank can store.
//
// The pipeline flows in this order:
//
//   VOC lists + JPEG/PNG files
//       │
//       ▼
//   PascalVocDataModule  → Partial / Shuffled / Mapper datasets
//       │                    decode image and mask lazily
//       ▼
//   SegmentationTransform → crop / flip / resize / normalize
//       │
//       ▼
//   SegmentationBatcher  → DataLoader of SegmentationBatch
//       │
//       ▼
//   PatchGrid            → per-patch soft labels (P×P mean one-hot)
//       │
//       ▼
//   MemorySampler        → rare-class patches for a bounded bank
//
// InMemorySegmentation serves prepared samples through the
// same SegmentationSource trait.
//
// Reference: Burn Book §4 (Datasets)
//            Rust Book §13 (Iterators and Closures)

/// Prepared samples and the in-memory data source
pub mod dataset;

/// Burn batcher and loader construction
pub mod batcher;

/// Pascal VOC 2012 (augmented) reader
pub mod voc;

/// Crop, flip, resize and ImageNet normalization
pub mod transforms;

/// Patch label encoder
pub mod patchify;

/// Rare-class biased patch sampler
pub mod sampler;

#[cfg(test)]
pub(crate) mod testing;
