// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Pure Rust structs and traits describing what the system
// works with: label maps, image batches, collaborator
// contracts and the error type.
//
// Rules for this layer:
//   - NO Burn tensor types (the data loader handle is the
//     only Burn item, in traits)
//   - NO file I/O
//   - Only plain structs, enums and traits

/// Library error enum and result alias
pub mod error;

/// Pixel label maps and image batches
pub mod label_map;

/// Dataset and metric contracts
pub mod traits;

pub use error::{HbirdError, HbirdResult, LoadFailure};
pub use label_map::{LabelMapBatch, SegmentationBatch, IGNORE_LABEL, IMAGE_CHANNELS};
pub use traits::{BatchLoad, MetricReport, SegmentationLoader, SegmentationMetric, SegmentationSource};
