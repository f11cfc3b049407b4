// ============================================================
// Layer 5 — Retrieval Layer
// ============================================================
// Everything between "a patch feature was admitted" and
// "here are its k most similar training patches":
//
//   training features + soft labels
//       │
//       ▼
//   MemoryBankBuilder  → unbounded or fixed-capacity append
//       │ finish()
//       ▼
//   MemoryBank         → frozen host-side rows
//       │ snapshot
//       ▼
//   NeighborIndex      → leaves (k-means) + AH codes (PQ)
//       │ search_batched()
//       ▼
//   SearchResults      → k ids + scores per query
//
// Plain Rust on flat row-major `Vec<f32>` matrices, no tensor
// backend. Heavy loops run on rayon.

/// Flat-matrix vector helpers
pub mod vector;

/// Memory bank builder and frozen bank
pub mod memory_bank;

/// Spherical and squared-L2 k-means
pub mod kmeans;

/// Anisotropic product quantizer
pub mod quantizer;

/// Tree + AH + reorder approximate neighbor index
pub mod index;

pub use index::{AnnParams, DistanceMeasure, Neighbor, NeighborIndex, NeighborIndexBuilder, SearchResults};
pub use memory_bank::{MemoryBank, MemoryBankBuilder};
