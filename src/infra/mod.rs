// ============================================================
// Layer 7 — Infrastructure Layer
// ============================================================
// Cross-cutting concerns that don't belong to any one
// business layer:
//
//   artifacts.rs — Persisting a run's reusable outputs
//                  bincode feature/label stores for the
//                  memory bank and the neighbor index, and
//                  the resolved run configuration as JSON.
//
//   metrics.rs   — Segmentation scoring
//                  Confusion-matrix IoU over all scored
//                  pixels, plus a CSV writer for the
//                  per-class table.
//
// Reference: Rust Book §9 (Error Handling)
//            Rust Book §12 (I/O and File Handling)

/// Memory, index and config persistence
pub mod artifacts;

/// Confusion-matrix IoU and CSV report logger
pub mod metrics;
