// ============================================================
// Layer 6 — ML / Tensor Layer (Burn)
// ============================================================
// All Burn tensor code lives here. The bank and index below
// this layer work on plain host vectors; this layer uploads
// what a batch needs and downloads the results.
//
// What's in this layer:
//
//   attention.rs — Cross-attention aggregator
//                  • L2 normalization
//                  • max-shifted softmax
//                  • batched q·Kᵀ/τ → weights · V
//
//   extractor.rs — FeatureExtractor trait and the seeded
//                  random patch-projection encoder
//                  (full-precision record loading)
//
//   upsample.rs  — half-pixel bilinear resize of the patch
//                  grid to pixel resolution
//
//   evaluator.rs — HbirdEvaluator: memory creation, index
//                  build, retrieval + aggregation, masked
//                  metric updates
//
// Reference: Burn Book §3 (Building Blocks)
//            Balažević et al. (2023) Towards In-context
//            Scene Understanding

/// Temperature-scaled cross-attention over retrieved neighbours
pub mod attention;

/// Patch feature extractor seam and built-in encoder
pub mod extractor;

/// Half-pixel bilinear upsampling
pub mod upsample;

/// Memory creation and dense evaluation driver
pub mod evaluator;
