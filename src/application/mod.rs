// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// This layer orchestrates all the other layers to accomplish
// one goal per use case (evaluate, or build a memory bank).
//
// Rules for this layer:
//   - No tensor math or index code here
//   - No printing here (that's Layer 1)
//   - File access only through infra::artifacts
//   - Only workflow coordination and backend dispatch
//
// Reference: Clean Architecture pattern
//            Rust Book §7 (Module System)

// Run parameters, defaults and fail-fast validation
pub mod config;

// The full evaluation workflow
pub mod eval_use_case;

// Ahead-of-time memory bank (and index) construction
pub mod memory_use_case;
