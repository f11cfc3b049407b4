#![recursion_limit = "256"]

// ============================================================
// hbird_eval — dense in-context label propagation
// ============================================================
// Layers, outermost first (the CLI lives in the binary):
//
//   application — run config and use cases
//   domain      — label maps, collaborator traits, errors
//   data        — datasets, transforms, patch labels, sampler
//   retrieval   — memory bank and approximate neighbor index
//   ml          — feature extractor, attention, evaluator
//   infra       — artifact persistence and metrics

pub mod application;
pub mod domain;
pub mod data;
pub mod retrieval;
pub mod ml;
pub mod infra;
