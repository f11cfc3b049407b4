// ============================================================
// Layer 5 — Approximate Neighbor Index
// ============================================================
// Tree + asymmetric hashing + reorder, built once from a
// snapshot of the memory bank features:
//
//   Build:
//     snapshot  = normalize(features)                [M, D]
//     leaves    = spherical k-means(snapshot)        [L, D]
//     residual  = x − leaf(x)                        [M, D]
//     codes     = anisotropic PQ(residual)           [M, D/dpb]
//
//   Search (per query q):
//     q̂         = normalize(q)
//     visit     = top `num_leaves_to_search` leaves by ⟨q̂, leaf⟩
//     approx    = ⟨q̂, leaf⟩ + Σ LUT[code]            (visited points)
//     reorder   = exact ⟨q̂, x⟩ on the best candidates
//     result    = k ids, descending score, ties → lower id
//
// The index owns its snapshot. Changing the bank afterwards
// requires a rebuild.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::str::FromStr;

use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::error::{HbirdError, HbirdResult};
use crate::retrieval::kmeans::{assign, KMeans, KMeansMetric};
use crate::retrieval::quantizer::ProductQuantizer;
use crate::retrieval::vector::{dot, gather_rows, normalize, normalize_rows};

/// Similarity the index ranks by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMeasure {
    /// Inner product on normalized vectors (cosine similarity).
    #[default]
    DotProduct,
}

impl FromStr for DistanceMeasure {
    type Err = HbirdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dot_product" => Ok(Self::DotProduct),
            other => Err(HbirdError::UnsupportedConfiguration(format!(
                "distance measure '{other}' (only dot_product is supported)"
            ))),
        }
    }
}

/// Tunable index parameters, overridable from the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnParams {
    pub distance_measure:                   DistanceMeasure,
    pub num_leaves:                         usize,
    pub num_leaves_to_search:               usize,
    pub anisotropic_quantization_threshold: f32,
    pub num_reordering_candidates:          usize,
    pub dimensions_per_block:               usize,
    /// Rows used to train leaves and codebooks; `None` uses the whole bank.
    pub training_sample_size:               Option<usize>,
    pub kmeans_iterations:                  usize,
}

impl Default for AnnParams {
    fn default() -> Self {
        Self {
            distance_measure:                   DistanceMeasure::DotProduct,
            num_leaves:                         512,
            num_leaves_to_search:               32,
            anisotropic_quantization_threshold: 0.2,
            num_reordering_candidates:          120,
            dimensions_per_block:               4,
            training_sample_size:               None,
            kmeans_iterations:                  10,
        }
    }
}

/// One retrieved row and its similarity to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id:    usize,
    pub score: f32,
}

fn by_score_desc(a: &Neighbor, b: &Neighbor) -> Ordering {
    b.score.total_cmp(&a.score).then(a.id.cmp(&b.id))
}

/// Results of a batched query, `k` entries per query, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResults {
    pub ids:         Vec<usize>,
    pub scores:      Vec<f32>,
    pub k:           usize,
    pub num_queries: usize,
}

impl SearchResults {
    /// Ids retrieved for one query, best first.
    pub fn neighbors(&self, query: usize) -> &[usize] {
        &self.ids[query * self.k..(query + 1) * self.k]
    }

    pub fn scores(&self, query: usize) -> &[f32] {
        &self.scores[query * self.k..(query + 1) * self.k]
    }
}

// ─── Builder ──────────────────────────────────────────────────────────────────

/// Collects build parameters, then produces an immutable [`NeighborIndex`].
#[derive(Debug, Clone)]
pub struct NeighborIndexBuilder<'a> {
    dataset:              &'a [f32],
    dim:                  usize,
    num_neighbour:        usize,
    measure:              DistanceMeasure,
    num_leaves:           usize,
    num_leaves_to_search: usize,
    training_sample_size: Option<usize>,
    dims_per_block:       usize,
    threshold:            f32,
    reorder:              usize,
    kmeans_iterations:    usize,
    seed:                 u64,
}

impl<'a> NeighborIndexBuilder<'a> {
    /// Builder over `dim`-wide rows of `dataset` returning `num_neighbour`
    /// ids per query. Every other knob starts at [`AnnParams::default`].
    pub fn new(dataset: &'a [f32], dim: usize, num_neighbour: usize, measure: DistanceMeasure) -> Self {
        let defaults = AnnParams::default();
        Self {
            dataset,
            dim,
            num_neighbour,
            measure,
            num_leaves:           defaults.num_leaves,
            num_leaves_to_search: defaults.num_leaves_to_search,
            training_sample_size: defaults.training_sample_size,
            dims_per_block:       defaults.dimensions_per_block,
            threshold:            defaults.anisotropic_quantization_threshold,
            reorder:              defaults.num_reordering_candidates,
            kmeans_iterations:    defaults.kmeans_iterations,
            seed:                 0,
        }
    }

    pub fn from_params(dataset: &'a [f32], dim: usize, num_neighbour: usize, params: &AnnParams) -> Self {
        Self::new(dataset, dim, num_neighbour, params.distance_measure)
            .tree(params.num_leaves, params.num_leaves_to_search, params.training_sample_size)
            .score_ah(params.dimensions_per_block, params.anisotropic_quantization_threshold)
            .reorder(params.num_reordering_candidates)
            .kmeans_iterations(params.kmeans_iterations)
    }

    /// Partition into `num_leaves` leaves and search `num_leaves_to_search`
    /// of them per query. Leaves beyond the row count are dropped.
    pub fn tree(mut self, num_leaves: usize, num_leaves_to_search: usize, training_sample_size: Option<usize>) -> Self {
        self.num_leaves           = num_leaves;
        self.num_leaves_to_search = num_leaves_to_search;
        self.training_sample_size = training_sample_size;
        self
    }

    /// Asymmetric-hashing parameters for candidate scoring.
    pub fn score_ah(mut self, dimensions_per_block: usize, anisotropic_quantization_threshold: f32) -> Self {
        self.dims_per_block = dimensions_per_block;
        self.threshold      = anisotropic_quantization_threshold;
        self
    }

    /// Candidates rescored exactly; 0 disables reordering.
    pub fn reorder(mut self, num_reordering_candidates: usize) -> Self {
        self.reorder = num_reordering_candidates;
        self
    }

    pub fn kmeans_iterations(mut self, iterations: usize) -> Self {
        self.kmeans_iterations = iterations;
        self
    }

    /// Seed for the training sample, k-means and codebook init.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn validate(&self) -> HbirdResult<usize> {
        if self.dim == 0 || self.dataset.is_empty() {
            return Err(HbirdError::IndexBuild("cannot index an empty dataset".into()));
        }
        if self.dataset.len() % self.dim != 0 {
            return Err(HbirdError::IndexBuild(format!(
                "{} values do not form {}-dimensional rows",
                self.dataset.len(),
                self.dim
            )));
        }
        let rows = self.dataset.len() / self.dim;
        if self.num_neighbour == 0 || self.num_neighbour > rows {
            return Err(HbirdError::IndexBuild(format!(
                "num_neighbour {} must be in 1..={rows}",
                self.num_neighbour
            )));
        }
        if self.num_leaves == 0 || self.num_leaves_to_search == 0 {
            return Err(HbirdError::IndexBuild("leaf counts must be positive".into()));
        }
        if self.dims_per_block == 0 {
            return Err(HbirdError::IndexBuild("dimensions_per_block must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.threshold) {
            return Err(HbirdError::IndexBuild(format!(
                "anisotropic quantization threshold {} is outside [0, 1)",
                self.threshold
            )));
        }
        Ok(rows)
    }

    pub fn build(self) -> HbirdResult<NeighborIndex> {
        let rows = self.validate()?;
        let dim  = self.dim;
        let mut rng = StdRng::seed_from_u64(self.seed);

        // ── Snapshot ──
        let mut dataset = self.dataset.to_vec();
        normalize_rows(&mut dataset, dim);

        // ── Training sample ──
        let num_leaves = self.num_leaves.min(rows);
        let sample_ids: Option<Vec<usize>> = match self.training_sample_size {
            Some(size) if size.max(num_leaves) < rows => {
                let mut ids = rand::seq::index::sample(&mut rng, rows, size.max(num_leaves)).into_vec();
                ids.sort_unstable();
                Some(ids)
            }
            _ => None,
        };

        // ── Partition ──
        let centroids = {
            let training: Cow<'_, [f32]> = match &sample_ids {
                Some(ids) => gather_rows(&dataset, dim, ids).into(),
                None => dataset.as_slice().into(),
            };
            KMeans::new(num_leaves, self.kmeans_iterations, KMeansMetric::Spherical)
                .train(&training, dim, &mut rng)?
        };
        let assignment = assign(&centroids, &dataset, dim, KMeansMetric::Spherical);

        let mut leaves = vec![Vec::new(); num_leaves];
        for (id, &leaf) in assignment.iter().enumerate() {
            leaves[leaf].push(id);
        }

        // ── Quantize residuals ──
        let residuals: Vec<f32> = dataset
            .par_chunks_exact(dim)
            .zip(assignment.par_iter())
            .flat_map_iter(|(row, &leaf)| {
                let c = &centroids[leaf * dim..(leaf + 1) * dim];
                row.iter().zip(c).map(|(x, c)| x - c).collect::<Vec<f32>>()
            })
            .collect();
        let quantizer = {
            let training: Cow<'_, [f32]> = match &sample_ids {
                Some(ids) => gather_rows(&residuals, dim, ids).into(),
                None => residuals.as_slice().into(),
            };
            ProductQuantizer::train(
                &training,
                dim,
                self.dims_per_block,
                self.threshold,
                self.kmeans_iterations,
                &mut rng,
            )?
        };

        let codes: Vec<u8> = dataset
            .par_chunks_exact(dim)
            .zip(residuals.par_chunks_exact(dim))
            .flat_map_iter(|(row, residual)| quantizer.encode(row, residual))
            .collect();

        let non_empty = leaves.iter().filter(|l| !l.is_empty()).count();
        tracing::info!(
            "Built neighbor index: {} rows, {} leaves ({} non-empty), {} PQ blocks, eta={:.3}",
            rows,
            num_leaves,
            non_empty,
            quantizer.num_blocks(),
            quantizer.eta()
        );

        Ok(NeighborIndex {
            dim,
            num_neighbour: self.num_neighbour,
            measure: self.measure,
            num_leaves_to_search: self.num_leaves_to_search,
            num_reordering_candidates: self.reorder,
            centroids,
            leaves,
            quantizer,
            codes,
            dataset,
        })
    }
}

// ─── Searcher ─────────────────────────────────────────────────────────────────

/// Immutable searcher produced by [`NeighborIndexBuilder::build`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborIndex {
    dim:                       usize,
    num_neighbour:             usize,
    measure:                   DistanceMeasure,
    num_leaves_to_search:      usize,
    num_reordering_candidates: usize,
    centroids:                 Vec<f32>,
    /// Row ids per leaf, ascending.
    leaves:                    Vec<Vec<usize>>,
    quantizer:                 ProductQuantizer,
    codes:                     Vec<u8>,
    /// Normalized snapshot, used for reordering.
    dataset:                   Vec<f32>,
}

impl NeighborIndex {
    /// Rows indexed.
    pub fn len(&self) -> usize {
        self.dataset.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn dim(&self) -> usize { self.dim }

    pub fn num_neighbour(&self) -> usize { self.num_neighbour }

    /// Leaves actually built; at most the requested count, capped by rows.
    pub fn num_leaves(&self) -> usize { self.leaves.len() }

    fn codes_of(&self, id: usize) -> &[u8] {
        let blocks = self.quantizer.num_blocks();
        &self.codes[id * blocks..(id + 1) * blocks]
    }

    /// The `num_neighbour` most similar rows to `query`.
    pub fn search(&self, query: &[f32]) -> HbirdResult<Vec<Neighbor>> {
        if query.len() != self.dim {
            return Err(HbirdError::IndexQuery(format!(
                "query has {} dims, index has {}",
                query.len(),
                self.dim
            )));
        }
        let k = self.num_neighbour;
        let mut q = query.to_vec();
        normalize(&mut q);

        // ── Leaf ranking ──
        let mut leaf_scores: Vec<(usize, f32)> = self
            .centroids
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(leaf, c)| (leaf, dot(&q, c)))
            .collect();
        leaf_scores.sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        // ── Approximate scoring ──
        let lut = self.quantizer.lookup_table(&q);
        let mut candidates = Vec::new();
        for (visited, &(leaf, leaf_score)) in leaf_scores.iter().enumerate() {
            if visited >= self.num_leaves_to_search && candidates.len() >= k {
                break;
            }
            for &id in &self.leaves[leaf] {
                let score = leaf_score + self.quantizer.score(&lut, self.codes_of(id));
                candidates.push(Neighbor { id, score });
            }
        }

        // ── Reorder ──
        if self.num_reordering_candidates > 0 {
            keep_best(&mut candidates, self.num_reordering_candidates.max(k));
            for c in candidates.iter_mut() {
                c.score = dot(&q, &self.dataset[c.id * self.dim..(c.id + 1) * self.dim]);
            }
        }
        keep_best(&mut candidates, k);
        Ok(candidates)
    }

    /// Search every `dim`-wide row of `queries` in parallel.
    pub fn search_batched(&self, queries: &[f32]) -> HbirdResult<SearchResults> {
        if queries.len() % self.dim != 0 {
            return Err(HbirdError::IndexQuery(format!(
                "{} query values do not form {}-dimensional rows",
                queries.len(),
                self.dim
            )));
        }
        let per_query: Vec<Vec<Neighbor>> = queries
            .par_chunks_exact(self.dim)
            .map(|q| self.search(q))
            .collect::<HbirdResult<_>>()?;

        let num_queries = per_query.len();
        let mut ids    = Vec::with_capacity(num_queries * self.num_neighbour);
        let mut scores = Vec::with_capacity(num_queries * self.num_neighbour);
        for n in per_query.iter().flatten() {
            ids.push(n.id);
            scores.push(n.score);
        }
        tracing::debug!("Searched {} queries (k={})", num_queries, self.num_neighbour);
        Ok(SearchResults { ids, scores, k: self.num_neighbour, num_queries })
    }
}

/// Keep the `n` best neighbors, sorted descending.
fn keep_best(candidates: &mut Vec<Neighbor>, n: usize) {
    if n == 0 {
        candidates.clear();
        return;
    }
    if candidates.len() > n {
        candidates.select_nth_unstable_by(n - 1, by_score_desc);
        candidates.truncate(n);
    }
    candidates.sort_unstable_by(by_score_desc);
}
