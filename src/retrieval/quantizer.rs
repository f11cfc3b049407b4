// ============================================================
// Layer 5 — Anisotropic Product Quantizer
// ============================================================
// Compresses leaf residuals (datapoint − leaf centroid) so
// candidate scoring only needs table lookups:
//
//   residual [D] → blocks of `dims_per_block` dims
//             → one 16-entry codebook per block
//             → one u8 code per block
//
//   approx ⟨q, x⟩ = ⟨q, leaf⟩ + Σ_b LUT_b[code_b]
//   where LUT_b[j] = ⟨q_b, codeword_bj⟩
//
// Codes are chosen with the score-aware (anisotropic) loss:
// error parallel to the datapoint moves inner products far
// more than orthogonal error, so it is weighted by η:
//
//   loss = ‖r⊥‖² + η‖r∥‖²,   η = (D−1)·T² / (1−T²)
//
// T is the anisotropic quantization threshold. T = 0 turns
// the weighting off (plain nearest-codeword encoding).
//
// Reference: Guo et al. (2020) Accelerating Large-Scale
//            Inference with Anisotropic Vector Quantization

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::domain::error::{HbirdError, HbirdResult};
use crate::retrieval::kmeans::{nearest, KMeans, KMeansMetric};
use crate::retrieval::vector::{dot, squared_l2};

/// Codewords per block, so every code fits in four bits.
pub const CODEWORDS_PER_BLOCK: usize = 16;

/// Coordinate-descent sweeps over the blocks when encoding.
const ENCODE_PASSES: usize = 2;

/// Parallel-error weight for a dimension and threshold.
pub fn anisotropic_eta(dim: usize, threshold: f32) -> f32 {
    if threshold <= 0.0 {
        return 1.0;
    }
    let t2 = threshold * threshold;
    (dim.saturating_sub(1)) as f32 * t2 / (1.0 - t2)
}

/// Contiguous dimension range covered by one codebook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Block {
    start: usize,
    len:   usize,
}

/// One codebook per block of dimensions, trained on leaf residuals.
///
/// The last block is shorter when `dims_per_block` does not divide
/// the dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductQuantizer {
    dim:       usize,
    blocks:    Vec<Block>,
    /// Per block, `codewords × block.len` values.
    codebooks: Vec<Vec<f32>>,
    codewords: usize,
    eta:       f32,
}

impl ProductQuantizer {
    /// Train one codebook per block on `residuals` (`dim`-wide rows).
    pub fn train<R: Rng>(
        residuals:      &[f32],
        dim:            usize,
        dims_per_block: usize,
        threshold:      f32,
        iterations:     usize,
        rng:            &mut R,
    ) -> HbirdResult<Self> {
        if dims_per_block == 0 {
            return Err(HbirdError::IndexBuild("dimensions_per_block must be positive".into()));
        }
        let n = residuals.len() / dim;
        if n == 0 {
            return Err(HbirdError::IndexBuild("no residuals to train the quantizer on".into()));
        }

        let blocks: Vec<Block> = (0..dim)
            .step_by(dims_per_block)
            .map(|start| Block { start, len: dims_per_block.min(dim - start) })
            .collect();
        let codewords = CODEWORDS_PER_BLOCK.min(n);

        let mut codebooks = Vec::with_capacity(blocks.len());
        for block in &blocks {
            let mut sub = Vec::with_capacity(n * block.len);
            for row in residuals.chunks_exact(dim) {
                sub.extend_from_slice(&row[block.start..block.start + block.len]);
            }
            let codebook = KMeans::new(codewords, iterations, KMeansMetric::SquaredL2)
                .train(&sub, block.len, rng)?;
            codebooks.push(codebook);
        }

        Ok(Self { dim, blocks, codebooks, codewords, eta: anisotropic_eta(dim, threshold) })
    }

    /// Codes per encoded row.
    pub fn num_blocks(&self) -> usize { self.blocks.len() }

    /// Codewords per block, at most [`CODEWORDS_PER_BLOCK`].
    pub fn codewords(&self) -> usize { self.codewords }

    /// Weight of the parallel residual error used while encoding.
    pub fn eta(&self) -> f32 { self.eta }

    fn codeword(&self, block: usize, code: usize) -> &[f32] {
        let len = self.blocks[block].len;
        &self.codebooks[block][code * len..(code + 1) * len]
    }

    /// Codes for `residual`, which quantizes `datapoint`.
    pub fn encode(&self, datapoint: &[f32], residual: &[f32]) -> Vec<u8> {
        let mut codes: Vec<u8> = self
            .blocks
            .iter()
            .enumerate()
            .map(|(b, block)| {
                let r = &residual[block.start..block.start + block.len];
                nearest(&self.codebooks[b], r, block.len, KMeansMetric::SquaredL2) as u8
            })
            .collect();

        let x_norm2 = dot(datapoint, datapoint);
        if (self.eta - 1.0).abs() < f32::EPSILON || x_norm2 <= f32::EPSILON {
            return codes;
        }

        // Residual error e_b = r_b − codeword_b; track Σ⟨e_b, x_b⟩ and Σ‖e_b‖².
        let block_terms = |b: usize, code: usize| -> (f32, f32) {
            let block = self.blocks[b];
            let r = &residual[block.start..block.start + block.len];
            let x = &datapoint[block.start..block.start + block.len];
            let c = self.codeword(b, code);
            let parallel = dot(r, x) - dot(c, x);
            (parallel, squared_l2(r, c))
        };
        let loss = |parallel: f32, total: f32| total + (self.eta - 1.0) * parallel * parallel / x_norm2;

        let (mut parallel, mut total) = (0.0f32, 0.0f32);
        for (b, &code) in codes.iter().enumerate() {
            let (p, s) = block_terms(b, code as usize);
            parallel += p;
            total    += s;
        }

        for _ in 0..ENCODE_PASSES {
            let mut improved = false;
            for b in 0..self.blocks.len() {
                let (cur_p, cur_s) = block_terms(b, codes[b] as usize);
                let base_p = parallel - cur_p;
                let base_s = total - cur_s;

                let mut best = (codes[b] as usize, loss(parallel, total), cur_p, cur_s);
                for j in 0..self.codewords {
                    let (p, s) = block_terms(b, j);
                    let l = loss(base_p + p, base_s + s);
                    if l < best.1 {
                        best = (j, l, p, s);
                    }
                }
                if best.0 != codes[b] as usize {
                    improved = true;
                    codes[b] = best.0 as u8;
                }
                parallel = base_p + best.2;
                total    = base_s + best.3;
            }
            if !improved {
                break;
            }
        }
        codes
    }

    /// Reconstructed residual for a code vector.
    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let mut out = vec![0.0f32; self.dim];
        for (b, &code) in codes.iter().enumerate() {
            let block = self.blocks[b];
            out[block.start..block.start + block.len].copy_from_slice(self.codeword(b, code as usize));
        }
        out
    }

    /// Inner products of each query block with each codeword,
    /// laid out `[block][codeword]`.
    pub fn lookup_table(&self, query: &[f32]) -> Vec<f32> {
        let mut lut = Vec::with_capacity(self.blocks.len() * self.codewords);
        for (b, block) in self.blocks.iter().enumerate() {
            let q = &query[block.start..block.start + block.len];
            for j in 0..self.codewords {
                lut.push(dot(q, self.codeword(b, j)));
            }
        }
        lut
    }

    /// Approximate ⟨q, residual⟩ from a table built by `lookup_table`.
    #[inline]
    pub fn score(&self, lut: &[f32], codes: &[u8]) -> f32 {
        codes
            .iter()
            .enumerate()
            .map(|(b, &code)| lut[b * self.codewords + code as usize])
            .sum()
    }
}
