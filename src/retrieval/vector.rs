//! Dense row-major vector helpers shared by the bank and the index.

/// Norms below this are treated as zero and left unscaled.
pub const NORM_EPS: f32 = 1e-12;

/// Inner product of two equal-length slices.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Squared Euclidean distance; no square root is taken.
#[inline]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Scale `v` to unit length in place.
pub fn normalize(v: &mut [f32]) {
    let norm = dot(v, v).sqrt().max(NORM_EPS);
    for x in v.iter_mut() {
        *x /= norm;
    }
}

/// Normalize every `dim`-wide row of a flat matrix.
pub fn normalize_rows(data: &mut [f32], dim: usize) {
    for row in data.chunks_exact_mut(dim) {
        normalize(row);
    }
}

/// Copy of the given rows of a flat `dim`-wide matrix.
pub fn gather_rows(data: &[f32], dim: usize, ids: &[usize]) -> Vec<f32> {
    let mut out = Vec::with_capacity(ids.len() * dim);
    for &id in ids {
        out.extend_from_slice(&data[id * dim..(id + 1) * dim]);
    }
    out
}
