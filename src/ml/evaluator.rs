// ============================================================
// Layer 6 — Hummingbird Evaluator
// ============================================================
// Dense label propagation in two phases:
//
//   create_memory (once)
//     for epoch in 0..augmentation_epoch:
//       for batch in train:
//         features = extractor(images)             [B, R·R, D]
//         labels   = patch soft labels (255 → 0)   [B, R·R, C]
//         bounded? → sampler keeps the rare-class patches
//         bank.append(features, labels)
//
//   evaluate (consumes the evaluator)
//     for batch in val:
//       features  = extractor(images)              [B, N, D]
//       ids       = index.search_batched(features) [B·N, k]
//       keys      = bank rows of ids               [B, N, k, D]
//       values    = bank labels of ids             [B, N, k, C]
//       soft      = cross_attention(...)           [B, N, C]
//       pred      = argmax(upsample(soft → H×W))   [B, H, W]
//       metric.update(gt, pred) over pixels ≠ 255
//     report = metric.compute()
//     drop index, release bank
//
// The bank stays in host memory; each batch uploads only the
// rows its queries retrieved.

use burn::{prelude::*, tensor::TensorData};
use rand::{rngs::StdRng, SeedableRng};

use crate::data::patchify::PatchGrid;
use crate::data::sampler::MemorySampler;
use crate::domain::error::{HbirdError, HbirdResult};
use crate::domain::label_map::{SegmentationBatch, IGNORE_LABEL};
use crate::domain::traits::{MetricReport, SegmentationMetric, SegmentationSource};
use crate::ml::attention::cross_attention;
use crate::ml::extractor::FeatureExtractor;
use crate::ml::upsample::upsample_bilinear;
use crate::retrieval::index::{AnnParams, NeighborIndex, NeighborIndexBuilder, SearchResults};
use crate::retrieval::memory_bank::{MemoryBank, MemoryBankBuilder};
use crate::retrieval::vector::gather_rows;

/// Everything the evaluator needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct EvaluatorSettings {
    pub num_neighbour:      usize,
    pub augmentation_epoch: usize,
    pub num_classes:        usize,
    /// `None` keeps every patch (unbounded bank).
    pub memory_size:        Option<usize>,
    pub dataset_size:       usize,
    pub temperature:        f64,
    pub seed:               u64,
    pub ann:                AnnParams,
}

/// Raw retrieval data kept for inspection when requested.
#[derive(Debug, Clone, Default)]
pub struct KnnDetails {
    pub key_features:      Vec<f32>,
    pub key_labels:        Vec<f32>,
    pub aggregated_labels: Vec<f32>,
    /// `[queries, k, D, C]` across all evaluation batches.
    pub shape:             [usize; 4],
}

#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub report: MetricReport,
    pub knn:    Option<KnnDetails>,
}

/// Neighbours of a query batch, with their bank rows gathered.
#[derive(Debug, Clone)]
pub struct NearestKeys {
    pub neighbors: SearchResults,
    /// `[queries · k, D]`
    pub keys:      Vec<f32>,
    /// `[queries · k, C]`
    pub values:    Vec<f32>,
}

pub struct HbirdEvaluator<B: Backend, E: FeatureExtractor<B>> {
    extractor: E,
    device:    B::Device,
    bank:      MemoryBank,
    index:     NeighborIndex,
    settings:  EvaluatorSettings,
}

// ─── Host ↔ device ────────────────────────────────────────────────────────────

fn upload<B: Backend, const D: usize>(values: Vec<f32>, shape: [usize; D], device: &B::Device) -> Tensor<B, D> {
    Tensor::from_data(TensorData::new(values, shape), device)
}

fn download<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

fn download_indices<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Vec<usize> {
    tensor.into_data().iter::<i64>().map(|v| v.max(0) as usize).collect()
}

fn images_on<B: Backend>(batch: &SegmentationBatch, device: &B::Device) -> Tensor<B, 4> {
    upload(batch.images.clone(), batch.image_shape(), device)
}

impl<B: Backend, E: FeatureExtractor<B>> HbirdEvaluator<B, E> {
    pub fn new(
        extractor: E,
        device:    B::Device,
        bank:      MemoryBank,
        index:     NeighborIndex,
        settings:  EvaluatorSettings,
    ) -> HbirdResult<Self> {
        if index.len() != bank.len() || index.dim() != bank.dim() {
            return Err(HbirdError::IndexBuild(format!(
                "index covers {} rows of {} dims, bank has {} rows of {} dims",
                index.len(),
                index.dim(),
                bank.len(),
                bank.dim()
            )));
        }
        if bank.dim() != extractor.d_model() || bank.num_classes() != settings.num_classes {
            return Err(HbirdError::shape(
                format!("bank of {}-dim features and {} classes", extractor.d_model(), settings.num_classes),
                format!("{}-dim features and {} classes", bank.dim(), bank.num_classes()),
            ));
        }
        Ok(Self { extractor, device, bank, index, settings })
    }

    pub fn bank(&self) -> &MemoryBank { &self.bank }

    // ── Memory creation ──────────────────────────────────────────────────────

    /// Run the extractor over `augmentation_epoch` passes of the training
    /// data and collect (feature, soft label) rows.
    pub fn create_memory<S: SegmentationSource + ?Sized>(
        extractor: &E,
        source:    &S,
        settings:  &EvaluatorSettings,
        device:    &B::Device,
    ) -> HbirdResult<MemoryBank> {
        let resolution  = extractor.eval_spatial_resolution();
        let dim         = extractor.d_model();
        let num_classes = settings.num_classes;

        let (mut builder, sampler) = match settings.memory_size {
            None => (MemoryBankBuilder::unbounded(dim, num_classes), None),
            Some(memory_size) => {
                let per_image = MemorySampler::num_sampled_for(
                    memory_size,
                    settings.dataset_size,
                    settings.augmentation_epoch,
                )?;
                tracing::info!(
                    "Bounded memory: {} rows, {} patches sampled per image",
                    memory_size,
                    per_image
                );
                (
                    MemoryBankBuilder::bounded(memory_size, dim, num_classes),
                    Some(MemorySampler::new(per_image, num_classes)),
                )
            }
        };
        let mut rng = StdRng::seed_from_u64(settings.seed);

        for epoch in 0..settings.augmentation_epoch {
            let loader = source.train_loader(epoch)?;
            for (i, batch) in loader.iter().enumerate() {
                let batch = batch?;
                let [b, _, height, width] = batch.image_shape();
                let patch_size = patch_size_for(height, width, resolution)?;

                // ── Features ──
                let patches = extractor.forward_features(images_on::<B>(&batch, device))?;
                let per_image = resolution * resolution;
                let features = download(patches);
                if features.len() != b * per_image * dim {
                    return Err(HbirdError::shape(
                        format!("[{b}, {per_image}, {dim}] patch features"),
                        features.len(),
                    ));
                }

                // ── Labels (ignore → class 0) ──
                let grid   = PatchGrid::from_labels(&batch.labels.remap_ignore_to_background(), patch_size)?;
                let labels = grid.soft_labels(num_classes)?;

                // ── Admit ──
                let slots = match &sampler {
                    None => builder.append(&features, &labels)?,
                    Some(sampler) => {
                        let rows: Vec<usize> = sampler
                            .sample(&grid, &mut rng)?
                            .into_iter()
                            .enumerate()
                            .flat_map(|(image, picked)| picked.into_iter().map(move |p| image * per_image + p))
                            .collect();
                        builder.append(
                            &gather_rows(&features, dim, &rows),
                            &gather_rows(&labels, num_classes, &rows),
                        )?
                    }
                };
                tracing::debug!("Epoch {} batch {}: wrote memory rows {:?}", epoch, i, slots);
            }
        }

        let bank = builder.finish();
        tracing::info!("Memory bank ready: {} rows × {} dims", bank.len(), bank.dim());
        Ok(bank)
    }

    /// Build the neighbor index over a finished bank.
    pub fn build_index(bank: &MemoryBank, settings: &EvaluatorSettings) -> HbirdResult<NeighborIndex> {
        let index = NeighborIndexBuilder::from_params(bank.features(), bank.dim(), settings.num_neighbour, &settings.ann)
            .seed(settings.seed)
            .build()?;
        tracing::info!("Neighbor index ready: {} rows in {} leaves", index.len(), index.num_leaves());
        Ok(index)
    }

    /// Neighbour ids for every `D`-wide query row plus their bank rows.
    pub fn find_nearest_key_to_query(&self, queries: &[f32]) -> HbirdResult<NearestKeys> {
        nearest_keys(&self.bank, &self.index, queries)
    }

    // ── Evaluation ───────────────────────────────────────────────────────────

    /// Score the validation split. The bank and index are released when
    /// this returns, whether it succeeded or not.
    pub fn evaluate<S, M>(
        self,
        source:             &S,
        metric:             &mut M,
        return_knn_details: bool,
    ) -> HbirdResult<EvaluationOutcome>
    where
        S: SegmentationSource + ?Sized,
        M: SegmentationMetric + ?Sized,
    {
        let HbirdEvaluator { extractor, device, bank, index, settings } = self;
        let outcome = run_evaluation(&extractor, &device, &bank, &index, &settings, source, metric, return_knn_details);

        drop(index);
        let bytes = bank.release();
        tracing::info!("Released memory bank and index ({:.1} MiB)", bytes as f64 / (1024.0 * 1024.0));
        outcome
    }
}

fn patch_size_for(height: usize, width: usize, resolution: usize) -> HbirdResult<usize> {
    if resolution == 0 || height != width || width % resolution != 0 {
        return Err(HbirdError::InvalidShape(format!(
            "{height}x{width} images do not split into a {resolution}x{resolution} patch grid"
        )));
    }
    Ok(width / resolution)
}

fn nearest_keys(bank: &MemoryBank, index: &NeighborIndex, queries: &[f32]) -> HbirdResult<NearestKeys> {
    let neighbors = index.search_batched(queries)?;
    let keys      = bank.gather_features(&neighbors.ids)?;
    let values    = bank.gather_labels(&neighbors.ids)?;
    Ok(NearestKeys { neighbors, keys, values })
}

#[allow(clippy::too_many_arguments)]
fn run_evaluation<B, E, S, M>(
    extractor:          &E,
    device:             &B::Device,
    bank:               &MemoryBank,
    index:              &NeighborIndex,
    settings:           &EvaluatorSettings,
    source:             &S,
    metric:             &mut M,
    return_knn_details: bool,
) -> HbirdResult<EvaluationOutcome>
where
    B: Backend,
    E: FeatureExtractor<B>,
    S: SegmentationSource + ?Sized,
    M: SegmentationMetric + ?Sized,
{
    let resolution  = extractor.eval_spatial_resolution();
    let num_classes = settings.num_classes;
    let mut details = return_knn_details.then(KnnDetails::default);

    let loader = source.val_loader()?;
    for (i, batch) in loader.iter().enumerate() {
        let batch = batch?;
        let [b, _, height, width] = batch.image_shape();

        // ── Retrieve ──
        let features = extractor.forward_features(images_on::<B>(&batch, device))?;
        let [_, n, d] = features.dims();
        if n != resolution * resolution {
            return Err(HbirdError::shape(resolution * resolution, n));
        }
        let found = nearest_keys(bank, index, &download(features.clone()))?;
        let k     = found.neighbors.k;

        // ── Aggregate ──
        let keys   = upload::<B, 4>(found.keys.clone(), [b, n, k, d], device);
        let values = upload::<B, 4>(found.values.clone(), [b, n, k, num_classes], device);
        let soft   = cross_attention(features, keys, values, settings.temperature)?;

        // ── Upsample + arg-max ──
        let logits = soft
            .clone()
            .reshape([b, resolution, resolution, num_classes])
            .permute([0, 3, 1, 2]);
        let upsampled = upsample_bilinear(logits, [height, width]);
        let predicted = download_indices(upsampled.argmax(1).reshape([b, height, width]));

        // ── Score valid pixels only ──
        let (ground_truth, predicted): (Vec<usize>, Vec<usize>) = batch
            .labels
            .data
            .iter()
            .zip(predicted)
            .filter(|(gt, _)| **gt != IGNORE_LABEL)
            .map(|(&gt, p)| (gt as usize, p))
            .unzip();
        metric.update(&ground_truth, &predicted)?;
        tracing::debug!("Val batch {}: scored {} pixels", i, ground_truth.len());

        if let Some(details) = details.as_mut() {
            details.key_features.extend_from_slice(&found.keys);
            details.key_labels.extend_from_slice(&found.values);
            details.aggregated_labels.extend(download(soft));
            details.shape = [details.shape[0] + b * n, k, d, num_classes];
        }
    }

    let report = metric.compute();
    tracing::info!("Evaluation finished: mIoU = {:.4}", report.mean_iou);
    Ok(EvaluationOutcome { report, knn: details })
}
