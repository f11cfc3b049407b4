// ============================================================
// Layer 7 — Segmentation Metrics
// ============================================================
// ConfusionMatrixIoU accumulates a C×C confusion matrix over
// every scored pixel of an evaluation run:
//
//   confusion[gt][pred] += 1
//
//   tp[c] = confusion[c][c]
//   fp[c] = Σ_gt confusion[gt][c] − tp[c]
//   fn[c] = Σ_pred confusion[c][pred] − tp[c]
//   IoU_c = tp / (tp + fp + fn)        (NaN when the union is empty)
//   mIoU  = mean of the finite IoU_c
//
// Predictions are class ids, so cluster c is matched to class c.
// Updating per batch gives the same matrix as one update over
// the concatenated pixels.
//
// MetricsLogger writes the per-class table to CSV:
//
//   class,jaccard,tp,fp,fn
//   0,0.912345,10234,812,166
//   ...
//   mean,0.734512,,,

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use crate::domain::error::{HbirdError, HbirdResult};
use crate::domain::traits::{MetricReport, SegmentationMetric};

#[derive(Debug, Clone)]
pub struct ConfusionMatrixIoU {
    num_classes: usize,
    /// Row-major `[gt][pred]`.
    confusion:   Vec<u64>,
}

impl ConfusionMatrixIoU {
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes, confusion: vec![0; num_classes * num_classes] }
    }

    pub fn num_classes(&self) -> usize { self.num_classes }

    pub fn confusion(&self, ground_truth: usize, predicted: usize) -> u64 {
        self.confusion[ground_truth * self.num_classes + predicted]
    }
}

impl SegmentationMetric for ConfusionMatrixIoU {
    fn update(&mut self, ground_truth: &[usize], predicted: &[usize]) -> HbirdResult<()> {
        if ground_truth.len() != predicted.len() {
            return Err(HbirdError::shape(
                format!("{} predictions", ground_truth.len()),
                predicted.len(),
            ));
        }
        let c = self.num_classes;
        if let Some(&bad) = ground_truth.iter().chain(predicted).find(|&&v| v >= c) {
            return Err(HbirdError::InvalidLabel { label: bad, num_classes: c });
        }
        for (&gt, &pred) in ground_truth.iter().zip(predicted) {
            self.confusion[gt * c + pred] += 1;
        }
        Ok(())
    }

    fn compute(&self) -> MetricReport {
        let c = self.num_classes;
        let mut tp  = vec![0u64; c];
        let mut fp  = vec![0u64; c];
        let mut fn_ = vec![0u64; c];

        for class in 0..c {
            let hit       = self.confusion(class, class);
            let predicted = (0..c).map(|gt| self.confusion(gt, class)).sum::<u64>();
            let actual    = (0..c).map(|p| self.confusion(class, p)).sum::<u64>();
            tp[class]  = hit;
            fp[class]  = predicted - hit;
            fn_[class] = actual - hit;
        }

        let jaccard: Vec<f64> = (0..c)
            .map(|k| {
                let union = tp[k] + fp[k] + fn_[k];
                if union == 0 { f64::NAN } else { tp[k] as f64 / union as f64 }
            })
            .collect();

        let finite: Vec<f64> = jaccard.iter().copied().filter(|j| j.is_finite()).collect();
        let mean_iou = if finite.is_empty() {
            0.0
        } else {
            finite.iter().sum::<f64>() / finite.len() as f64
        };

        MetricReport {
            jaccard,
            tp,
            fp,
            fn_,
            matched_clusters: (0..c).collect(),
            mean_iou,
        }
    }
}

/// Writes metric reports as CSV into an output directory.
pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    pub fn new(dir: &Path) -> HbirdResult<Self> {
        fs::create_dir_all(dir).map_err(|e| HbirdError::io(dir, e))?;
        Ok(Self { csv_path: dir.join("per_class_iou.csv") })
    }

    /// Overwrite the CSV with one row per class plus a mean row.
    pub fn log(&self, report: &MetricReport) -> HbirdResult<()> {
        let io = |e| HbirdError::io(&self.csv_path, e);
        let mut f = File::create(&self.csv_path).map_err(io)?;

        writeln!(f, "class,jaccard,tp,fp,fn").map_err(io)?;
        for class in 0..report.jaccard.len() {
            writeln!(
                f,
                "{},{:.6},{},{},{}",
                class,
                report.jaccard[class],
                report.tp[class],
                report.fp[class],
                report.fn_[class],
            )
            .map_err(io)?;
        }
        writeln!(f, "mean,{:.6},,,", report.mean_iou).map_err(io)?;

        tracing::debug!("Wrote per-class IoU to '{}'", self.csv_path.display());
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_jaccard() {
        let mut m = ConfusionMatrixIoU::new(3);
        m.update(&[0, 0, 1, 1], &[0, 1, 1, 1]).unwrap();
        let r = m.compute();

        assert_eq!(r.tp, vec![1, 2, 0]);
        assert_eq!(r.fp, vec![0, 1, 0]);
        assert_eq!(r.fn_, vec![1, 0, 0]);
        assert!((r.jaccard[0] - 0.5).abs() < 1e-12);
        assert!((r.jaccard[1] - 2.0 / 3.0).abs() < 1e-12);
        // Class 2 never appears: excluded from the mean.
        assert!(r.jaccard[2].is_nan());
        assert!((r.mean_iou - (0.5 + 2.0 / 3.0) / 2.0).abs() < 1e-12);
        assert_eq!(r.matched_clusters, vec![0, 1, 2]);
    }

    #[test]
    fn test_batched_updates_match_single_update() {
        let gt   = [0, 1, 2, 2, 1, 0, 0];
        let pred = [0, 2, 2, 1, 1, 0, 1];

        let mut whole = ConfusionMatrixIoU::new(3);
        whole.update(&gt, &pred).unwrap();

        let mut split = ConfusionMatrixIoU::new(3);
        split.update(&gt[..3], &pred[..3]).unwrap();
        split.update(&gt[3..], &pred[3..]).unwrap();

        assert_eq!(whole.compute().tp, split.compute().tp);
        assert_eq!(whole.compute().mean_iou, split.compute().mean_iou);
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut m = ConfusionMatrixIoU::new(2);
        assert!(m.update(&[0, 1], &[0]).is_err());
        assert!(matches!(m.update(&[0, 2], &[0, 0]), Err(HbirdError::InvalidLabel { label: 2, .. })));
    }

    #[test]
    fn test_logger_writes_csv() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = ConfusionMatrixIoU::new(2);
        m.update(&[0, 1], &[0, 1]).unwrap();

        let logger = MetricsLogger::new(dir.path()).unwrap();
        logger.log(&m.compute()).unwrap();

        let csv = fs::read_to_string(logger.csv_path()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "class,jaccard,tp,fp,fn");
        assert_eq!(lines[1], "0,1.000000,1,0,0");
        assert_eq!(lines[3], "mean,1.000000,,,");
    }
}
