// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the two subcommands, `evaluate` and `build-memory`,
// and all their configurable flags. Both take the same flags;
// build-memory ignores the evaluation-only ones.
//
// clap's derive macros automatically generate:
//   - help text (--help)
//   - error messages for missing args
//   - type conversion (string → usize, f64, PathBuf, etc.)
//
// Reference: Rust Book §12 (Building a CLI Program)

use std::path::PathBuf;

use clap::{Args, Subcommand};

use hbird_eval::application::config::HbirdConfig;
use hbird_eval::retrieval::index::{AnnParams, DistanceMeasure};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the memory bank, retrieve neighbours for every val patch
    /// and report mIoU
    Evaluate(EvaluateArgs),

    /// Build the memory bank (and optionally the index) and save it
    BuildMemory(EvaluateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    // ── Input ──
    /// Side length images are resized to before patch extraction
    #[arg(long, default_value_t = 224)]
    pub input_size: usize,

    /// Side length of one square patch; must divide input_size
    #[arg(long, default_value_t = 16)]
    pub patch_size: usize,

    /// Dataset identifier (only "voc")
    #[arg(long, default_value = "voc")]
    pub dataset_name: String,

    /// Root of the VOC tree (ImageSets/, JPEGImages/, SegmentationClassAug/)
    #[arg(long, default_value = "data/VOCSegmentation")]
    pub data_dir: PathBuf,

    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    /// Augmented passes over the training split during memory creation
    #[arg(long, default_value_t = 1)]
    pub augmentation_epoch: usize,

    /// Only use the first N training images
    #[arg(long)]
    pub num_train_samples: Option<usize>,

    // ── Model ──
    /// cpu or wgpu
    #[arg(long, default_value = "cpu")]
    pub device: String,

    /// Patch feature dimension
    #[arg(long, default_value_t = 768)]
    pub d_model: usize,

    /// Burn record file replacing the random projection weights
    #[arg(long)]
    pub extractor_weights: Option<PathBuf>,

    // ── Propagation ──
    /// Neighbours retrieved per query patch
    #[arg(long, default_value_t = 30)]
    pub num_neighbour: usize,

    /// Memory bank rows; unbounded when omitted
    #[arg(long)]
    pub memory_size: Option<usize>,

    /// Softmax temperature of the label vote
    #[arg(long, default_value_t = 0.02)]
    pub temperature: f64,

    // ── Index ──
    #[arg(long, default_value = "dot_product")]
    pub distance_measure: DistanceMeasure,

    #[arg(long, default_value_t = 512)]
    pub num_leaves: usize,

    #[arg(long, default_value_t = 32)]
    pub num_leaves_to_search: usize,

    /// Rows used to train leaves and codebooks (default: whole bank)
    #[arg(long)]
    pub training_sample_size: Option<usize>,

    #[arg(long, default_value_t = 0.2)]
    pub anisotropic_quantization_threshold: f32,

    #[arg(long, default_value_t = 4)]
    pub dimensions_per_block: usize,

    /// Candidates rescored exactly before the top k are taken
    #[arg(long, default_value_t = 120)]
    pub num_reordering_candidates: usize,

    #[arg(long, default_value_t = 10)]
    pub kmeans_iterations: usize,

    // ── Artifacts ──
    #[arg(long)]
    pub feature_memory_path: Option<PathBuf>,

    #[arg(long)]
    pub label_memory_path: Option<PathBuf>,

    #[arg(long)]
    pub nn_index_path: Option<PathBuf>,

    /// Restore the memory stores instead of rebuilding them
    #[arg(long)]
    pub load_memory: bool,

    /// Keep retrieved keys, values and aggregated labels
    #[arg(long)]
    pub return_knn_details: bool,

    /// Directory for per_class_iou.csv and run_config.json
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

/// Convert CLI args into the application-layer HbirdConfig.
/// The application layer never sees clap types.
impl From<EvaluateArgs> for HbirdConfig {
    fn from(a: EvaluateArgs) -> Self {
        HbirdConfig {
            input_size:          a.input_size,
            patch_size:          a.patch_size,
            dataset_name:        a.dataset_name,
            data_dir:            a.data_dir,
            batch_size:          a.batch_size,
            augmentation_epoch:  a.augmentation_epoch,
            device:              a.device,
            num_neighbour:       a.num_neighbour,
            ann: AnnParams {
                distance_measure:                   a.distance_measure,
                num_leaves:                         a.num_leaves,
                num_leaves_to_search:               a.num_leaves_to_search,
                anisotropic_quantization_threshold: a.anisotropic_quantization_threshold,
                num_reordering_candidates:          a.num_reordering_candidates,
                dimensions_per_block:               a.dimensions_per_block,
                training_sample_size:               a.training_sample_size,
                kmeans_iterations:                  a.kmeans_iterations,
            },
            memory_size:         a.memory_size,
            temperature:         a.temperature,
            d_model:             a.d_model,
            num_train_samples:   a.num_train_samples,
            feature_memory_path: a.feature_memory_path,
            label_memory_path:   a.label_memory_path,
            nn_index_path:       a.nn_index_path,
            load_memory:         a.load_memory,
            return_knn_details:  a.return_knn_details,
            seed:                a.seed,
            extractor_weights:   a.extractor_weights,
            output_dir:          a.output_dir,
        }
    }
}
