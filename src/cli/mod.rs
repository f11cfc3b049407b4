// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// This is the entry point for all user interaction.
// It uses the `clap` crate to parse command line arguments.
// All business logic is delegated to Layer 2 (application).
//
// Two commands are supported:
//   1. `evaluate`     — build or load the memory, score the val split
//   2. `build-memory` — build the memory (and index) and save it
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, EvaluateArgs};

use hbird_eval::application::eval_use_case::{EvalSummary, EvalUseCase};
use hbird_eval::application::memory_use_case::MemoryUseCase;

#[derive(Parser, Debug)]
#[command(
    name = "hbird-eval",
    version = "0.1.0",
    about = "Evaluate dense patch features by nearest-neighbour label propagation."
)]
pub struct Cli {
    /// The subcommand to run (evaluate or build-memory)
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Match on the subcommand and dispatch to the correct use case.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Evaluate(args)    => run_evaluate(args),
            Commands::BuildMemory(args) => run_build_memory(args),
        }
    }
}

fn run_evaluate(args: EvaluateArgs) -> Result<()> {
    tracing::info!("Starting evaluation on '{}' at {}", args.dataset_name, args.data_dir.display());

    let summary = EvalUseCase::new(args.into()).execute()?;
    print_summary(&summary);
    Ok(())
}

fn run_build_memory(args: EvaluateArgs) -> Result<()> {
    let summary = MemoryUseCase::new(args.into()).execute()?;

    println!(
        "Memory bank saved: {} rows → '{}', '{}'",
        summary.rows,
        summary.feature_path.display(),
        summary.label_path.display()
    );
    if let Some(index) = &summary.index_path {
        println!("Neighbor index saved → '{}'", index.display());
    }
    Ok(())
}

fn print_summary(summary: &EvalSummary) {
    let report = &summary.report;
    println!("\nmIoU: {:.4}  ({} memory rows)", report.mean_iou, summary.memory_rows);
    println!("{:>6}  {:>8}", "class", "IoU");
    for (class, iou) in report.jaccard.iter().enumerate() {
        if iou.is_finite() {
            println!("{:>6}  {:>8.4}", class, iou);
        } else {
            println!("{:>6}  {:>8}", class, "-");
        }
    }
    if let Some(knn) = &summary.knn {
        println!("Kept kNN details for {} queries (k = {})", knn.shape[0], knn.shape[1]);
    }
    if let Some(csv) = &summary.csv_path {
        println!("Per-class table written to '{}'", csv.display());
    }
}
