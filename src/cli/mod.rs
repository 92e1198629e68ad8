// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// This is the entry point for all user interaction.
// It uses the `clap` crate to parse command line arguments.
// All business logic is delegated to Layer 2 (application).
//
// Two commands are supported:
//   1. `train`  — trains a tagger on labeled .jsonl corpora
//   2. `decode` — tags a raw corpus with the best checkpoint
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, DecodeArgs, TrainArgs};

/// The main CLI struct; clap generates the parser from its fields.
#[derive(Parser, Debug)]
#[command(
    name = "doc-ner",
    version = "0.1.0",
    about = "Two-stage, memory-augmented sequence labeling over whole documents."
)]
pub struct Cli {
    /// The subcommand to run (train or decode)
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Dispatch to the matching use case. The CLI layer only routes.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args)  => run_train(args),
            Commands::Decode(args) => run_decode(args),
        }
    }
}

/// Handles the `train` subcommand.
fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    tracing::info!("Starting training on '{}'", args.train);

    let summary = TrainUseCase::new(args.into()).execute()?;

    match summary.best {
        Some(best) => println!(
            "Training complete. Best epoch {} of {} (dev {:.4}).",
            best.epoch, summary.epochs, best.dev_score
        ),
        None => println!("Training complete. No epoch was run; nothing saved."),
    }
    Ok(())
}

/// Handles the `decode` subcommand.
fn run_decode(args: DecodeArgs) -> Result<()> {
    use crate::application::decode_use_case::DecodeUseCase;

    let mut use_case = DecodeUseCase::new(args.model_dir)?;
    let summary      = use_case.decode(&args.raw, args.output)?;

    println!(
        "Tagged {} documents ({} tokens, {} refined) → {}",
        summary.documents,
        summary.tokens,
        summary.uncertain,
        summary.output_path.display()
    );
    if let Some(e) = summary.evaluation {
        println!(
            "acc={:.4} p={:.4} r={:.4} f1={:.4}",
            e.accuracy(), e.precision(), e.recall(), e.f1()
        );
    }
    Ok(())
}
