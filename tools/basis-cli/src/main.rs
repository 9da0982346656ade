// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use clap::{Args, Parser, Subcommand, ValueHint};
use op_nn::StateDict;
use op_pursuit::checkpoint::{describe, read_checkpoint};
use op_pursuit::codec::{self, ExclusionFilter};
use op_pursuit::BasisRecord;
use op_tensor::Device;
use serde::Serialize;
use std::error::Error;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::info;

type DynError = Box<dyn Error>;

type Result<T> = std::result::Result<T, DynError>;

#[derive(Parser)]
#[command(author, version, about = "Inspect and convert object pursuit basis files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the code of every basis in a directory as a plain vector file
    ExportCodes(ExportArgs),

    /// Wrap a plain vector file into a single-code basis record
    ImportCode(ImportArgs),

    /// Flatten a checkpoint or basis weights into one vector
    Flatten(FlattenArgs),

    /// List the tensors stored in a basis record or checkpoint
    Inspect(InspectArgs),
}

#[derive(Args)]
struct ExportArgs {
    /// Directory of `.json` basis files
    #[arg(long, value_hint = ValueHint::DirPath)]
    bases: PathBuf,

    /// Destination directory for `.vec` files
    #[arg(long, value_hint = ValueHint::DirPath)]
    out: PathBuf,
}

#[derive(Args)]
struct ImportArgs {
    #[arg(long, value_hint = ValueHint::FilePath)]
    vector: PathBuf,

    #[arg(long, value_hint = ValueHint::FilePath)]
    record: PathBuf,
}

#[derive(Args)]
struct FlattenArgs {
    /// Checkpoint (`.json` or bincode) or basis record with weights
    #[arg(long, value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Vector output
    #[arg(long, value_hint = ValueHint::FilePath)]
    out: PathBuf,

    /// Optional JSON file receiving the (name, shape) layout
    #[arg(long, value_hint = ValueHint::FilePath)]
    layout: Option<PathBuf>,

    /// Skip names starting with this prefix (repeatable)
    #[arg(long = "exclude-prefix")]
    exclude_prefixes: Vec<String>,

    /// Skip names ending with this suffix (repeatable)
    #[arg(long = "exclude-suffix")]
    exclude_suffixes: Vec<String>,

    /// Drop backbone tensors and batch-norm statistics
    #[arg(long)]
    head_only: bool,
}

#[derive(Args)]
struct InspectArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    path: PathBuf,

    /// Print JSON instead of one line per tensor
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct TensorLine {
    name: String,
    shape: Vec<usize>,
}

fn main() {
    if let Err(err) = op_config::tracing::init_tracing() {
        eprintln!("warning: tracing disabled: {err}");
    }
    let result = try_main();
    op_config::tracing::flush_chrome_trace();
    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Command::ExportCodes(args) => run_export(args),
        Command::ImportCode(args) => run_import(args),
        Command::Flatten(args) => run_flatten(args),
        Command::Inspect(args) => run_inspect(args),
    }
}

fn run_export(args: &ExportArgs) -> Result<()> {
    let written = codec::export_codes(&args.bases, &args.out)?;
    for path in &written {
        println!("{}", path.display());
    }
    info!(count = written.len(), "codes exported");
    Ok(())
}

fn run_import(args: &ImportArgs) -> Result<()> {
    let len = codec::import_code(&args.vector, &args.record)?;
    println!("{} <- {} values", args.record.display(), len);
    Ok(())
}

/// Basis records keep weights under `weights`; anything else is read as a
/// flat checkpoint.
fn load_weights(path: &Path) -> Result<StateDict> {
    if let Ok(record) = BasisRecord::read(path) {
        return match record.weight_map(Device::Cpu)? {
            Some(weights) => Ok(weights),
            None => Err(Box::new(io::Error::new(
                ErrorKind::InvalidData,
                format!("{} holds a code but no weights", path.display()),
            ))),
        };
    }
    Ok(read_checkpoint(path)?)
}

fn run_flatten(args: &FlattenArgs) -> Result<()> {
    let mut filter = if args.head_only {
        ExclusionFilter::head_parameters()
    } else {
        ExclusionFilter::new()
    };
    filter.prefixes.extend(args.exclude_prefixes.iter().cloned());
    filter.suffixes.extend(args.exclude_suffixes.iter().cloned());

    let weights = load_weights(&args.input)?;
    let flat = codec::flatten(&weights, &filter);
    if flat.is_empty() {
        return Err(Box::new(io::Error::new(
            ErrorKind::InvalidInput,
            "every tensor was excluded",
        )));
    }
    codec::write_vector(&args.out, &flat.values)?;
    if let Some(layout) = &args.layout {
        fs::write(layout, serde_json::to_string_pretty(&flat.layout)?)?;
    }
    println!(
        "{} tensors, {} values -> {}",
        flat.layout.len(),
        flat.len(),
        args.out.display()
    );
    Ok(())
}

fn run_inspect(args: &InspectArgs) -> Result<()> {
    let mut lines = Vec::new();
    if let Ok(record) = BasisRecord::read(&args.path) {
        lines.push(TensorLine {
            name: "z".to_string(),
            shape: record.z.shape.clone(),
        });
        if let Some(coefficients) = &record.coefficients {
            lines.push(TensorLine {
                name: "coefficients".to_string(),
                shape: coefficients.shape.clone(),
            });
        }
        for (name, tensor) in record.weights.iter().flatten() {
            lines.push(TensorLine {
                name: format!("weights.{name}"),
                shape: tensor.shape.clone(),
            });
        }
    } else {
        let state = read_checkpoint(&args.path)?;
        lines.extend(
            describe(&state)
                .into_iter()
                .map(|(name, shape)| TensorLine { name, shape }),
        );
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&lines)?);
    } else {
        for line in &lines {
            println!("{} {:?}", line.name, line.shape);
        }
    }
    Ok(())
}
