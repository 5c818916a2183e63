use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use slice_circuit::synthetic::SyntheticModel;
use slice_circuit::{ProofFile, Tensor};
use slice_pipeline::fsutil::read_json;
use slice_pipeline::input::{seeded_input, InputContext, InputFile};
use slice_pipeline::{
    verify_chain, Pipeline, PipelineConfig, RunId, RunManager, Session, SliceHandler,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "slice-pipeline", version, about = "Slice-by-slice inference proofs")]
struct Cli {
    #[command(flatten)]
    paths: PathArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PathArgs {
    /// JSON configuration file; flags and environment override its fields.
    #[arg(long, global = true, env = "SLICE_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, global = true, env = "SLICE_PATH")]
    slice_path: Option<PathBuf>,
    #[arg(long, global = true, env = "SLICE_RUN_ROOT")]
    run_root: Option<PathBuf>,
    #[arg(long, global = true, env = "SLICE_MODEL_ROOT")]
    model_root: Option<PathBuf>,
    #[arg(long, global = true, env = "SLICE_SLICES_DIR")]
    slices_dir: Option<String>,
    #[arg(long, global = true, env = "SLICE_PROOF_TIMEOUT_SECS")]
    proof_timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold a synthetic sliced model with compiled circuits and keys.
    Synth {
        #[arg(long, default_value_t = 5)]
        slices: u32,
        #[arg(long, default_value_t = 8)]
        width: usize,
        #[arg(long, default_value_t = 16)]
        hidden: usize,
        #[arg(long, default_value = "synthetic-model")]
        seed: String,
    },
    /// Run every slice of the model in a fresh run.
    Run {
        #[command(flatten)]
        source: InputSource,
        /// Write the aggregate proof manifest here.
        #[arg(long)]
        aggregate_out: Option<PathBuf>,
    },
    /// Write input.json for the configured slice.
    Input {
        #[command(flatten)]
        source: InputSource,
        #[arg(long)]
        run: Option<String>,
    },
    Witness {
        #[arg(long)]
        run: Option<String>,
    },
    Prove {
        #[arg(long)]
        run: Option<String>,
    },
    Verify {
        /// proof.json to check.
        #[arg(long)]
        proof: PathBuf,
        /// input.json the verifier holds; binds the input instance.
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        run: Option<String>,
    },
    /// Print the latest run's results.
    Latest,
    /// Check whether every slice of a run verified.
    Status {
        #[arg(long)]
        run: Option<String>,
    },
    /// Delete one run, or every unlocked run.
    Cleanup {
        #[arg(long, conflicts_with = "all")]
        run: Option<String>,
        #[arg(long)]
        all: bool,
    },
}

#[derive(Args)]
struct InputSource {
    /// input.json to use verbatim.
    #[arg(long, conflicts_with = "seed")]
    input: Option<PathBuf>,
    /// Seed for a deterministic input.
    #[arg(long)]
    seed: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    let config = load_config(&cli.paths)?;
    match cli.command {
        Commands::Synth {
            slices,
            width,
            hidden,
            seed,
        } => cmd_synth(&config, slices, width, hidden, &seed),
        Commands::Run {
            source,
            aggregate_out,
        } => cmd_run(&config, &source, aggregate_out.as_deref()),
        Commands::Input { source, run } => cmd_input(&config, &source, run.as_deref()),
        Commands::Witness { run } => {
            let handler = handler(&config)?;
            let results = handler.generate_witness(&mut session(run.as_deref())?)?;
            print_json(&results)
        }
        Commands::Prove { run } => {
            let handler = handler(&config)?;
            let (proof, _instances) = handler.gen_proof(&mut session(run.as_deref())?)?;
            println!("{proof}");
            Ok(())
        }
        Commands::Verify { proof, input, run } => {
            cmd_verify(&config, &proof, input.as_deref(), run.as_deref())
        }
        Commands::Latest => {
            let runs = RunManager::new(run_root(&config)?);
            let run = runs.get_latest_run()?;
            print_json(run.results())
        }
        Commands::Status { run } => cmd_status(&config, run.as_deref()),
        Commands::Cleanup { run, all } => cmd_cleanup(&config, run.as_deref(), all),
    }
}

/// Run root from the chain configuration, or from the handler one when no
/// model root is set.
fn run_root(config: &PipelineConfig) -> Result<PathBuf> {
    if let Ok(chain) = config.resolve_chain() {
        return Ok(chain.run_root);
    }
    Ok(config.resolve_handler()?.run_root().to_path_buf())
}

fn load_config(args: &PathArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(path) = &args.slice_path {
        config.slice_path = Some(path.clone());
    }
    if let Some(path) = &args.run_root {
        config.run_root = Some(path.clone());
    }
    if let Some(path) = &args.model_root {
        config.model_root = Some(path.clone());
    }
    if let Some(dir) = &args.slices_dir {
        config.slices_dir = dir.clone();
    }
    if let Some(secs) = args.proof_timeout_secs {
        config.proof_timeout_secs = Some(secs);
    }
    Ok(config)
}

fn cmd_synth(
    config: &PipelineConfig,
    slices: u32,
    width: usize,
    hidden: usize,
    seed: &str,
) -> Result<()> {
    let chain = config.resolve_chain()?;
    let model = SyntheticModel {
        slices,
        width,
        hidden,
        seed: seed.as_bytes().to_vec(),
        ..SyntheticModel::default()
    };
    let written = model
        .write(&chain.model_root)
        .context("failed to write synthetic model")?;
    for dir in written {
        println!("{}", dir.display());
    }
    Ok(())
}

fn cmd_run(config: &PipelineConfig, source: &InputSource, aggregate_out: Option<&Path>) -> Result<()> {
    let chain = config.resolve_chain()?;
    let pipeline = Pipeline::load(&chain.model_root, chain.run_root, chain.options)?;
    let context = match input_tensor(source)? {
        Some(tensor) => InputContext::Sample(tensor),
        None => InputContext::Seed(source.seed.clone().unwrap_or_default().into_bytes()),
    };
    let mut run = pipeline.start_run()?;
    let outcome = run.run_all(context)?;
    if let Some(path) = aggregate_out {
        let manifest = serde_json::to_vec_pretty(&run.aggregate())?;
        std::fs::write(path, manifest)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    let proofs: Vec<_> = run.proofs().into_iter().map(|(_, proof)| proof).collect();
    if let Some(slice) = outcome.rejected {
        bail!("run {}: {slice} proof rejected", outcome.run_id);
    }
    let verdict = verify_chain(&pipeline.verifying_keys(), &proofs)?;
    info!(run = %outcome.run_id, accepted = verdict.accepted(), "chain verified");
    if !verdict.accepted() {
        bail!("run {}: chain does not link", outcome.run_id);
    }
    println!("{}", outcome.run_id);
    Ok(())
}

fn cmd_input(config: &PipelineConfig, source: &InputSource, run: Option<&str>) -> Result<()> {
    let handler = handler(config)?;
    let input = match input_tensor(source)? {
        Some(tensor) => tensor,
        None => {
            let seed = source.seed.clone().unwrap_or_default();
            seeded_input(handler.bundle().settings(), seed.as_bytes())?
        }
    };
    let mut session = session(run)?;
    let path = handler.gen_input_file(&mut session, &input)?;
    println!("{}", path.display());
    Ok(())
}

fn cmd_verify(
    config: &PipelineConfig,
    proof: &Path,
    input: Option<&Path>,
    run: Option<&str>,
) -> Result<()> {
    let handler = handler(config)?;
    let proof = ProofFile::load(proof).with_context(|| format!("failed to read {}", proof.display()))?;
    let inputs = match input {
        Some(path) => Some(read_json::<InputFile>(path)?.input_data),
        None => None,
    };
    let verified = handler.verify_proof(&mut session(run)?, inputs, &proof)?;
    println!("{verified}");
    if !verified {
        bail!("proof rejected");
    }
    Ok(())
}

fn cmd_status(config: &PipelineConfig, run: Option<&str>) -> Result<()> {
    let chain = config.resolve_chain()?;
    let pipeline = Pipeline::load(&chain.model_root, chain.run_root, chain.options)?;
    let runs = pipeline.run_manager();
    let record = match run {
        Some(id) => runs.open_run(&parse_run(id)?)?,
        None => runs.get_latest_run()?,
    };
    let complete = runs.check_run_completion(&record, &pipeline.slice_ids());
    println!("{} {}", record.id(), if complete { "complete" } else { "incomplete" });
    Ok(())
}

fn cmd_cleanup(config: &PipelineConfig, run: Option<&str>, all: bool) -> Result<()> {
    let runs = RunManager::new(run_root(config)?);
    match (run, all) {
        (Some(id), _) => {
            let record = runs.open_run(&parse_run(id)?)?;
            runs.cleanup_run(record)?;
            println!("removed {id}");
        }
        (None, true) => println!("removed {} runs", runs.cleanup_all()?),
        (None, false) => bail!("pass --run <id> or --all"),
    }
    Ok(())
}

fn handler(config: &PipelineConfig) -> Result<SliceHandler> {
    Ok(SliceHandler::new(&config.resolve_handler()?)?)
}

fn session(run: Option<&str>) -> Result<Session> {
    Ok(match run {
        Some(id) => Session::for_run(parse_run(id)?),
        None => Session::new(),
    })
}

fn parse_run(id: &str) -> Result<RunId> {
    id.parse::<RunId>()
        .with_context(|| format!("invalid run id {id:?}"))
}

fn input_tensor(source: &InputSource) -> Result<Option<Tensor>> {
    match &source.input {
        Some(path) => Ok(Some(read_json::<InputFile>(path)?.input_data)),
        None => Ok(None),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
