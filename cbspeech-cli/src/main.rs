//! cbspeech CLI: batch sentiment scoring of central-bank speeches.
//!
//! Commands:
//! - `plan`: load the corpus, chunk it and persist the plan
//! - `submit`: resume and submit every eligible chunk (`--wait` polls to the end)
//! - `status`: poll in-flight chunks once and print the lifecycle table
//! - `collect`: fetch completed results, validate, build and export the indices
//! - `run`: all of the above in one process

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use cbspeech_core::domain::{Institution, SpeechRecord};
use cbspeech_runner::corpus::{load_corpus, CorpusFilter};
use cbspeech_runner::pipeline::{
    advance_results, advance_submissions, plan_run, refresh_status, wait_for_completion,
    ResultsOutcome, RunContext,
};
use cbspeech_runner::report::{print_lifecycle, print_validation};
use cbspeech_runner::store::{LifecycleStore, PlanManifest};
use cbspeech_runner::transport::{
    BatchTransport, CircuitBreaker, OpenAiBatchTransport, OpenAiSettings, SimulatedTransport,
};
use cbspeech_runner::PipelineConfig;

#[derive(Parser)]
#[command(
    name = "cbspeech",
    about = "Central-bank speech sentiment indices via batch LLM scoring"
)]
struct Cli {
    /// Path to the TOML config. Missing file means all defaults.
    #[arg(long, global = true, default_value = "cbspeech.toml")]
    config: PathBuf,

    /// Run directory (overrides `[output] run_dir`).
    #[arg(long, global = true)]
    run_dir: Option<PathBuf>,

    /// Corpus file (overrides `[corpus] path`).
    #[arg(long, global = true)]
    corpus: Option<PathBuf>,

    /// First speech date, YYYY-MM-DD (overrides `[corpus] start`).
    #[arg(long, global = true)]
    start: Option<String>,

    /// Last speech date, YYYY-MM-DD (overrides `[corpus] end`).
    #[arg(long, global = true)]
    end: Option<String>,

    /// Restrict to these institutions (Fed, ECB).
    #[arg(long, global = true, value_delimiter = ',')]
    institutions: Vec<String>,

    /// Use the in-memory simulated provider with this seed. Its batches only
    /// live as long as the process, so pair it with `run` or `submit --wait`.
    #[arg(long, global = true)]
    simulate: Option<u64>,

    /// Debug-level logging (RUST_LOG still wins when set).
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the corpus, chunk it and persist the plan.
    Plan,
    /// Resume from the run directory and submit every eligible chunk.
    Submit {
        /// Keep polling until no chunk is validating or in progress.
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Poll in-flight chunks once and print the lifecycle table.
    Status {
        /// Print the lifecycle summary as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Fetch completed results, validate, aggregate and export.
    Collect,
    /// Plan, submit, wait and collect in one go.
    Run,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    match cli.command {
        Commands::Plan => {
            let store = LifecycleStore::open(&config.output.run_dir)?;
            let speeches = load_speeches(&config)?;
            let manifest = plan_run(&config, &store, &speeches)?;
            print_plan(&manifest, &config.output.run_dir);
            Ok(())
        }
        Commands::Submit { wait } => {
            let transport = build_transport(&config, cli.simulate)?;
            let mut ctx = RunContext::new(config, transport)?;
            run_submit(&mut ctx, wait)
        }
        Commands::Status { json } => {
            let transport = build_transport(&config, cli.simulate)?;
            let mut ctx = RunContext::new(config, transport)?;
            let sweep = refresh_status(&mut ctx)?;
            tracing::debug!(polled = sweep.polled, changed = sweep.changed, "status sweep");
            if json {
                println!("{}", serde_json::to_string_pretty(&ctx.lifecycle)?);
            } else {
                print_lifecycle(&ctx.lifecycle);
            }
            Ok(())
        }
        Commands::Collect => {
            let speeches = load_speeches(&config)?;
            let transport = build_transport(&config, cli.simulate)?;
            let mut ctx = RunContext::new(config, transport)?;
            run_collect(&mut ctx, &speeches)
        }
        Commands::Run => {
            let speeches = load_speeches(&config)?;
            let transport = build_transport(&config, cli.simulate)?;
            let mut ctx = RunContext::new(config, transport)?;
            let manifest = plan_run(&ctx.config, &ctx.store, &speeches)?;
            print_plan(&manifest, &ctx.config.output.run_dir);
            run_submit(&mut ctx, true)?;
            run_collect(&mut ctx, &speeches)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Parse the config file and apply flag overrides on top.
fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if let Some(dir) = &cli.run_dir {
        config.output.run_dir = dir.clone();
    }
    if let Some(path) = &cli.corpus {
        config.corpus.path = path.clone();
    }
    if let Some(start) = &cli.start {
        config.corpus.start = Some(parse_date(start)?);
    }
    if let Some(end) = &cli.end {
        config.corpus.end = Some(parse_date(end)?);
    }
    if !cli.institutions.is_empty() {
        config.corpus.institutions = cli
            .institutions
            .iter()
            .map(|s| s.parse::<Institution>().map_err(anyhow::Error::msg))
            .collect::<Result<_>>()?;
    }

    config.validate()?;
    Ok(config)
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
}

fn load_speeches(config: &PipelineConfig) -> Result<Vec<SpeechRecord>> {
    let filter = CorpusFilter::from(&config.corpus);
    let speeches = load_corpus(&config.corpus.path, &filter)
        .with_context(|| format!("loading corpus {}", config.corpus.path.display()))?;
    if speeches.is_empty() {
        bail!(
            "no speeches in {} match the configured date range and institutions",
            config.corpus.path.display()
        );
    }
    Ok(speeches)
}

fn build_transport(
    config: &PipelineConfig,
    simulate: Option<u64>,
) -> Result<Box<dyn BatchTransport>> {
    if let Some(seed) = simulate {
        tracing::info!(seed, "using simulated provider");
        return Ok(Box::new(SimulatedTransport::new(seed)));
    }
    let settings = OpenAiSettings::from_config(config)
        .context("OpenAI transport needs an API key (or pass --simulate <seed>)")?;
    let breaker = Arc::new(CircuitBreaker::default_provider());
    Ok(Box::new(OpenAiBatchTransport::new(settings, breaker)?))
}

fn run_submit(ctx: &mut RunContext, wait: bool) -> Result<()> {
    let outcome = advance_submissions(ctx)?;
    println!(
        "Submitted {} chunk(s), {} rejected, {} in flight, {} completed.",
        outcome.submitted, outcome.rejected, outcome.in_flight, outcome.completed
    );
    if wait {
        let sweeps = wait_for_completion(ctx)?;
        println!("Polled {sweeps} sweep(s).");
    }
    print_lifecycle(&ctx.lifecycle);
    Ok(())
}

fn run_collect(ctx: &mut RunContext, speeches: &[SpeechRecord]) -> Result<()> {
    let outcome = advance_results(ctx, speeches)?;
    print_results(&outcome, &ctx.config.output.run_dir);
    print_validation(&ctx.validation);
    if !ctx.lifecycle.all_completed() {
        println!();
        print_lifecycle(&ctx.lifecycle);
    }
    Ok(())
}

// ── Output ──

fn print_plan(manifest: &PlanManifest, run_dir: &Path) {
    println!("Plan {} in {}", manifest.fingerprint, run_dir.display());
    println!(
        "  {} request(s) in {} chunk(s), budget {} tokens, model {}",
        manifest.request_count,
        manifest.chunk_count,
        manifest.limits.max_tokens_per_chunk,
        manifest.model
    );
    for w in &manifest.warnings {
        println!("  warning: {w}");
    }
}

fn print_results(outcome: &ResultsOutcome, run_dir: &Path) {
    println!(
        "Fetched {} result(s), {} fetch failure(s), {} chunk(s) pending.",
        outcome.fetched, outcome.fetch_failures, outcome.pending_chunks
    );
    for inst in Institution::ALL {
        let sparse = outcome.tables.sparse.get(&inst).map_or(0, Vec::len);
        let filled = outcome.tables.forward_filled.get(&inst).map_or(0, Vec::len);
        println!(
            "  {:<4} {sparse:>6} speech day(s), {filled:>6} calendar day(s)",
            inst.as_str()
        );
    }
    println!("Indices written to: {}", run_dir.join("indices").display());
    println!("Report: {}", run_dir.join("report.md").display());
}
