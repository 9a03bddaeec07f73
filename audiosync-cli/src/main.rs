//! audiosync — headless multi-source audio/video synchronization CLI.
//!
//! Usage:
//!     audiosync probe job.json
//!     audiosync analyze job.json
//!     audiosync plan job.json
//!     audiosync run job.json --workdir ./work --state

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use audiosync_core::logging::JobLogger;
use audiosync_core::models::{new_cancel_token, Context, JobSpec};
use audiosync_core::orchestrator::{Orchestrator, PipelineStep};
use audiosync_core::probe;

#[derive(Parser)]
#[command(
    name = "audiosync",
    version,
    about = "audiosync — multi-source audio/video synchronization and muxing",
    long_about = "Probes, analyzes, plans, and muxes a JobSpec: aligns secondary \
                  sources against a reference via FFT cross-correlation, diagnoses \
                  and corrects clock drift, carries chapters/subtitles/attachments, \
                  and invokes a multiplexer with the resolved track plan."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every source in a JobSpec and print its tracks as JSON.
    Probe {
        job_spec: PathBuf,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Run only delay analysis (Analyze step) and print the result as JSON.
    Analyze {
        job_spec: PathBuf,
        #[arg(long)]
        workdir: Option<PathBuf>,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Run Analyze through BuildPlan and print the resolved merge plan as JSON.
    Plan {
        job_spec: PathBuf,
        #[arg(long)]
        workdir: Option<PathBuf>,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Run the full pipeline (Analyze through Mux).
    Run {
        job_spec: PathBuf,
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Dump a state.json audit file alongside the job log.
        #[arg(long)]
        state: bool,
        #[arg(short, long)]
        verbose: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let verbose = match &cli.command {
        Commands::Probe { verbose, .. }
        | Commands::Analyze { verbose, .. }
        | Commands::Plan { verbose, .. }
        | Commands::Run { verbose, .. } => *verbose,
    };
    let level = if verbose { "debug" } else { "info" };
    // SAFETY: called before any threads are spawned, at program start.
    unsafe {
        std::env::set_var("RUST_LOG", format!("audiosync={level}"));
    }
    env_logger::init();

    let result = match cli.command {
        Commands::Probe { job_spec, .. } => cmd_probe(&job_spec),
        Commands::Analyze { job_spec, workdir, .. } => cmd_analyze(&job_spec, workdir),
        Commands::Plan { job_spec, workdir, .. } => cmd_plan(&job_spec, workdir),
        Commands::Run { job_spec, workdir, state, .. } => cmd_run(&job_spec, workdir, state),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(2)
        }
    }
}

// ---------------------------------------------------------------------------
//  Shared helpers
// ---------------------------------------------------------------------------

fn load_job_spec(path: &Path) -> anyhow::Result<JobSpec> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read job spec {}: {e}", path.display()))?;
    let job: JobSpec = serde_json::from_str(&text)
        .map_err(|e| anyhow::anyhow!("malformed job spec {}: {e}", path.display()))?;
    Ok(job)
}

fn build_context(job: JobSpec, workdir: Option<PathBuf>) -> anyhow::Result<Context> {
    let working_dir = workdir.unwrap_or_else(|| std::env::temp_dir().join(format!("audiosync_{}", job.job_name)));
    std::fs::create_dir_all(&working_dir)
        .map_err(|e| anyhow::anyhow!("cannot create working dir {}: {e}", working_dir.display()))?;
    let output_dir = job
        .output_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| working_dir.clone());

    let log_path = working_dir.join("job.log");
    let logger = JobLogger::new(&log_path, 20, 20)
        .map_err(|e| anyhow::anyhow!("cannot open job log {}: {e}", log_path.display()))?;

    Ok(Context { job, working_dir, output_dir, logger, cancel: new_cancel_token(), progress: None })
}

// ---------------------------------------------------------------------------
//  probe
// ---------------------------------------------------------------------------

fn cmd_probe(job_spec_path: &Path) -> anyhow::Result<ExitCode> {
    let job = load_job_spec(job_spec_path)?;
    let log_path = std::env::temp_dir().join(format!("audiosync_probe_{}.log", std::process::id()));
    let logger = JobLogger::new(&log_path, 20, 20)?;
    let cancel = new_cancel_token();

    let mut sources = serde_json::Map::new();
    for source in &job.sources {
        let result = probe::probe_file(&job.config.tools.probe_tool, &source.path, &logger, &cancel)?;
        sources.insert(
            source.source_key.clone(),
            serde_json::json!({
                "tracks": result.tracks,
                "has_chapters": result.has_chapters,
                "attachment_names": result.attachment_names,
            }),
        );
    }

    println!("{}", serde_json::to_string_pretty(&serde_json::Value::Object(sources))?);
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
//  analyze
// ---------------------------------------------------------------------------

fn cmd_analyze(job_spec_path: &Path, workdir: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let job = load_job_spec(job_spec_path)?;
    let ctx = build_context(job, workdir)?;

    let orchestrator = Orchestrator::new();
    match run_up_to(&orchestrator, &ctx, "Analyze") {
        Ok(state) => {
            println!("{}", serde_json::to_string_pretty(&state.analysis)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("[FATAL] Job '{}' → {e}", ctx.job.job_name);
            Ok(exit_for_error(&e))
        }
    }
}

// ---------------------------------------------------------------------------
//  plan
// ---------------------------------------------------------------------------

fn cmd_plan(job_spec_path: &Path, workdir: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let job = load_job_spec(job_spec_path)?;
    let ctx = build_context(job, workdir)?;

    let orchestrator = Orchestrator::new();
    match run_up_to(&orchestrator, &ctx, "BuildPlan") {
        Ok(state) => {
            println!("{}", serde_json::to_string_pretty(&state.merge_plan)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("[FATAL] Job '{}' → {e}", ctx.job.job_name);
            Ok(exit_for_error(&e))
        }
    }
}

// ---------------------------------------------------------------------------
//  run
// ---------------------------------------------------------------------------

fn cmd_run(job_spec_path: &Path, workdir: Option<PathBuf>, dump_state: bool) -> anyhow::Result<ExitCode> {
    let job = load_job_spec(job_spec_path)?;
    let ctx = build_context(job, workdir)?;
    let working_dir = ctx.working_dir.clone();
    let job_name = ctx.job.job_name.clone();

    let orchestrator = Orchestrator::new();
    match orchestrator.run(&ctx) {
        Ok(state) => {
            if dump_state {
                let dump = serde_json::json!({
                    "analysis": state.analysis,
                    "extract": state.extract,
                    "correct": state.correct,
                    "chapters": state.chapters,
                    "attachments": state.attachments,
                    "merge_plan": state.merge_plan,
                    "mux": state.mux,
                });
                let state_path = working_dir.join("state.json");
                std::fs::write(&state_path, serde_json::to_string_pretty(&dump)?)?;
            }
            println!("Job '{job_name}' completed.");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("[FATAL] Job '{job_name}' → {e}");
            Ok(exit_for_error(&e))
        }
    }
}

fn exit_for_error(e: &audiosync_core::StepError) -> ExitCode {
    if matches!(e.source, audiosync_core::PipelineError::Cancelled) {
        ExitCode::from(130)
    } else {
        ExitCode::from(2)
    }
}

/// Runs the orchestrator's fixed step list up to and including `stop_at_step`,
/// for the `analyze`/`plan` subcommands which only need a partial run.
fn run_up_to(
    orchestrator: &Orchestrator,
    ctx: &Context,
    stop_at_step: &str,
) -> Result<audiosync_core::JobState, audiosync_core::StepError> {
    use audiosync_core::models::JobState;

    let mut state = JobState::default();
    for step in orchestrator.steps() {
        if let Err(e) = audiosync_core::models::check_cancelled(&ctx.cancel) {
            return Err(audiosync_core::StepError::new(step.name(), "cancellation", e));
        }
        ctx.logger.section(step.name());

        if let Err(e) = step.validate_input(ctx, &state) {
            if step.is_optional() {
                ctx.logger.info(&format!("{}: skipped ({e})", step.name()));
                if step.name() == stop_at_step {
                    break;
                }
                continue;
            }
            return Err(audiosync_core::StepError::new(step.name(), "validate_input", e));
        }

        match step.execute(ctx, &mut state) {
            Ok(()) => {}
            Err(e) if e.is_recoverable_warning() => ctx.logger.warn(&format!("{}: {e}", step.name())),
            Err(e) => return Err(audiosync_core::StepError::new(step.name(), "execute", e)),
        }

        if let Err(e) = step.validate_output(ctx, &state) {
            return Err(audiosync_core::StepError::new(step.name(), "validate_output", e));
        }

        if step.name() == stop_at_step {
            break;
        }
    }
    Ok(state)
}
