mod template;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use console::Term;
use docflow_core::{
    AnalysisRequest, AnalysisType, ExecutionResult, GeneratedArtifact, Language, RunContext,
    RunStatus,
};
use events::{EventKind, EventSource, ProgressEvent};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use orchestrator::{DocumentUpload, Orchestrator, OrchestratorConfig, RunReport};
use sandbox::{
    probe_isolation, proc_available, IsolationMode, ProcessSandbox, SandboxRunner,
};
use server::state::AppState;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use template::{CONFIG_FILE, DEFAULT_CONFIG};

const API_KEY_ENV: &str = "DOCFLOW_API_KEY";
const DEFAULT_PORT: u16 = 3001;
const DEFAULT_OUTPUT_DIR: &str = "docflow-output";

#[derive(Parser)]
#[command(name = "docflow")]
#[command(about = "Multi-stage document analysis with sandboxed report generation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ./docflow.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default docflow.toml into the current directory
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Analyze one document and write the produced files
    Run {
        file: PathBuf,

        /// Predefined analysis type, e.g. financial-summary
        #[arg(short, long)]
        analysis: Option<String>,

        /// Free-form analysis prompt
        #[arg(short, long)]
        prompt: Option<String>,

        /// Format tag; taken from the file extension when omitted
        #[arg(long)]
        format: Option<String>,

        #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
        output: PathBuf,

        /// Print the final run as JSON instead of the markdown report
        #[arg(long)]
        json: bool,
    },
    /// Serve the HTTP API
    Serve {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Validate configuration and check the sandbox host
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Init { force } => init_config(force).await,
        Commands::Run {
            file,
            analysis,
            prompt,
            format,
            output,
            json,
        } => {
            let config = load_config(cli.config.as_deref())?;
            run_document(config, &file, analysis, prompt, format, &output, json).await
        }
        Commands::Serve { port, host } => {
            let config = load_config(cli.config.as_deref())?;
            serve(config, &host, port).await
        }
        Commands::Check => check(cli.config.as_deref()).await,
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "docflow=debug,orchestrator=debug,sandbox=debug,server=debug,tower_http=debug"
    } else {
        "warn,server=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Explicit path, then `./docflow.toml`, then `<config dir>/docflow/docflow.toml`.
fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("docflow").join(CONFIG_FILE))
        .filter(|path| path.exists())
}

fn load_config(explicit: Option<&Path>) -> Result<OrchestratorConfig> {
    let mut config = match config_path(explicit) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            tracing::debug!(path = %path.display(), "Loaded config");
            OrchestratorConfig::from_toml(&raw)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => OrchestratorConfig::default(),
    };
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        if !key.trim().is_empty() {
            config.generation.api_key = Some(key);
        }
    }
    Ok(config)
}

async fn init_config(force: bool) -> Result<()> {
    let path = std::env::current_dir()?.join(CONFIG_FILE);
    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(());
    }

    tokio::fs::write(&path, DEFAULT_CONFIG)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("{} {}", "Created".green().bold(), path.display());
    println!();
    println!("Next steps:");
    println!("  1. export {}=<your key>", API_KEY_ENV);
    println!("  2. docflow check");
    println!("  3. docflow run report.pdf --analysis financial-summary");
    Ok(())
}

fn analysis_request(analysis: Option<String>, prompt: Option<String>) -> AnalysisRequest {
    let analysis_type = match (&analysis, &prompt) {
        (Some(kind), _) => Some(kind.clone()),
        (None, None) => Some(AnalysisType::FinancialSummary.as_str().to_string()),
        (None, Some(_)) => None,
    };
    AnalysisRequest {
        analysis_type,
        prompt,
    }
}

fn spinner() -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {msg}")
            .context("Invalid progress template")?,
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

fn report_event(pb: &ProgressBar, event: &ProgressEvent) {
    let message = event.message.clone().unwrap_or_default();
    let label = match event.source {
        EventSource::Stage(stage) => stage.display_name().to_string(),
        EventSource::Sandbox => "Sandbox".to_string(),
        EventSource::Run => "Run".to_string(),
    };
    match &event.kind {
        EventKind::Started | EventKind::Progress => {
            pb.set_message(format!("{}: {}", label, message));
        }
        EventKind::Completed => {
            pb.println(format!("  {} {}", "✓".green(), label));
        }
        EventKind::Failed { failure } => {
            pb.println(format!("  {} {} ({}): {}", "✗".red(), label, failure, message));
        }
        EventKind::Dropped { missed } => {
            pb.println(format!("  {} {} progress event(s) missed", "!".yellow(), missed));
        }
        EventKind::Terminal { .. } => {}
    }
}

async fn run_document(
    config: OrchestratorConfig,
    file: &Path,
    analysis: Option<String>,
    prompt: Option<String>,
    format: Option<String>,
    output: &Path,
    json: bool,
) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let upload = match format {
        Some(format) => DocumentUpload::new(name, format, bytes),
        None => DocumentUpload::from_file_name(name, bytes),
    };

    let orchestrator = Orchestrator::builder(config)
        .build()
        .context("Failed to start orchestrator")?;
    let run_id = orchestrator
        .submit(upload, analysis_request(analysis, prompt))
        .context("Document rejected")?;
    let mut events = orchestrator.subscribe(run_id)?;

    let pb = spinner()?;
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => report_event(&pb, &event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                pb.set_message("Cancelling...");
                orchestrator.cancel(run_id, "interrupted")?;
            }
        }
    }
    let ctx = orchestrator.wait(run_id).await?;
    pb.finish_and_clear();
    orchestrator.shutdown();

    if let Some(execution) = &ctx.execution {
        let written = write_outputs(execution, output).await?;
        for path in written {
            println!("{} {}", "Wrote".green(), path.display());
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(ctx.as_ref())?);
    } else {
        let term = Term::stdout();
        if term.is_term() {
            println!();
        }
        println!("{}", RunReport::render(&ctx));
    }

    finish_status(&ctx)
}

fn finish_status(ctx: &RunContext) -> Result<()> {
    match ctx.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Cancelled => bail!(
            "run cancelled: {}",
            ctx.cancel_reason.as_deref().unwrap_or("unknown reason")
        ),
        _ => match &ctx.failure {
            Some(failure) => bail!(
                "run failed at {} ({}): {}",
                failure.origin,
                failure.kind,
                failure.message
            ),
            None => bail!("run ended as {}", ctx.status),
        },
    }
}

/// Copy every produced file into `dir`, inline or retained.
async fn write_outputs(execution: &ExecutionResult, dir: &Path) -> Result<Vec<PathBuf>> {
    if execution.produced_files.is_empty() {
        return Ok(Vec::new());
    }
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut written = Vec::new();
    for file in &execution.produced_files {
        let target = dir.join(&file.name);
        let result = match (&file.content, &file.reference) {
            (Some(content), _) => tokio::fs::write(&target, content).await,
            (None, Some(reference)) => tokio::fs::copy(reference, &target).await.map(|_| ()),
            (None, None) => continue,
        };
        result.with_context(|| format!("Failed to write {}", target.display()))?;
        written.push(target);
    }
    Ok(written)
}

async fn serve(config: OrchestratorConfig, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let orchestrator = Orchestrator::builder(config)
        .build()
        .context("Failed to start orchestrator")?;

    println!();
    println!("{}", "docflow".bold());
    println!("════════════════════════════════════════");
    println!();
    println!("  API Server:  http://{}", addr);
    println!("  Swagger UI:  http://{}/swagger-ui", addr);
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    server::serve(AppState::new(orchestrator), addr).await
}

fn report_check(ok: bool, label: &str, detail: impl std::fmt::Display) -> bool {
    let mark = if ok { "✓".green() } else { "✗".red() };
    println!("  {} {:<24} {}", mark, label, detail);
    ok
}

async fn interpreter_version(program: &str) -> Option<String> {
    let output = tokio::process::Command::new(program)
        .arg("--version")
        .output()
        .await
        .ok()?;
    let text = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    Some(String::from_utf8_lossy(&text).trim().to_string())
}

async fn check(explicit: Option<&Path>) -> Result<()> {
    let mut healthy = true;
    println!();
    println!("{}", "Configuration".bold());
    let config = match load_config(explicit) {
        Ok(config) => {
            let source = config_path(explicit)
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "built-in defaults".to_string());
            report_check(true, "config", source);
            config
        }
        Err(e) => {
            report_check(false, "config", format!("{:#}", e));
            bail!("configuration is invalid");
        }
    };
    report_check(
        true,
        "taxonomy",
        format!(
            "{} categories, {} fields",
            config.taxonomy.categories.len(),
            config.taxonomy.field_count()
        ),
    );
    healthy &= report_check(
        config.generation.api_key.is_some(),
        "api key",
        if config.generation.api_key.is_some() {
            format!("{} set", API_KEY_ENV)
        } else {
            format!("{} not set", API_KEY_ENV)
        },
    );

    println!();
    println!("{}", "Sandbox".bold());
    healthy &= report_check(
        proc_available(),
        "memory accounting",
        if proc_available() {
            "/proc available"
        } else {
            "/proc missing, memory limit not enforced"
        },
    );
    let jail = probe_isolation(&config.sandbox.work_root);
    let confined = config.limits.requires_jail();
    healthy &= report_check(
        jail || !confined,
        "namespace jail",
        match (jail, confined, config.sandbox.isolation) {
            (true, _, _) => "available".to_string(),
            (false, _, IsolationMode::Required) => "required but unavailable".to_string(),
            (false, true, _) => "unavailable, confined runs will be refused".to_string(),
            (false, false, _) => "unavailable, limits run scripts unconfined".to_string(),
        },
    );
    for program in [&config.sandbox.python, &config.sandbox.shell] {
        let version = interpreter_version(program).await;
        healthy &= report_check(
            version.is_some(),
            program,
            version.unwrap_or_else(|| "not found".to_string()),
        );
    }

    match ProcessSandbox::new(config.sandbox.clone()) {
        Ok(sandbox) => {
            let artifact = GeneratedArtifact::new("echo ok", Language::Shell);
            let result = sandbox
                .run(&artifact, &config.limits, CancellationToken::new())
                .await;
            let ok = matches!(&result, Ok(r) if r.succeeded() && r.stdout.trim() == "ok");
            healthy &= report_check(
                ok,
                "smoke run",
                match result {
                    Ok(r) => format!("{} in {}ms", r.exit_status, r.duration_ms),
                    Err(e) => e.to_string(),
                },
            );
        }
        Err(e) => {
            healthy &= report_check(false, "work root", e);
        }
    }
    println!();

    if healthy {
        println!("{}", "All checks passed".green().bold());
        Ok(())
    } else {
        bail!("some checks failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_request_defaults_to_financial_summary() {
        let request = analysis_request(None, None);
        assert_eq!(request.analysis_type.as_deref(), Some("financial-summary"));
        assert!(request.prompt.is_none());

        let request = analysis_request(None, Some("list the risks".into()));
        assert!(request.analysis_type.is_none());
        assert_eq!(request.prompt.as_deref(), Some("list the risks"));
    }

    #[tokio::test]
    async fn test_write_outputs_inline_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let execution = ExecutionResult {
            exit_status: docflow_core::ExitStatus::Code(0),
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            produced_files: vec![docflow_core::ProducedFile::inline(
                "report.csv",
                b"a,b\n1,2\n".to_vec(),
            )],
            missing_outputs: Vec::new(),
            duration_ms: 5,
            limit_exceeded: false,
            limit: None,
        };

        let written = write_outputs(&execution, &dir.path().join("out")).await.unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(std::fs::read(&written[0]).unwrap(), b"a,b\n1,2\n");
    }
}
