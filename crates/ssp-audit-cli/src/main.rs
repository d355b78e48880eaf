use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ssp_audit_core::llm::{LlmAssessor, LlmSettings};
use ssp_audit_core::{
    corpus, merge_results, render_outcome, Assessor, BatchOutcome, BatchRunner, ControlCatalog,
    CorpusMode, HeuristicAssessor, OutputFormat,
};

mod server;

#[derive(Parser, Debug)]
#[command(
    name = "ssp-audit",
    author,
    version,
    about = "Security control assessment engine"
)]
struct Cli {
    /// Control catalog file (JSON array of {id: {Description}})
    #[arg(
        long = "catalog",
        value_name = "FILE",
        default_value = "./data/controls.json",
        global = true
    )]
    catalog: PathBuf,

    /// Policy corpus source (DSC export or plain text)
    #[arg(
        long = "policies",
        value_name = "FILE",
        default_value = "./policies/dsc-export.txt",
        global = true
    )]
    policies: PathBuf,

    /// How to interpret the policy corpus source
    #[arg(long = "corpus-mode", value_enum, default_value_t = CorpusModeArg::Structured, global = true)]
    corpus_mode: CorpusModeArg,

    /// Optional TOML file with reasoning-service overrides (endpoint,
    /// deployment, api_version, timeout_secs); the API key always comes
    /// from SSP_AUDIT_API_KEY
    #[arg(long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CorpusModeArg {
    Raw,
    Structured,
}

impl From<CorpusModeArg> for CorpusMode {
    fn from(mode: CorpusModeArg) -> Self {
        match mode {
            CorpusModeArg::Raw => CorpusMode::Raw,
            CorpusModeArg::Structured => CorpusMode::Structured,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the controls available in the catalog
    ListControls {
        /// Emit controls as JSON instead of human-readable text
        #[arg(long)]
        json: bool,
    },
    /// Assess controls against the policy corpus
    Assess {
        /// Control identifiers to assess
        ids: Vec<String>,
        /// Assess every control in the catalog
        #[arg(long)]
        all: bool,
        /// Use the reasoning-backed assessor instead of the heuristic
        #[arg(long)]
        with_llm: bool,
        /// SSP template to merge the results into
        #[arg(long, value_name = "FILE")]
        template: Option<PathBuf>,
        /// Where to write the merged report (default: ./ssp-assessment.xlsx)
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
        /// Emit the outcome as JSON instead of human-readable text
        #[arg(long)]
        json: bool,
    },
    /// Serve the assessment HTTP API
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1:8000")]
        addr: String,
        /// SSP template merged into each report
        #[arg(long, value_name = "FILE")]
        template: PathBuf,
        /// Directory that receives merged reports
        #[arg(long, value_name = "DIR", default_value = "./reports")]
        reports_dir: PathBuf,
        /// Use the reasoning-backed assessor instead of the heuristic
        #[arg(long)]
        with_llm: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match &cli.command {
        Commands::ListControls { json } => list_controls(&cli.catalog, *json),
        Commands::Assess {
            ids,
            all,
            with_llm,
            template,
            output,
            json,
        } => {
            assess(
                &cli,
                ids.clone(),
                *all,
                *with_llm,
                template.clone(),
                output.clone(),
                *json,
            )
            .await
        }
        Commands::Serve {
            addr,
            template,
            reports_dir,
            with_llm,
        } => {
            serve(
                &cli,
                addr,
                template.clone(),
                reports_dir.clone(),
                *with_llm,
            )
            .await
        }
    }
}

fn list_controls(catalog_path: &Path, json: bool) -> Result<()> {
    let catalog = ControlCatalog::load(catalog_path)
        .with_context(|| format!("failed to load control catalog from {}", catalog_path.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&catalog.controls())?);
        return Ok(());
    }
    println!(
        "{} control(s) loaded from {}",
        catalog.len(),
        catalog_path.display()
    );
    for control in catalog.controls() {
        println!("- {id:<12} :: {desc}", id = control.identifier, desc = control.description);
    }
    Ok(())
}

async fn assess(
    cli: &Cli,
    ids: Vec<String>,
    all: bool,
    with_llm: bool,
    template: Option<PathBuf>,
    output: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let catalog = ControlCatalog::load(&cli.catalog)
        .with_context(|| format!("failed to load control catalog from {}", cli.catalog.display()))?;
    let ids: Vec<String> = if all {
        catalog.identifiers().map(String::from).collect()
    } else if ids.is_empty() {
        bail!("provide control identifiers to assess, or pass --all");
    } else {
        ids
    };
    let corpus = Arc::new(
        corpus::load(&cli.policies, cli.corpus_mode.into())
            .with_context(|| format!("failed to load policy corpus from {}", cli.policies.display()))?,
    );

    let cancel = cancel_on_ctrl_c();
    let outcome = if with_llm {
        let settings = load_llm_settings(cli.config.as_deref())?;
        let assessor = LlmAssessor::new(settings, Arc::clone(&corpus));
        assessor.initialize().await?;
        let outcome = run_batch(&assessor, &ids, &catalog, &cancel).await;
        assessor.teardown().await;
        outcome
    } else {
        let assessor = HeuristicAssessor::new(corpus);
        run_batch(&assessor, &ids, &catalog, &cancel).await
    };

    let format = if json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };
    println!("{}", render_outcome(&outcome, format)?);

    if let Some(template) = template {
        let output = output.unwrap_or_else(|| PathBuf::from("./ssp-assessment.xlsx"));
        let written = merge_results(&outcome.results, &template, &output)
            .context("failed to merge results into the SSP template")?;
        eprintln!("Merged report written to {}", written.display());
    }
    Ok(())
}

async fn run_batch(
    assessor: &dyn Assessor,
    ids: &[String],
    catalog: &ControlCatalog,
    cancel: &CancellationToken,
) -> BatchOutcome {
    BatchRunner::new(assessor)
        .run_identifiers(ids, catalog, cancel)
        .await
}

async fn serve(
    cli: &Cli,
    addr: &str,
    template: PathBuf,
    reports_dir: PathBuf,
    with_llm: bool,
) -> Result<()> {
    let catalog = ControlCatalog::load(&cli.catalog)
        .with_context(|| format!("failed to load control catalog from {}", cli.catalog.display()))?;
    let corpus = Arc::new(
        corpus::load(&cli.policies, cli.corpus_mode.into())
            .with_context(|| format!("failed to load policy corpus from {}", cli.policies.display()))?,
    );

    // keep a concrete handle so the session can be torn down after shutdown
    let mut llm: Option<Arc<LlmAssessor>> = None;
    let assessor: Arc<dyn Assessor> = if with_llm {
        let settings = load_llm_settings(cli.config.as_deref())?;
        let assessor = Arc::new(LlmAssessor::new(settings, Arc::clone(&corpus)));
        assessor.initialize().await?;
        llm = Some(Arc::clone(&assessor));
        assessor
    } else {
        Arc::new(HeuristicAssessor::new(corpus))
    };

    let state = Arc::new(server::AppState::new(
        assessor, catalog, template, reports_dir,
    ));
    let shutdown = cancel_on_ctrl_c();
    let served = server::serve(addr, state, shutdown).await;
    if let Some(llm) = llm {
        llm.teardown().await;
    }
    served
}

#[derive(Debug, Default, Deserialize)]
struct FileOverrides {
    llm: Option<LlmOverrides>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmOverrides {
    endpoint: Option<String>,
    deployment: Option<String>,
    api_version: Option<String>,
    timeout_secs: Option<u64>,
}

/// Environment settings first; a config file only fills fields the
/// environment left unset.
fn load_llm_settings(config_path: Option<&Path>) -> Result<LlmSettings> {
    let mut settings = LlmSettings::from_env()?;
    if let Some(path) = config_path {
        let overrides: FileOverrides = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .build()
            .with_context(|| format!("failed to load config file {}", path.display()))?
            .try_deserialize()
            .context("invalid config file structure")?;
        if let Some(llm) = overrides.llm {
            settings.endpoint = settings.endpoint.or(llm.endpoint);
            settings.deployment = settings.deployment.or(llm.deployment);
            settings.api_version = settings.api_version.or(llm.api_version);
            settings.timeout_secs = settings.timeout_secs.or(llm.timeout_secs);
        }
    }
    Ok(settings)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });
    cancel
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tokio=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
