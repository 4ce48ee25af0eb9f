use csv_insight::column_resolver::SynonymTable;
use csv_insight::config::{LlmConfig, RoutingPolicy, SessionConfig};
use csv_insight::dataset::Dataset;
use csv_insight::llm::{ModelBackend, OllamaBridge};
use csv_insight::visualization::{ChartRenderer, JsonChartWriter};
use csv_insight::{Answer, AnswerSource, Session};

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "csv-insight")]
#[command(about = "Ask natural-language questions about a CSV file")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a single question
    Ask {
        /// CSV file to load
        file: PathBuf,

        /// The question in natural language
        question: String,

        #[command(flatten)]
        options: SessionOptions,
    },
    /// Interactive question loop on stdin
    Chat {
        /// CSV file to load
        file: PathBuf,

        #[command(flatten)]
        options: SessionOptions,
    },
    /// Show file info, numeric summary and resolved column roles
    Info {
        /// CSV file to load
        file: PathBuf,

        /// JSON file overriding role synonyms
        #[arg(long)]
        synonyms: Option<PathBuf>,
    },
}

#[derive(ClapArgs)]
struct SessionOptions {
    /// Model name (or set CSV_INSIGHT_MODEL)
    #[arg(long)]
    model: Option<String>,

    /// Model server base URL (or set CSV_INSIGHT_MODEL_URL)
    #[arg(long)]
    model_url: Option<String>,

    /// Model request timeout in seconds (or set CSV_INSIGHT_MODEL_TIMEOUT_SECS)
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Never contact the model
    #[arg(long, conflicts_with = "model_first")]
    offline: bool,

    /// Send every question to the model first
    #[arg(long)]
    model_first: bool,

    /// JSON file overriding role synonyms
    #[arg(long)]
    synonyms: Option<PathBuf>,

    /// Write chart specifications as JSON to this path
    #[arg(long)]
    chart_out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("csv_insight=info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Ask { file, question, options } => run_ask(file, question, options).await,
        Commands::Chat { file, options } => run_chat(file, options).await,
        Commands::Info { file, synonyms } => run_info(file, synonyms),
    }
}

fn load_synonyms(path: Option<&PathBuf>) -> Result<Arc<SynonymTable>> {
    let table = match path {
        Some(path) => SynonymTable::from_json_file(path)
            .with_context(|| format!("Failed to load synonyms from {}", path.display()))?,
        None => SynonymTable::default(),
    };
    Ok(Arc::new(table))
}

fn build_session(file: &PathBuf, options: &SessionOptions) -> Result<Session> {
    let routing = if options.offline {
        RoutingPolicy::Offline
    } else if options.model_first {
        RoutingPolicy::ModelFirst
    } else {
        RoutingPolicy::DeterministicFirst
    };
    let config = SessionConfig {
        routing,
        ..SessionConfig::default()
    };

    let backend: Option<Arc<dyn ModelBackend>> = if routing == RoutingPolicy::Offline {
        None
    } else {
        let mut llm = LlmConfig::from_env();
        if let Some(model) = &options.model {
            llm = llm.with_model(model.clone());
        }
        if let Some(url) = &options.model_url {
            llm = llm.with_url(url.clone());
        }
        if let Some(secs) = options.timeout_secs {
            llm = llm.with_timeout(Duration::from_secs(secs));
        }
        Some(Arc::new(OllamaBridge::new(llm)?) as Arc<dyn ModelBackend>)
    };

    let mut session = Session::new(config, load_synonyms(options.synonyms.as_ref())?, backend);
    let info = session
        .load_file(file)
        .with_context(|| format!("Could not load {}", file.display()))?;
    info!("Loaded {} ({} rows, {} columns)", info.file_name, info.rows, info.columns);
    Ok(session)
}

fn print_answer(answer: &Answer, chart_out: Option<&PathBuf>) -> Result<()> {
    println!("{}", answer.text);
    if answer.source == AnswerSource::Fallback {
        if let Some(intent) = &answer.intent {
            info!("Answered deterministically ({})", intent.name());
        }
    }

    if let (Some(chart), Some(path)) = (&answer.chart, chart_out) {
        JsonChartWriter::new(path).render(chart)?;
        println!("Chart written to {}", path.display());
    }
    Ok(())
}

async fn run_ask(file: PathBuf, question: String, options: SessionOptions) -> Result<()> {
    let session = build_session(&file, &options)?;
    let answer = session.ask(&question).await?;
    print_answer(&answer, options.chart_out.as_ref())
}

async fn run_chat(file: PathBuf, options: SessionOptions) -> Result<()> {
    let session = build_session(&file, &options)?;
    let Some(dataset) = session.dataset() else {
        anyhow::bail!("No dataset loaded");
    };

    println!("Loaded {}. Ask a question, or type :preview, :info, :roles, quit.", dataset.name());
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();

        match line {
            "quit" | "exit" => break,
            ":preview" => println!("{}", dataset.preview(session.config().preview_rows)),
            ":info" => println!("{}", dataset.info()),
            ":roles" => println!("{}", session.roles()),
            _ => match session.ask(line).await {
                Ok(answer) => print_answer(&answer, options.chart_out.as_ref())?,
                Err(e) => error!("{}", e),
            },
        }
    }
    Ok(())
}

fn run_info(file: PathBuf, synonyms: Option<PathBuf>) -> Result<()> {
    let dataset = Dataset::load_csv(&file, SessionConfig::default().upload)
        .with_context(|| format!("Could not load {}", file.display()))?;

    let mut session = Session::new(SessionConfig::default(), load_synonyms(synonyms.as_ref())?, None);
    println!("{}", dataset.info());
    println!("{}", dataset.describe()?);
    println!("\nPreview:\n{}", dataset.preview(5));

    session.load(dataset);
    println!("\nColumn roles:\n{}", session.roles());
    Ok(())
}
