use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nl2sql_agent::agent::{ExampleRetriever, KeywordRetriever, NoExamples};
use nl2sql_agent::safety::ExecutionOutcome;
use nl2sql_agent::{AgentService, AppConfig, Session};
use serde_json::{Map, Value};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nl2sql")]
#[command(about = "Natural-language questions answered with vetted SQL")]
struct Args {
    /// SQLite database file (or set NL2SQL_DATABASE)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Model identifier (or set OPENAI_MODEL)
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Schema cache directory (or set NL2SQL_CACHE_DIR)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// OpenAI-compatible endpoint (or set OPENAI_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// OpenAI API key (or set OPENAI_API_KEY)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Default LIMIT for unbounded reads
    #[arg(long, global = true)]
    row_limit: Option<usize>,

    /// Refuse every write, approved or not
    #[arg(long, global = true)]
    no_writes: bool,

    /// JSON file of {question, sql} examples for few-shot prompting
    #[arg(long, global = true)]
    examples: Option<PathBuf>,

    /// Output format for result rows
    #[arg(long, value_enum, default_value_t = OutputFormat::Json, global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Build (or reuse) the schema cache
    Init {
        /// Rebuild even if a complete cache exists
        #[arg(long)]
        force: bool,
    },
    /// Show the current content hash and cached stages
    CacheInfo,
    /// Answer a question with a single generated query
    Query { question: String },
    /// Run SQL through the safety gate
    Exec {
        sql: String,
        /// Approve a write statement
        #[arg(long)]
        write: bool,
    },
    /// Interactive tool-calling chat (empty line or "exit" quits, "clear" resets)
    Chat,
    /// Delete every cached artifact for the database
    Purge,
    /// Tables plus cached analysis and dictionary
    Info,
}

impl Args {
    fn to_config(&self) -> Result<AppConfig> {
        let mut config = AppConfig::from_env()?;
        if let Some(db) = &self.database {
            config.database = db.clone();
        }
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        if let Some(key) = &self.api_key {
            config.api_key = Some(key.clone());
        }
        if let Some(limit) = self.row_limit {
            config.row_limit = limit;
        }
        if self.no_writes {
            config.allow_writes = false;
        }
        config.validate()?;
        Ok(config)
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_csv(columns: &[String], rows: &[Map<String, Value>]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(io::stdout());
    writer.write_record(columns)?;
    for row in rows {
        writer.write_record(columns.iter().map(|c| row.get(c).map(csv_cell).unwrap_or_default()))?;
    }
    writer.flush()?;
    Ok(())
}

async fn run_chat(service: &AgentService) -> Result<()> {
    let mut session = Session::new();
    let stdin = io::stdin();
    println!("Chatting with {} (session {})", service.database().identity(), session.id);

    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let message = line.trim();
        match message {
            "" | "exit" | "quit" => break,
            "clear" => {
                session.clear();
                println!("(conversation cleared)");
                continue;
            }
            _ => {}
        }
        match service.chat(&mut session, message).await {
            Ok(reply) => println!("{}\n", reply.answer),
            // the turn was not recorded; the user can simply retry
            Err(e) => error!("Turn failed: {}", e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = args.to_config()?;

    let retriever: Arc<dyn ExampleRetriever> = match &args.examples {
        Some(path) => Arc::new(
            KeywordRetriever::from_json_file(path)
                .with_context(|| format!("loading examples from {}", path.display()))?,
        ),
        None => Arc::new(NoExamples),
    };

    info!("nl2sql starting against {}", config.database.display());
    let service = AgentService::from_config(&config, retriever)?;

    match args.command {
        Commands::Init { force } => print_json(&service.initialize(force).await?)?,
        Commands::CacheInfo => print_json(&service.cache_info().await?)?,
        Commands::Query { question } => {
            let answer = service.query(&question, &[]).await?;
            match args.format {
                OutputFormat::Json => print_json(&answer)?,
                OutputFormat::Csv => {
                    print_csv(&answer.columns, &answer.rows)?;
                    if let Some(explanation) = &answer.explanation {
                        eprintln!("\n{}", explanation);
                    }
                }
            }
        }
        Commands::Exec { sql, write } => {
            let response = service.execute(&sql, write).await?;
            match (&response.outcome, args.format) {
                (ExecutionOutcome::Rows { columns, rows, .. }, OutputFormat::Csv) => print_csv(columns, rows)?,
                _ => print_json(&response)?,
            }
        }
        Commands::Chat => run_chat(&service).await?,
        Commands::Purge => print_json(&service.purge().await?)?,
        Commands::Info => print_json(&service.database_info().await?)?,
    }

    Ok(())
}
