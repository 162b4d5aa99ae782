// CodeRAG CLI - ask questions of a code knowledge graph
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// Macro for conditional printing based on quiet flag
macro_rules! qprintln {
    ($quiet:expr, $($arg:tt)*) => {
        if !$quiet {
            println!($($arg)*);
        }
    };
}

use coderag::intent_translator::TranslationContext;
use coderag::observability::{get_metrics, OperationContext};
use coderag::{
    init_logging_with_level, log_operation, with_trace_id, ContextBudget, EngineConfig,
    GraphSourceResolver, InMemoryGraphStore, IntentTranslator, Operation, QueryError,
    QueryServiceBuilder, QueryValidator, RequestDeadline, StatementBuilder,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Markdown,
    Json,
}

#[derive(Parser)]
#[command(
    name = "coderag",
    version,
    about = "Turn code questions into safe graph queries and ranked source context",
    after_help = "Examples:
  coderag validate 'MATCH (m:Method {name: $name}) RETURN m' --param name=save
  coderag query --graph graph.json 'MATCH (m:Method) RETURN m.name AS name'
  coderag translate 'find all public methods that call save'
  coderag ask --graph graph.json --source-root ./src 'what calls persist' --budget 4000"
)]
struct Cli {
    /// Enable verbose logging (DEBUG level). Default is WARN level.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only print results
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "CODERAG_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "markdown")]
    format: OutputFormat,

    /// Print engine counters as JSON on stderr when the command finishes
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a statement against the safety rules without running it
    Validate {
        statement: String,
        /// Parameter binding as name=value (repeatable)
        #[arg(short, long = "param")]
        params: Vec<String>,
    },

    /// Run a statement against a graph snapshot
    Query {
        /// Graph snapshot (JSON with nodes and edges)
        #[arg(short, long, env = "CODERAG_GRAPH")]
        graph: PathBuf,
        statement: String,
        /// Parameter binding as name=value (repeatable)
        #[arg(short, long = "param")]
        params: Vec<String>,
        /// Execution timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Maximum number of rows
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show the candidate statements a prompt translates to
    Translate { prompt: String },

    /// Answer a prompt with ranked source context
    Ask {
        /// Graph snapshot (JSON with nodes and edges)
        #[arg(short, long, env = "CODERAG_GRAPH")]
        graph: PathBuf,
        /// Directory source file paths are relative to
        #[arg(short, long, default_value = ".")]
        source_root: PathBuf,
        prompt: String,
        /// Context size budget
        #[arg(short, long, default_value = "8000")]
        budget: usize,
        /// Measure the budget in approximate tokens instead of characters
        #[arg(long)]
        tokens: bool,
        /// Overall request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let path = cli
        .config
        .as_ref()
        .map(|p| {
            p.to_str()
                .ok_or_else(|| anyhow::anyhow!("Invalid config path: {:?}", p))
        })
        .transpose()?;
    EngineConfig::load(path)
}

fn build_statement(text: &str, params: &[String]) -> Result<StatementBuilder> {
    let mut builder = StatementBuilder::new().text(text)?;
    for param in params {
        builder = builder.assignment(param)?;
    }
    Ok(builder)
}

fn deadline_for(timeout_ms: Option<u64>) -> RequestDeadline {
    match timeout_ms {
        Some(ms) => RequestDeadline::within(Duration::from_millis(ms)),
        None => RequestDeadline::unbounded(),
    }
}

fn print_error(format: OutputFormat, err: &QueryError) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&err.report())?),
        OutputFormat::Markdown => eprintln!("Error: {}", err),
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<bool> {
    let config = load_config(&cli)?;
    let quiet = cli.quiet;
    let format = cli.format;

    match cli.command {
        Commands::Validate { statement, params } => {
            let statement = build_statement(&statement, &params)?.build()?;
            let verdict = QueryValidator::new(config.validator).validate(&statement);
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&verdict)?),
                OutputFormat::Markdown => {
                    if verdict.allowed {
                        println!("✅ Allowed (complexity {})", verdict.estimated_complexity);
                    } else {
                        println!("❌ Rejected");
                        for violation in &verdict.violations {
                            println!("   - {}", violation);
                        }
                    }
                }
            }
            Ok(verdict.allowed)
        }

        Commands::Query {
            graph,
            statement,
            params,
            timeout_ms,
            limit,
        } => {
            let store = Arc::new(InMemoryGraphStore::from_file(&graph)?);
            qprintln!(
                quiet,
                "Loaded {} nodes and {} relationships from {}",
                store.node_count(),
                store.relationship_count(),
                graph.display()
            );
            let service = QueryServiceBuilder::new(store, Arc::new(GraphSourceResolver::new(".")))
                .config(config)
                .build()?;

            let mut builder = build_statement(&statement, &params)?.options(service.default_options());
            if let Some(ms) = timeout_ms {
                builder = builder.timeout(Duration::from_millis(ms))?;
            }
            if let Some(limit) = limit {
                builder = builder.result_limit(limit)?;
            }
            let statement = builder.build()?;

            match service
                .execute_statement(&statement, &RequestDeadline::unbounded())
                .await
            {
                Ok(result) => {
                    match format {
                        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
                        OutputFormat::Markdown => {
                            for row in &result.rows {
                                let cells: Vec<String> =
                                    row.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                                println!("{}", cells.join("  "));
                            }
                            qprintln!(
                                quiet,
                                "\n{} row(s) in {}ms{}",
                                result.len(),
                                result.execution_time_ms,
                                match result.truncation_reason {
                                    Some(reason) => format!(" (truncated: {:?})", reason),
                                    None => String::new(),
                                }
                            );
                        }
                    }
                    Ok(true)
                }
                Err(err) => {
                    print_error(format, &err)?;
                    Ok(false)
                }
            }
        }

        Commands::Translate { prompt } => {
            let translator = IntentTranslator::new(config.translator);
            match translator.translate(&prompt, &TranslationContext::default()).await {
                Ok(candidates) => {
                    match format {
                        OutputFormat::Json => {
                            let rendered: Vec<_> = candidates
                                .iter()
                                .map(|c| {
                                    json!({
                                        "template": c.template,
                                        "confidence": c.confidence,
                                        "source": c.source,
                                        "statement": c.statement.text(),
                                        "parameters": c.statement.parameters(),
                                    })
                                })
                                .collect();
                            println!("{}", serde_json::to_string_pretty(&rendered)?);
                        }
                        OutputFormat::Markdown => {
                            for candidate in &candidates {
                                println!(
                                    "[{:.2}] {} ({:?})\n   {}",
                                    candidate.confidence,
                                    candidate.template.name(),
                                    candidate.source,
                                    candidate.statement
                                );
                                for (name, value) in candidate.statement.parameters() {
                                    println!("   ${} = {}", name, value);
                                }
                            }
                        }
                    }
                    Ok(true)
                }
                Err(err) => {
                    print_error(format, &err)?;
                    Ok(false)
                }
            }
        }

        Commands::Ask {
            graph,
            source_root,
            prompt,
            budget,
            tokens,
            timeout_ms,
        } => {
            let store = Arc::new(InMemoryGraphStore::from_file(&graph)?);
            let resolver = Arc::new(GraphSourceResolver::new(&source_root));
            let service = QueryServiceBuilder::new(store, resolver)
                .config(config)
                .build()?;
            let budget = if tokens {
                ContextBudget::tokens(budget)
            } else {
                ContextBudget::characters(budget)
            };

            match service
                .answer_prompt(&prompt, budget, &deadline_for(timeout_ms))
                .await
            {
                Ok(answer) => {
                    match format {
                        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&answer)?),
                        OutputFormat::Markdown => print!("{}", answer.to_markdown()),
                    }
                    Ok(answer.is_answered())
                }
                Err(err) => {
                    print_error(format, &err)?;
                    Ok(false)
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = init_logging_with_level(cli.verbose, cli.quiet); // Ignore error if already initialized

    log_operation::<anyhow::Error>(
        &OperationContext::new("startup"),
        &Operation::Startup {
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        Ok(()),
    );

    let show_metrics = cli.metrics;
    let succeeded = with_trace_id("coderag-cli", run(cli))
        .await
        .context("coderag command failed")?;
    if show_metrics {
        eprintln!("{}", serde_json::to_string_pretty(&get_metrics())?);
    }
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
