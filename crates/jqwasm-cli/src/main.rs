use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jqwasm_runtime::{FilterError, JqPool, JqWasmConfig, ModuleLoader};
use tracing_subscriber::{EnvFilter, fmt};

/// Exit status when the engine rejects a filter or an input.
const FILTER_FAILURE: u8 = 5;

#[derive(Parser)]
#[command(name = "jqw", version, about = "Run jq filters on a WebAssembly jq engine")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Engine module to load instead of the configured one
    #[arg(long, global = true)]
    module: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply FILTER to each input file, or to stdin
    Run {
        filter: String,
        files: Vec<PathBuf>,
        /// Always print every output as one JSON array
        #[arg(long)]
        all: bool,
        /// Pretty-print the result
        #[arg(long)]
        pretty: bool,
    },
    /// Check that FILTER compiles
    Validate { filter: String },
    /// Check that FILE (or stdin) is valid JSON
    ValidateJson { file: Option<PathBuf> },
    /// Print the engine version
    Version,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr; stdout carries filter output only
    fmt()
        .with_env_filter(EnvFilter::from_env("JQW_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => JqWasmConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => JqWasmConfig::default(),
    };

    let pool = match cli.command {
        // One instance is enough for anything but `run`.
        Command::Run { .. } => open_pool(&config, cli.module.as_deref(), config.pool.size)?,
        _ => open_pool(&config, cli.module.as_deref(), 1)?,
    };

    match cli.command {
        Command::Run {
            filter,
            files,
            all,
            pretty,
        } => run(Arc::new(pool), filter, files, all, pretty).await,
        Command::Validate { filter } => {
            if pool.is_valid_filter(&filter)? {
                println!("valid");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("jqw: invalid filter: {filter}");
                Ok(ExitCode::from(FILTER_FAILURE))
            }
        }
        Command::ValidateJson { file } => {
            let input = read_input(file.as_deref())?;
            if pool.with_instance(|jq| jq.is_valid_json(&input))?? {
                println!("valid");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("jqw: invalid JSON");
                Ok(ExitCode::from(FILTER_FAILURE))
            }
        }
        Command::Version => {
            println!("{}", pool.engine_version()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_pool(config: &JqWasmConfig, module: Option<&Path>, size: usize) -> Result<JqPool> {
    let loader = ModuleLoader::from_config(config)?;
    let module = match module {
        Some(path) => loader.load_path(path)?,
        None => loader.load(|name| config.locate_file(name))?,
    };
    Ok(JqPool::instantiate(&loader, &module, size)?)
}

async fn run(
    pool: Arc<JqPool>,
    filter: String,
    files: Vec<PathBuf>,
    all: bool,
    pretty: bool,
) -> Result<ExitCode> {
    let sources: Vec<Option<PathBuf>> = if files.is_empty() {
        vec![None]
    } else {
        files.into_iter().map(Some).collect()
    };

    let mut tasks = Vec::with_capacity(sources.len());
    for source in sources {
        let input = read_input(source.as_deref())?;
        let pool = Arc::clone(&pool);
        let filter = filter.clone();
        let task = if all {
            tokio::spawn(pool.run_all_async(input, filter))
        } else {
            tokio::spawn(pool.run_async(input, filter))
        };
        tasks.push((source, task));
    }

    let mut status = ExitCode::SUCCESS;
    for (source, task) in tasks {
        let name = source
            .as_deref()
            .map_or_else(|| "<stdin>".to_string(), |p| p.display().to_string());
        match task.await? {
            Ok(output) => println!("{}", render(output, pretty)),
            Err(FilterError::Runtime(e)) => return Err(e).context(name),
            Err(e) => {
                tracing::debug!(input = %name, error = ?e, "filter failed");
                eprintln!("jqw: {name}: {}", e.message());
                status = ExitCode::from(FILTER_FAILURE);
            }
        }
    }
    Ok(status)
}

fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
        }
        None => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("reading stdin")?;
            Ok(input)
        }
    }
}

fn render(output: String, pretty: bool) -> String {
    if !pretty {
        return output;
    }
    match serde_json::from_str::<serde_json::Value>(&output) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or(output),
        Err(_) => output,
    }
}
