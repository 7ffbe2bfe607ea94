//! CLI entry point for chemfetch.

use std::io::{self, IsTerminal, Read, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use chemfetch_core::{CacheBackend, Engine, EngineConfig, RawIdentifier};
use clap::Parser;
use tracing::{debug, info};

mod app_config;
mod cli;

use app_config::{FileConfig, load_default_file_config, split_list};
use cli::{Args, DEFAULT_PROPERTIES, OutputFormat};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Logs go to stderr; stdout carries the table.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let file_config = match load_default_file_config()? {
        Some((path, config)) => {
            debug!(path = %path.display(), "loaded config file");
            config
        }
        None => FileConfig::default(),
    };

    let input_text = if !args.identifiers.is_empty() {
        args.identifiers.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        info!("No identifiers provided. Pass them as arguments or pipe them via stdin.");
        info!("Example: chemfetch aspirin 2519 -p molecular_weight,cas");
        return Ok(());
    };

    let identifiers = parse_identifiers(&input_text, args.structure);
    if identifiers.is_empty() {
        info!("No identifiers found in input");
        return Ok(());
    }

    let properties = requested_properties(&args, &file_config);
    let config = engine_config(&args, &file_config);
    let format = output_format(&args, &file_config);

    let engine = Engine::new(config).await?;
    let table = match args.timeout {
        Some(secs) => {
            engine
                .retrieve_with_timeout(&identifiers, &properties, Duration::from_secs(secs))
                .await?
        }
        None => engine.retrieve(&identifiers, &properties).await?,
    };

    let rendered = match format {
        OutputFormat::Json => {
            let mut out = table.to_json().context("failed to render JSON")?;
            out.push('\n');
            out
        }
        OutputFormat::Csv => table.to_csv(),
        OutputFormat::Table => table.to_text(),
    };
    io::stdout().lock().write_all(rendered.as_bytes())?;

    let stats = engine.stats();
    info!(
        rows = table.len(),
        requests = stats.attempts,
        retried = stats.retried,
        cache_hits = stats.cache.map_or(0, |cache| cache.hits),
        "Done"
    );

    Ok(())
}

/// One identifier per non-empty line.
fn parse_identifiers(input: &str, structures: bool) -> Vec<RawIdentifier> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            if structures && !line.bytes().all(|b| b.is_ascii_digit()) {
                RawIdentifier::structure(line)
            } else {
                RawIdentifier::from(line)
            }
        })
        .collect()
}

fn requested_properties(args: &Args, file_config: &FileConfig) -> Vec<String> {
    let from_args: Vec<String> = args
        .properties
        .iter()
        .flat_map(|value| split_list(value))
        .collect();
    if !from_args.is_empty() {
        return from_args;
    }
    file_config.properties.clone().unwrap_or_else(|| {
        DEFAULT_PROPERTIES
            .iter()
            .map(|name| (*name).to_string())
            .collect()
    })
}

/// `--format` or `--json`, then the config file, then the aligned table.
fn output_format(args: &Args, file_config: &FileConfig) -> OutputFormat {
    match (args.format, args.json) {
        (Some(format), _) => format,
        (None, true) => OutputFormat::Json,
        (None, false) => file_config.format.unwrap_or_default(),
    }
}

/// Defaults, then the config file, then CLI flags.
fn engine_config(args: &Args, file_config: &FileConfig) -> EngineConfig {
    let mut config = EngineConfig::default();
    file_config.apply(&mut config);

    if let Some(rate_limit) = args.rate_limit {
        config.max_requests = rate_limit;
    }
    if let Some(max_retries) = args.max_retries {
        config.max_attempts = u32::from(max_retries) + 1;
    }
    if let Some(path) = &args.cache {
        config.cache = CacheBackend::Sqlite(path.clone());
    }
    if args.no_cache {
        config.cache = CacheBackend::Disabled;
    }
    config
}
