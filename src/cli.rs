//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Properties fetched when neither `-p` nor the config file names any.
pub const DEFAULT_PROPERTIES: &[&str] = &["cas", "molecular_weight", "iupac_name"];

/// How the result table is printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Aligned columns for reading in a terminal.
    #[default]
    Table,
    /// Comma-separated values with a header line.
    Csv,
    /// One JSON document with `columns` and `rows`.
    Json,
}

/// Retrieve compound properties from PubChem.
///
/// Identifiers may be PubChem CIDs, compound names or SMILES strings, mixed
/// freely. One output row is printed per identifier, in input order.
#[derive(Parser, Debug)]
#[command(name = "chemfetch")]
#[command(author, version, about)]
pub struct Args {
    /// Identifiers to resolve (read from stdin, one per line, when omitted)
    pub identifiers: Vec<String>,

    /// Properties to fetch, comma-separated (names, aliases, or the groups core, 3d, all)
    #[arg(short, long, value_delimiter = ',')]
    pub properties: Vec<String>,

    /// Treat every non-numeric identifier as a SMILES structure
    #[arg(long)]
    pub structure: bool,

    /// Output format
    #[arg(short, long, value_enum, value_name = "FORMAT")]
    pub format: Option<OutputFormat>,

    /// Shorthand for `--format json`
    #[arg(long, conflicts_with = "format")]
    pub json: bool,

    /// Maximum requests per second (0 to disable, max 100)
    #[arg(short = 'l', long, value_parser = clap::value_parser!(u32).range(0..=100))]
    pub rate_limit: Option<u32>,

    /// Maximum retry attempts for transient failures (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// SQLite cache file
    #[arg(long, value_name = "PATH", conflicts_with = "no_cache")]
    pub cache: Option<PathBuf>,

    /// Disable response caching
    #[arg(long)]
    pub no_cache: bool,

    /// Give up on the whole batch after this many seconds
    #[arg(short, long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..=86_400))]
    pub timeout: Option<u64>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
