use chrono::NaiveDate;
use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::services::formula::DEFAULT_PATTERN_TAG_LENGTH;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "virtual-sensor-calc",
    version,
    about = "Derive virtual sensor series from raw plant sensor readings"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Calculate and save derived rows for one processing date.
    Run(RunArgs),
    /// Parse an expression and print the tags it references.
    Check(CheckArgs),
    /// List registered formulas.
    List(ListArgs),
}

#[derive(Args, Debug, Clone)]
#[command(group(ArgGroup::new("selection").required(true).args(["formula", "all"])))]
pub struct RunArgs {
    /// Processing date (YYYY-MM-DD).
    #[arg(long)]
    pub date: NaiveDate,
    /// Formula id to run; repeat for several.
    #[arg(long = "formula", value_name = "ID")]
    pub formula: Vec<String>,
    /// Run every registered formula.
    #[arg(long, default_value_t = false)]
    pub all: bool,
    /// Formula file; with --readings, runs from files instead of Postgres.
    #[arg(long, requires = "readings")]
    pub formulas: Option<PathBuf>,
    #[arg(long, requires = "formulas")]
    pub readings: Option<PathBuf>,
    /// Where to write saved rows in file mode (default stdout).
    #[arg(long, requires = "formulas")]
    pub output: Option<PathBuf>,
    /// Delete previously saved rows of the selected formulas for this date first.
    #[arg(long, default_value_t = false)]
    pub replace: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    #[arg(long)]
    pub expression: String,
    /// Token length for the plant tag pattern scan.
    #[arg(long, default_value_t = DEFAULT_PATTERN_TAG_LENGTH)]
    pub tag_length: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Read formulas from this file instead of Postgres.
    #[arg(long)]
    pub formulas: Option<PathBuf>,
}
