use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use txguard_core::ParameterRow;
use txguard_driver_sqlite::{SqliteDriver, SqliteDriverConfig};
use txguard_executor::{
    ExecutionSummary, ExecutorSettings, FailurePolicy, ParallelProcedure, ParallelRequest,
};

mod logging;
mod output;

#[derive(Parser, Debug)]
#[command(name = "txguard")]
#[command(version)]
#[command(about = "Run one statement over a list of values in parallel transactions")]
struct Args {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a statement once per element of a list parameter
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// SQLite database file (or :memory:)
    #[arg(short, long, value_name = "FILE", env = "TXGUARD_DATABASE")]
    database: String,

    /// Statement to execute, with :name parameters
    #[arg(short, long, value_name = "SQL")]
    statement: String,

    /// Parameters as a JSON object
    #[arg(short, long, value_name = "JSON", default_value = "{}")]
    parameters: String,

    /// Parameter holding the list to iterate over
    #[arg(short = 'k', long, value_name = "KEY")]
    iteration_key: String,

    /// Number of concurrent transactions
    #[arg(long, value_name = "N")]
    parallelism: Option<i64>,

    /// Per-transaction timeout in milliseconds (0 = none)
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<i64>,

    /// What a partition failure does to the rest of the call
    #[arg(long, value_enum)]
    policy: Option<Policy>,

    /// Executor settings file (TOML, [executor] table)
    #[arg(long, value_name = "FILE", env = "TXGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum number of SQLite connections
    #[arg(long, value_name = "N", default_value_t = 16)]
    max_connections: usize,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Policy {
    FailTogether,
    Isolated,
}

impl From<Policy> for FailurePolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::FailTogether => FailurePolicy::FailTogether,
            Policy::Isolated => FailurePolicy::Isolated,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.json_logs)?;

    match args.command {
        Command::Run(run) => run_command(run).await,
    }
}

async fn run_command(args: RunArgs) -> anyhow::Result<()> {
    let mut options = match &args.config {
        Some(path) => {
            ExecutorSettings::from_toml_file(path)
                .with_context(|| format!("loading {}", path.display()))?
                .executor
        }
        None => ExecutorSettings::default().executor,
    };
    if let Some(policy) = args.policy {
        options = options.with_failure_policy(policy.into());
    }

    let parameters: ParameterRow =
        serde_json::from_str(&args.parameters).context("--parameters must be a JSON object")?;
    let rows_in = parameters
        .get(&args.iteration_key)
        .and_then(|v| v.as_array())
        .map_or(0, <[_]>::len);
    let request = ParallelRequest::new(args.statement, parameters, args.iteration_key)
        .with_parallelism(args.parallelism.unwrap_or(options.parallelism as i64))
        .with_timeout_ms(
            args.timeout_ms
                .unwrap_or(options.transaction_timeout_ms as i64),
        );

    let driver = Arc::new(SqliteDriver::open(
        SqliteDriverConfig::new(&args.database).with_max_connections(args.max_connections),
    )?);
    let procedure = ParallelProcedure::with_defaults(driver, options);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, rolling back open transactions");
                cancel.cancel();
            }
        }
    });

    let start = std::time::Instant::now();
    let results = procedure.run_detailed(request, cancel).await?;
    let summary = ExecutionSummary::from_results(
        &results,
        rows_in,
        start.elapsed(),
    );

    let rows: Vec<_> = results
        .iter()
        .filter_map(|r| r.rows())
        .flatten()
        .cloned()
        .collect();
    output::write_rows(&mut std::io::stdout().lock(), &rows)?;
    eprintln!("{}", output::render_summary(&results, &summary));

    if !summary.is_success() {
        anyhow::bail!("{} partition(s) did not commit", summary.failed + summary.cancelled);
    }
    Ok(())
}
