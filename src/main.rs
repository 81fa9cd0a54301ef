use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};
use txretry::{
    Account, ClientConfig, InitAccounts, MemoryDatabase, RetryPolicy, Session, Transfer,
    TransactionRetryExecutor,
};

#[derive(Parser, Debug)]
#[command(name = "txretry")]
#[command(about = "Initialize an accounts table and transfer funds with automatic transaction retries")]
struct Cli {
    /// PostgreSQL/CockroachDB URL, e.g. postgresql://root@localhost:26257/defaultdb.
    /// Without it the in-memory backend is used.
    #[arg(long, env = "TXRETRY_URL")]
    url: Option<String>,

    #[arg(long, env = "TXRETRY_FROM", default_value_t = 1)]
    from: i64,

    #[arg(long, env = "TXRETRY_TO", default_value_t = 2)]
    to: i64,

    #[arg(long, env = "TXRETRY_AMOUNT", default_value_t = 100)]
    amount: i64,

    /// Attempt counter value at which retrying stops
    #[arg(long, env = "TXRETRY_MAX_ATTEMPTS", default_value_t = 15)]
    max_attempts: u32,

    #[arg(long, env = "TXRETRY_BASE_BACKOFF_MS", default_value_t = 1000)]
    base_backoff_ms: u64,

    #[arg(long, env = "TXRETRY_MAX_BACKOFF_MS")]
    max_backoff_ms: Option<u64>,

    /// Serialization failures to inject into the transfer's commits (in-memory backend only)
    #[arg(long, env = "TXRETRY_INJECT_CONFLICTS", default_value_t = 0)]
    inject_conflicts: u32,
}

impl Cli {
    fn policy(&self) -> Result<RetryPolicy> {
        let mut policy = RetryPolicy::new(self.max_attempts)
            .base_backoff(Duration::from_millis(self.base_backoff_ms));
        if let Some(cap) = self.max_backoff_ms {
            policy = policy.max_backoff(Duration::from_millis(cap));
        }
        policy.validate().map_err(|e| anyhow!(e))?;
        Ok(policy)
    }

    fn transfer(&self) -> Transfer {
        Transfer::new(self.from, self.to, self.amount)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .compact()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting tracing default failed")?;

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling pending retries");
            on_signal.cancel();
        }
    });

    let executor = TransactionRetryExecutor::new(cli.policy()?).with_cancellation(cancel);

    match &cli.url {
        None => run_in_memory(&cli, &executor).await,
        Some(url) => run_remote(&cli, url, &executor).await,
    }
}

async fn run_in_memory(cli: &Cli, executor: &TransactionRetryExecutor) -> Result<()> {
    let db = MemoryDatabase::new();
    let mut session = db.session();

    initialize(&mut session, executor).await?;
    if cli.inject_conflicts > 0 {
        tracing::info!(count = cli.inject_conflicts, "injecting serialization failures");
        db.fail_next_commits(cli.inject_conflicts);
    }
    transfer(&mut session, executor, cli.transfer()).await
}

#[cfg(feature = "postgres")]
async fn run_remote(cli: &Cli, url: &str, executor: &TransactionRetryExecutor) -> Result<()> {
    if cli.inject_conflicts > 0 {
        bail!("--inject-conflicts is only supported by the in-memory backend");
    }
    let config = ClientConfig::from_url(url).map_err(|e| anyhow!(e))?;
    let mut client = config
        .connect()
        .await
        .with_context(|| format!("connecting to {}", config.to_url()))?;

    initialize(&mut client, executor).await?;
    transfer(&mut client, executor, cli.transfer()).await
}

#[cfg(not(feature = "postgres"))]
async fn run_remote(_cli: &Cli, url: &str, _executor: &TransactionRetryExecutor) -> Result<()> {
    let config = ClientConfig::from_url(url).map_err(|e| anyhow!(e))?;
    bail!(
        "cannot connect to {}: rebuild with `--features postgres` to use a database server",
        config.to_url()
    )
}

async fn initialize<S>(session: &mut S, executor: &TransactionRetryExecutor) -> Result<()>
where
    S: Session + ?Sized,
{
    println!("Initializing table...");
    let accounts = executor
        .run_operation(session, &InitAccounts)
        .await
        .context("initializing accounts table")?;
    print_balances(&accounts);
    Ok(())
}

async fn transfer<S>(session: &mut S, executor: &TransactionRetryExecutor, transfer: Transfer) -> Result<()>
where
    S: Session + ?Sized,
{
    println!("Transferring funds...");
    let accounts = executor
        .run_operation(session, &transfer)
        .await
        .with_context(|| {
            format!(
                "transferring {} from account {} to account {}",
                transfer.amount, transfer.from, transfer.to
            )
        })?;
    print_balances(&accounts);
    Ok(())
}

fn print_balances(accounts: &[Account]) {
    if accounts.is_empty() {
        return;
    }
    println!("New account balances:");
    for account in accounts {
        println!("{}", account);
    }
}
