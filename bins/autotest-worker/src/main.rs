mod config;
mod executor;
mod files;
mod identity;
mod json_stream;
mod report;
mod rlimit;
mod runner;
mod runner_tests;
mod store;
mod testers;
mod workspace;

use anyhow::Context;
use autotest_common::redis;
use autotest_common::types::Job;
use clap::{Parser, Subcommand};
use config::WorkerConfig;
use executor::ChildProcessExecutor;
use files::HttpArchiveSource;
use identity::{WorkerIdentity, WorkerIdentityPool};
use nix::unistd::Uid;
use rlimit::ResourceLimitPolicy;
use runner::JobRunner;
use std::path::PathBuf;
use std::sync::Arc;
use store::RedisStore;
use testers::env::EnvironmentProvisioner;
use testers::TesterOptions;
use tokio::signal;
use tracing::{debug, error, info, instrument, warn};
use workspace::WorkspaceCustodian;

#[derive(Parser)]
#[command(name = "autotest-worker")]
#[command(about = "Runs queued autotest jobs as sandboxed worker users", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume jobs from the configured queues
    Serve {
        /// Worker config file (defaults to $AUTOTEST_CONFIG or config/autotest.json)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run one tester: specs on stdin, results on stdout
    Tester {
        #[arg(long)]
        junit_jar: Option<PathBuf>,

        /// Resource limits as JSON, e.g. {"cpu": [30, 60]}
        #[arg(long)]
        rlimits: Option<String>,
    },

    /// Remove everything the calling user owns under a workspace
    Purge {
        #[arg(long)]
        root: PathBuf,

        /// Scratch directory to sweep as well (repeatable)
        #[arg(long = "scratch")]
        scratch: Vec<PathBuf>,
    },

    /// Kill every process of the calling user
    Reap,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    // LOG_FORMAT=json for log shippers
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Tester stdout is the result stream; nothing else may write to it.
        Command::Tester { junit_jar, rlimits } => {
            let limits = match rlimits {
                Some(json) => serde_json::from_str(&json).context("Invalid --rlimits")?,
                None => ResourceLimitPolicy::default(),
            };
            let options = TesterOptions { junit_jar, limits };
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            tokio::task::block_in_place(|| {
                testers::run_from_reader(std::io::stdin().lock(), &mut out, &options)
            });
            Ok(())
        }
        Command::Purge { root, scratch } => {
            init_tracing();
            let owner = Uid::current();
            let mut report = workspace::purge(&root, owner);
            report.merge(workspace::sweep_scratch(&scratch, owner));
            println!("{}", serde_json::to_string(&report)?);
            Ok(())
        }
        Command::Reap => {
            init_tracing();
            executor::kill_all_own_processes().context("Failed to kill processes")?;
            Ok(())
        }
        Command::Serve { config } => {
            init_tracing();
            serve(config).await
        }
    }
}

async fn serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!("Autotest worker booting...");

    let config = match &config_path {
        Some(path) => WorkerConfig::load(path),
        None => WorkerConfig::load_default(),
    }
    .map_err(|e| {
        error!("Failed to load worker configuration: {:#}", e);
        error!("Make sure config/autotest.json exists or AUTOTEST_CONFIG is set");
        e
    })?;

    let worker_exe = std::env::current_exe().context("Cannot locate the worker executable")?;
    let executor = ChildProcessExecutor::new(worker_exe, config.rlimit_settings.clone(), config.junit_jar.clone())
        .context("Invalid rlimit_settings")?;
    debug!(limits = ?config.rlimit_settings, "Resource limits resolved");

    let identities = config
        .workers
        .iter()
        .map(|worker| WorkerIdentity::lookup(worker, &config.workspace))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if !Uid::effective().is_root() && identities.iter().any(|i| !i.is_current_user()) {
        warn!("Worker users differ from the current user; sudo must allow running as them");
    }
    let pool = WorkerIdentityPool::new(identities);

    let queues = config.queues();
    info!(
        workers = pool.size(),
        concurrency = config.concurrency(),
        queues = ?queues,
        workspace = %config.workspace.display(),
        "Worker configured"
    );

    let client = ::redis::Client::open(config.redis_url.as_str())?;
    let store_conn = ::redis::aio::ConnectionManager::new(client.clone()).await?;
    info!("Connected to Redis: {}", config.redis_url);

    let runner = Arc::new(JobRunner::new(
        Arc::new(RedisStore::new(store_conn, config.result_ttl_secs)),
        Arc::new(HttpArchiveSource::new()),
        pool,
        Arc::new(WorkspaceCustodian::new(&config)?),
        Arc::new(executor),
        Arc::new(EnvironmentProvisioner::new(config.python_requirements.clone())),
    ));

    // BLPOP holds its connection, so every consumer gets its own.
    let mut consumers = tokio::task::JoinSet::new();
    for index in 0..config.concurrency() {
        let conn = ::redis::aio::ConnectionManager::new(client.clone()).await?;
        let runner = Arc::clone(&runner);
        let queues = queues.clone();
        consumers.spawn(async move { consume(index, conn, queues, runner).await });
    }

    tokio::select! {
        _ = signal::ctrl_c() => {
            warn!("Received shutdown signal, stopping consumers...");
        }
        Some(finished) = consumers.join_next() => {
            error!(result = ?finished, "Consumer stopped unexpectedly");
        }
    }
    consumers.shutdown().await;

    info!("Worker shutdown complete");
    Ok(())
}

#[instrument(skip(conn, queues, runner))]
async fn consume(
    index: usize,
    mut conn: ::redis::aio::ConnectionManager,
    queues: Vec<String>,
    runner: Arc<JobRunner>,
) {
    loop {
        // BLPOP with 5 second timeout for graceful shutdown
        match redis::pop_payload(&mut conn, &queues, 5.0).await {
            Ok(Some((queue, payload))) => {
                let job = match Job::from_payload(&payload) {
                    Ok(job) => job,
                    Err(invalid) => {
                        match &invalid.test_id {
                            Some(test_id) => {
                                warn!(queue = %queue, test_id = %test_id, error = %invalid, "Invalid job");
                                runner.reject(test_id, &invalid.error.to_string()).await;
                            }
                            None => error!(queue = %queue, error = %invalid, "Dropping unreadable job"),
                        }
                        continue;
                    }
                };
                info!(
                    queue = %queue,
                    test_id = %job.test_id,
                    settings_id = %job.settings_id,
                    categories = ?job.categories,
                    "Received job"
                );
                let result = runner.run(job).await;
                if let Some(error) = &result.error {
                    warn!(error = %error, "Job finished with an error");
                }
            }
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }
}
