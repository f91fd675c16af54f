mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "autotest-cli")]
#[command(about = "Autotest CLI - Enqueue jobs, inspect queues and results, expire settings", long_about = None)]
struct Cli {
    /// Redis connection URL (defaults to $REDIS_URL, then redis://127.0.0.1:6379)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Put a grading job on a queue
    Enqueue {
        /// Queue name (e.g., student, batch)
        #[arg(short, long)]
        queue: String,

        #[arg(short, long)]
        settings_id: String,

        #[arg(short, long)]
        test_id: String,

        /// URL of the zipped submission
        #[arg(short, long)]
        files_url: String,

        /// Test category to run (repeatable)
        #[arg(short, long = "category")]
        categories: Vec<String>,

        /// User whose credentials download the files
        #[arg(short, long)]
        user: String,

        /// Extra environment variable for the tests, as KEY=VALUE (repeatable)
        #[arg(short, long = "env")]
        env: Vec<String>,
    },

    /// Print the published result of a test run
    Result {
        #[arg(short, long)]
        test_id: String,
    },

    /// Show how many jobs wait on each queue
    Stat {
        /// Queue names
        #[arg(required = true)]
        queues: Vec<String>,
    },

    /// Expire settings that were not used for a number of days
    Clean {
        #[arg(short, long, default_value = "30")]
        days: i64,

        /// Only list what would be expired
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let redis_url = cli
        .redis_url
        .or_else(|| std::env::var("REDIS_URL").ok())
        .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());
    let mut conn = commands::connect(&redis_url).await?;

    match cli.command {
        Commands::Enqueue {
            queue,
            settings_id,
            test_id,
            files_url,
            categories,
            user,
            env,
        } => {
            let job = commands::build_job(settings_id, test_id, files_url, categories, user, &env)?;
            commands::enqueue(&mut conn, &queue, &job).await?;
        }
        Commands::Result { test_id } => {
            commands::show_result(&mut conn, &test_id).await?;
        }
        Commands::Stat { queues } => {
            commands::queue_stats(&mut conn, &queues).await?;
        }
        Commands::Clean { days, dry_run } => {
            commands::clean_settings(&mut conn, days, dry_run).await?;
        }
    }

    Ok(())
}
