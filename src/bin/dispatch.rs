use clap::{Parser, Subcommand};
use image_compress_worker::{AppConfig, BrokerConnection, Dispatcher, ImageJob, JobStatus, JobStore, PgJobStore};
use std::sync::Arc;

/// Operator tool for image compression jobs.
#[derive(Parser, Debug)]
#[command(name = "dispatch", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a job for an already uploaded file and queue it.
    Enqueue {
        filename: String,
        /// Size of the original in bytes.
        size: i64,
    },
    /// Requeue a failed job.
    Retry { id: i64 },
    /// Print one job.
    Show { id: i64 },
    /// List jobs, newest first.
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
}

fn parse_status(raw: &str) -> Result<JobStatus, String> {
    raw.parse()
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;
    let store = Arc::new(PgJobStore::connect(&config.database_url, config.database_max_connections).await?);

    // Reads need no broker.
    match &command {
        Command::Show { id } => {
            print_job(&store.get_job(*id).await?);
            return Ok(());
        }
        Command::List { status, limit } => {
            let jobs = match status {
                Some(status) => store.list_jobs_by_status(*status, *limit).await?,
                None => store.list_jobs(*limit).await?,
            };
            jobs.iter().for_each(print_job);
            return Ok(());
        }
        _ => {}
    }

    let broker = BrokerConnection::open(&config.rabbitmq_url, config.topology.clone()).await?;
    let dispatcher = Dispatcher::new(store.clone(), Arc::new(broker.publisher()));

    let result = match command {
        Command::Enqueue { filename, size } => dispatcher
            .create_and_enqueue(&filename, size)
            .await
            .map(|id| println!("{}", id)),
        Command::Retry { id } => dispatcher.retry(id).await.map(|()| println!("{} requeued", id)),
        Command::Show { .. } | Command::List { .. } => Ok(()),
    };

    broker.close().await?;
    store.close().await;
    Ok(result?)
}

fn print_job(job: &ImageJob) {
    println!(
        "{}\t{}\t{}\t{}\t{}\t{}",
        job.id,
        job.status,
        job.filename,
        job.original_size,
        job.compressed_size.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
        job.error_message.as_deref().unwrap_or("-")
    );
}
