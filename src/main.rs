use anyhow::{bail, Context, Result};
use b2up::{
    api::{B2Api, HttpApi},
    config::Config,
    helper::{self, Uploaded},
    progress::ProgressListener,
};
use clap::{Args, Parser, Subcommand};
use std::{
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Manage and upload to Backblaze B2")]
struct Cli {
    /// TOML settings file with [account] and [upload] tables
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Overrides {
    /// Account ID (overrides B2_ACCOUNT_ID)
    #[arg(long, global = true)]
    account_id: Option<String>,

    /// Application key (overrides B2_APPLICATION_KEY)
    #[arg(long, global = true)]
    application_key: Option<String>,

    /// Number of parts uploaded at once
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Directory for temp piece files
    #[arg(long, global = true)]
    temp_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage buckets
    #[command(subcommand)]
    #[command(alias = "buckets")]
    Bucket(BucketCommand),
    /// Manage files
    #[command(subcommand)]
    #[command(alias = "files")]
    File(FileCommand),
    /// Upload a file, as a large file when it is over the threshold
    #[command(alias = "put")]
    Upload { bucket_id: String, path: PathBuf },
}

#[derive(Subcommand, Debug)]
enum BucketCommand {
    /// Create a new bucket
    #[command(alias = "new")]
    Create {
        name: String,
        /// Make the bucket public instead of private
        #[arg(long)]
        public: bool,
    },
    /// List all buckets in the account
    List,
}

#[derive(Subcommand, Debug)]
enum FileCommand {
    /// List file names in a bucket
    List {
        bucket_id: String,
        /// File name to start listing from
        #[arg(long)]
        start: Option<String>,
        /// Follow every page instead of the first one
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_log_level(cli.debug))),
        )
        .with_writer(io::stderr)
        .init();

    let config = load_config(&cli)?;
    let api = Arc::new(HttpApi::new(&config).context("building HTTP client")?);

    match cli.command {
        Command::Bucket(BucketCommand::Create { name, public }) => {
            let auth = api.authorize().await?;
            let bucket = api.create_bucket(&auth, &name, public).await?;
            println!("Created bucket {} ({})", bucket.bucket_name, bucket.bucket_id);
        }
        Command::Bucket(BucketCommand::List) => {
            let auth = api.authorize().await?;
            let buckets = api.list_buckets(&auth).await?;
            if buckets.is_empty() {
                bail!("No buckets to print");
            }
            println!("B2 Buckets");
            println!("{:<26} {:<50} {}", "-ID-", "-NAME-", "-TYPE-");
            for bucket in buckets {
                println!(
                    "{:<26} {:<50} {}",
                    bucket.bucket_id, bucket.bucket_name, bucket.bucket_type
                );
            }
        }
        Command::File(FileCommand::List {
            bucket_id,
            start,
            all,
        }) => {
            let auth = api.authorize().await?;
            let mut start = start;
            loop {
                let page = api
                    .list_file_names(&auth, &bucket_id, start.as_deref())
                    .await?;
                for file in &page.files {
                    println!(
                        "\nFileID: {}\nFilename: {}\nSHA1: {}\nBlake2b: {}\nSize: {}",
                        file.file_id,
                        file.file_name,
                        file.content_sha1.as_deref().unwrap_or("-"),
                        file.file_info.content_blake2b.as_deref().unwrap_or("-"),
                        file.content_length
                    );
                }
                match page.next_file_name {
                    Some(next) if all => start = Some(next),
                    _ => break,
                }
            }
        }
        Command::Upload { bucket_id, path } => {
            let uploaded =
                helper::upload_file(api, &config, &bucket_id, &path, Some(progress_printer()))
                    .await;
            eprintln!();
            if let Err(helper::Error::LargeFileError(e)) = &uploaded {
                for path in e.retained() {
                    eprintln!("Temp file kept for inspection: {}", path.display());
                }
            }
            match uploaded? {
                Uploaded::Standard(file) => {
                    println!("Upload complete\nFilename: {}\nFileID: {}", file.file_name, file.file_id);
                }
                Uploaded::Large(outcome) => {
                    println!(
                        "Large file upload complete\nFilename: {}\nFileID: {}",
                        outcome.file.file_name, outcome.file.file_id
                    );
                    for path in &outcome.cleanup.retained {
                        println!("Temp file kept for inspection: {}", path.display());
                    }
                }
            }
        }
    }

    Ok(())
}

fn default_log_level(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    let overrides = &cli.overrides;
    if let Some(v) = &overrides.account_id {
        config.account_id = v.clone();
    }
    if let Some(v) = &overrides.application_key {
        config.application_key = v.clone();
    }
    if let Some(v) = overrides.concurrency {
        config.upload_concurrency = v;
    }
    if let Some(v) = &overrides.temp_dir {
        config.temp_dir = v.clone();
    }
    config.validate()?;
    Ok(config)
}

fn progress_printer() -> ProgressListener {
    Arc::new(Mutex::new(
        |name: Arc<String>, part: usize, pos: usize, total: usize| {
            let percent = if total == 0 { 100 } else { pos * 100 / total };
            eprint!("\r{name} part {part}: {pos}/{total} bytes ({percent}%)   ");
            let _ = io::stderr().flush();
        },
    ))
}
