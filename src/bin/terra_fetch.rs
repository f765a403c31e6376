use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use terra_retriever::config::ConfigLoader;
use terra_retriever::downloader::{Downloader, RetrievalRequest};
use terra_retriever::error::RetrievalError;
use terra_retriever::locator::Locator;
use terra_retriever::result::RetrievalResult;

#[derive(Parser)]
#[command(name = "terra-fetch")]
#[command(about = "Fetch remote map data into the local retrieval cache")]
#[command(version, author)]
struct Cli {
    /// Locators to fetch (file:, http:, https:)
    #[arg(required = true)]
    locators: Vec<String>,

    /// Path to a JSON config file (defaults to ./terra-fetch.json)
    #[arg(long)]
    config: Option<String>,

    /// Override the cache directory
    #[arg(long)]
    cache_dir: Option<String>,

    /// Revalidate cached copies instead of trusting them
    #[arg(long)]
    revalidate: bool,

    /// Ignore cached copies and fetch fresh payloads
    #[arg(long)]
    no_cache: bool,

    /// Decompress zip/gzip payloads transparently
    #[arg(long)]
    decompress: bool,

    /// Scheduling priority for these fetches
    #[arg(long, default_value_t = 0)]
    priority: i32,
}

#[derive(Debug, Serialize)]
struct FetchSummary {
    locator: String,
    bytes: usize,
    from_cache: bool,
    not_modified: bool,
    content_type: Option<String>,
    cache_path: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(summaries) => {
            match serde_json::to_string_pretty(&summaries) {
                Ok(json) => println!("{json}"),
                Err(err) => {
                    eprintln!("failed to render summary: {err}");
                    return ExitCode::from(1);
                }
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("{:?}", miette::Report::new(error.clone()));
            ExitCode::from(map_exit_code(&error))
        }
    }
}

fn run(cli: &Cli) -> Result<Vec<FetchSummary>, RetrievalError> {
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(dir) = &cli.cache_dir {
        config.cache_root = Some(Utf8PathBuf::from(dir));
    }
    let downloader = Downloader::new(config)?;

    let mut summaries = Vec::new();
    for raw in &cli.locators {
        let locator: Locator = raw.parse()?;
        let mut request = RetrievalRequest::new(locator.clone());
        request.decompress = cli.decompress;
        request.priority = cli.priority;

        let result = if cli.no_cache {
            let handle = downloader
                .fetch_async_no_cache(request, Arc::new(|_result: Arc<RetrievalResult>| {}));
            let result = handle.wait();
            match result.error() {
                Some(error) => return Err(error.clone()),
                None => result,
            }
        } else if cli.revalidate {
            downloader.fetch_if_modified(request)?
        } else {
            downloader.fetch(request)?
        };

        summaries.push(FetchSummary {
            locator: locator.to_string(),
            bytes: result.data().map(|data| data.len()).unwrap_or(0),
            from_cache: result.from_cache(),
            not_modified: result.not_modified(),
            content_type: result.content_type().map(|value| value.to_string()),
            cache_path: downloader.cache().entry_path(&locator).to_string(),
        });
    }

    downloader.shutdown();
    Ok(summaries)
}

fn map_exit_code(error: &RetrievalError) -> u8 {
    match error {
        RetrievalError::InvalidLocator(_) => 2,
        RetrievalError::ConfigRead(_) | RetrievalError::ConfigParse(_) => 2,
        RetrievalError::Connection(_) | RetrievalError::Protocol { .. } => 3,
        _ => 1,
    }
}
