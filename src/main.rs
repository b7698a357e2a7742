use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use stream_aggregator::{
    AggregationResult, Aggregator, CacheStore, ConfigHandle, ConfigProvider, ContentIdentity,
    DiscoveryClient, FileCache, LifecycleState, MemoryCache, ProviderSource, ReqwestTransport,
    StaticProviders,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "stream_aggregator")]
#[command(about = "Collect and merge streaming sources for a title from many providers")]
#[command(version)]
struct Args {
    /// Title to search for
    #[arg(short, long)]
    title: String,

    /// Original (untranslated) title
    #[arg(long)]
    original_title: Option<String>,

    /// Original language code, e.g. "ja"
    #[arg(long)]
    original_language: Option<String>,

    /// Release year
    #[arg(short, long)]
    year: Option<u32>,

    /// Catalog id
    #[arg(long)]
    id: Option<String>,

    #[arg(long)]
    imdb_id: Option<String>,

    #[arg(long)]
    kinopoisk_id: Option<String>,

    /// The title is a series
    #[arg(long)]
    serial: bool,

    /// Only list this season
    #[arg(short, long)]
    season: Option<u32>,

    /// Only list this episode
    #[arg(short, long)]
    episode: Option<u32>,

    /// Configuration file (TOML); defaults apply when missing
    #[arg(short, long, default_value = "stream_aggregator.toml", env = "STREAM_AGGREGATOR_CONFIG")]
    config: PathBuf,

    /// Provider list file (TOML); the configured discovery URL is used otherwise
    #[arg(short, long, env = "STREAM_AGGREGATOR_PROVIDERS")]
    providers: Option<PathBuf>,

    /// Keep results in memory only
    #[arg(long)]
    no_cache: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn identity(&self) -> ContentIdentity {
        ContentIdentity {
            id: self.id.clone(),
            imdb_id: self.imdb_id.clone(),
            kinopoisk_id: self.kinopoisk_id.clone(),
            title: self.title.clone(),
            original_title: self.original_title.clone(),
            original_language: self.original_language.clone(),
            year: self.year,
            is_serial: self.serial || self.season.is_some() || self.episode.is_some(),
        }
    }
}

/// Prints the result in a human-readable form
fn print_result(result: &AggregationResult) {
    println!("\n=== Providers ===\n");

    if result.provider_statuses.is_empty() {
        println!("No providers available.");
    }

    for status in &result.provider_statuses {
        let state = match status.state {
            LifecycleState::Completed => format!("{} item(s)", status.item_count),
            LifecycleState::Empty => "no items".to_string(),
            LifecycleState::Error => {
                format!("error: {}", status.error.as_deref().unwrap_or("unknown"))
            }
            other => format!("{:?}", other),
        };
        let time = status
            .response_time_ms
            .map(|ms| format!(" ({} ms)", ms))
            .unwrap_or_default();
        println!("  {:<20} {}{}", status.name, state, time);
    }

    println!("\n=== Sources ({}) ===\n", result.kind);

    if result.merged_items.is_empty() {
        println!("No sources found.");
        return;
    }

    for item in &result.merged_items {
        let position = match (item.season, item.episode) {
            (Some(season), Some(episode)) => format!("S{:02}E{:02} ", season, episode),
            (Some(season), None) => format!("S{:02} ", season),
            _ => String::new(),
        };
        let quality = item.quality.as_ref().map(|q| q.label.as_str()).unwrap_or("?");
        let voice = item.voice.as_ref().map(|v| v.label.as_str()).unwrap_or("-");
        println!("{}{} [{} | {}] via {}", position, item.title, quality, voice, item.provider_name);
        println!("  {}", item.effective_stream());
    }

    let facets = |facets: &[stream_aggregator::Facet]| {
        facets
            .iter()
            .map(|f| format!("{} ({})", f.label, f.count))
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!("\nQualities: {}", facets(&result.metadata.quality_facets));
    println!("Voices: {}", facets(&result.metadata.voice_facets));
    println!("\nFound {} source(s).", result.metadata.total_items);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stream_aggregator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let config = Arc::new(
        ConfigHandle::load_or_default(&args.config)
            .with_context(|| {
                format!("Failed to load configuration from {}", args.config.display())
            })?,
    );
    let current = config.current().config;

    let transport = Arc::new(ReqwestTransport::new().context("Failed to create HTTP client")?);

    let source: Arc<dyn ProviderSource> = match (&args.providers, &current.discovery_url) {
        (Some(path), _) => Arc::new(
            StaticProviders::load(path)
                .with_context(|| format!("Failed to load providers from {}", path.display()))?,
        ),
        (None, Some(url)) => Arc::new(DiscoveryClient::new(
            transport.clone(),
            url.clone(),
            current.request_timeout(),
        )),
        (None, None) => {
            bail!("No providers: pass --providers or set discovery_url in the configuration")
        }
    };

    let cache: Arc<dyn CacheStore> = if args.no_cache {
        Arc::new(MemoryCache::new())
    } else {
        match FileCache::open("aggregations") {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                warn!(error = %e, "File cache unavailable, using memory cache");
                Arc::new(MemoryCache::new())
            }
        }
    };

    let aggregator = Aggregator::new(source, transport, config, cache);
    let identity = args.identity();

    info!(title = %identity.title, "Aggregating");
    let result = aggregator.aggregate(&identity, args.season, args.episode).await;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("Failed to encode result")?
        );
    } else {
        print_result(&result);
    }

    Ok(())
}
