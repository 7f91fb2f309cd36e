use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use media_cache_proxy::{
    CacheStore, FailureKind, MediaProxy, Prefetcher, ProxyConfig, ProxyContext,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, help = "JSON config file; every field is optional.")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve one source through the proxy until interrupted
    Serve {
        #[arg(help = "Origin URL of the media to play.")]
        url: String,

        #[arg(long, help = "Stream without touching the cache.")]
        no_cache: bool,

        #[arg(long, help = "Warm the cache for another source, e.g. the next track.")]
        prefetch: Vec<String>,
    },

    /// Show what is cached for a source
    Status { url: String },

    /// Drop the cache of one source
    Delete { url: String },

    /// Drop every cached source
    Clear,
}

fn load_config(path: Option<&PathBuf>) -> Result<ProxyConfig, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => ProxyConfig::load(path)?,
        None => ProxyConfig::default(),
    })
}

async fn serve(ctx: ProxyContext, url: String, no_cache: bool, prefetch: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let proxy = MediaProxy::new(ctx.clone());
    proxy.set_error_sink(Some(Arc::new(|kind: FailureKind| {
        log::warn!("Playback source failed: {:?}", kind);
    })));
    proxy.set_progress_sink(Some(Arc::new(|progress: f32| {
        log::trace!("Sent {:.1}%", progress * 100.0);
    })));

    let local = proxy.set_data_source(&url, !no_cache);
    println!("{}", local);

    let prefetcher = Prefetcher::new(ctx);
    for next in &prefetch {
        if let Some(task) = prefetcher.preload(next) {
            task.await?;
        }
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Buffered {:.1}% of {}", proxy.buffering_progress(0.0) * 100.0, url);
    proxy.stop();
    Ok(())
}

fn status(store: &CacheStore, url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let Some(entry) = store.open(url)? else {
        println!("{} is not cached", url);
        return Ok(());
    };
    let info = store.info(&entry)?;
    let parts = info.as_ref().map(|i| i.cache_parts.clone()).unwrap_or_default();
    println!("file:      {}", entry.path().display());
    match info.as_ref().and_then(|i| i.file_size) {
        Some(size) => println!("size:      {}", size),
        None => println!("size:      unknown"),
    }
    println!("cached:    {} bytes [{}]", parts.cached_len(), parts);
    if let Some(duration) = info.and_then(|i| i.duration) {
        println!("duration:  {} ms", duration);
    }
    println!("available: {}", store.is_available(&entry)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    let ctx = ProxyContext::open(config)?;

    match args.command {
        Command::Serve {
            url,
            no_cache,
            prefetch,
        } => serve(ctx, url, no_cache, prefetch).await?,
        Command::Status { url } => status(&ctx.store, &url)?,
        Command::Delete { url } => match ctx.store.open(&url)? {
            Some(entry) => {
                ctx.store.delete(&entry)?;
                println!("Deleted {}", entry.name());
            }
            None => println!("{} is not cached", url),
        },
        Command::Clear => {
            let freed = ctx.store.cache_size();
            let count = ctx.store.clear()?;
            println!("Removed {} cache files ({} bytes)", count, freed);
        }
    }
    Ok(())
}
