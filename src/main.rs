use anyhow::{Context, Result, bail};
use comic_pagecache::{Blob, CacheConfig, CacheError, CacheEvent, HttpTransport, PageCache};
use futures::{Stream, StreamExt};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "\
Usage: pagecache <manifest-url> [options]

Walk the pages of a comic thread through the page cache.

Options:
  --from N       first page to read (default 1)
  --to N         last page to read (default: last page)
  --ahead N      pages to prefetch ahead (PAGECACHE_ENSURE_FORWARD)
  --behind N     pages to keep behind (PAGECACHE_RETAIN_BACKWARD)
  --resident N   most pages held at once (PAGECACHE_MAX_RESIDENT)
  --retries N    retries per failed page (PAGECACHE_MAX_RETRIES)
  --out DIR      write each page to DIR/page-NNN.<ext>
  -V, --version  print version
  -h, --help     print this help";

#[derive(Debug, Default, PartialEq)]
struct ReadArgs {
    manifest: String,
    from: usize,
    to: Option<usize>,
    ahead: Option<usize>,
    behind: Option<usize>,
    resident: Option<usize>,
    retries: Option<u32>,
    out: Option<PathBuf>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Version,
    Help,
    Read(ReadArgs),
}

fn parse_args<I>(args: I) -> Result<Command, String>
where
    I: IntoIterator<Item = String>,
{
    let mut read = ReadArgs {
        from: 1,
        ..ReadArgs::default()
    };
    let mut manifest = None;
    let mut args = args.into_iter();

    fn number<T: std::str::FromStr>(flag: &str, value: Option<String>) -> Result<T, String> {
        let value = value.ok_or_else(|| format!("{} needs a value", flag))?;
        value
            .parse()
            .map_err(|_| format!("{} expects a number, got {:?}", flag, value))
    }

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => return Ok(Command::Version),
            "--help" | "-h" => return Ok(Command::Help),
            "--from" => read.from = number(&arg, args.next())?,
            "--to" => read.to = Some(number(&arg, args.next())?),
            "--ahead" => read.ahead = Some(number(&arg, args.next())?),
            "--behind" => read.behind = Some(number(&arg, args.next())?),
            "--resident" => read.resident = Some(number(&arg, args.next())?),
            "--retries" => read.retries = Some(number(&arg, args.next())?),
            "--out" => {
                let dir = args.next().ok_or("--out needs a directory")?;
                read.out = Some(PathBuf::from(dir));
            }
            flag if flag.starts_with('-') => return Err(format!("Unknown option {}", flag)),
            _ if manifest.is_none() => manifest = Some(arg),
            _ => return Err(format!("Unexpected argument {:?}", arg)),
        }
    }

    read.manifest = manifest.ok_or("Missing manifest URL")?;
    if read.from == 0 {
        return Err("Pages are numbered from 1".to_string());
    }
    Ok(Command::Read(read))
}

impl ReadArgs {
    /// Environment config with command line flags on top.
    fn config(&self, mut cfg: CacheConfig) -> CacheConfig {
        if let Some(v) = self.ahead {
            cfg.ensure_forward = v;
        }
        if let Some(v) = self.behind {
            cfg.retain_backward = v;
        }
        if let Some(v) = self.resident {
            cfg.max_resident = v;
        }
        if let Some(v) = self.retries {
            cfg.max_retries = v;
        }
        cfg
    }
}

/// Write a page payload to `dir`, atomically.
fn save_page(dir: &Path, num: usize, blob: &Blob) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("page-{:03}.{}", num, blob.extension()));
    let tmp = path.with_extension("tmp");
    if let Err(e) = fs::write(&tmp, &blob.bytes).and_then(|_| fs::rename(&tmp, &path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(path)
}

async fn log_events(events: impl Stream<Item = CacheEvent>) {
    let mut events = Box::pin(events);
    while let Some(event) = events.next().await {
        match event {
            CacheEvent::Ready { pages } => debug!("Thread ready: {} pages", pages),
            CacheEvent::ManifestFailed { locator, error } => {
                warn!("Manifest {} failed: {}", locator, error)
            }
            CacheEvent::PageLoaded { num, url } => debug!("Page {} ready at {}", num, url),
            CacheEvent::PageFailed { num, error } => warn!("Page {} failed: {}", num, error),
            CacheEvent::Evicted { num } => debug!("Page {} evicted", num),
        }
    }
}

async fn read_thread(args: ReadArgs) -> Result<()> {
    let env_cfg = CacheConfig::from_env().map_err(anyhow::Error::msg)?;
    let cfg = args.config(env_cfg);
    info!(
        "Reading {} (ahead {}, behind {}, resident {})",
        args.manifest,
        cfg.ensure_forward,
        cfg.retain_backward,
        cfg.resident_limit()
    );

    let transport = Arc::new(HttpTransport::new(&cfg));
    let cache = PageCache::new(cfg, transport);
    let logger = tokio::spawn(log_events(cache.events()));

    let pages = cache
        .open_thread(args.manifest.as_str())
        .await
        .with_context(|| format!("Could not open {}", args.manifest))?;
    let to = args.to.unwrap_or(pages).min(pages);
    if args.from > to {
        cache.close();
        bail!("Page {} is past the end of a {}-page thread", args.from, pages);
    }

    let mut failed = 0usize;
    for num in args.from..=to {
        match cache.load(num).await {
            Ok(page) => {
                let blob = page.url.as_ref().and_then(|url| cache.resource(url));
                let size = blob.as_ref().map(Blob::len).unwrap_or(0);
                let mime = blob.as_ref().map(|b| b.mime).unwrap_or("-");
                println!("page {:>3}/{}  {:>9} bytes  {}", num, pages, size, mime);

                if let (Some(dir), Some(blob)) = (&args.out, &blob) {
                    let path = save_page(dir, num, blob)
                        .with_context(|| format!("Could not save page {}", num))?;
                    debug!("Wrote {}", path.display());
                }
            }
            Err(CacheError::PageFailed { num, error }) => {
                failed += 1;
                println!("page {:>3}/{}  failed: {}", num, pages, error);
            }
            Err(e) => {
                cache.close();
                return Err(e.into());
            }
        }
    }

    let stats = cache.stats();
    info!(
        "Done: {} loaded, {} failed, {} retries, {} evictions, {} coalesced requests ({:.0}%)",
        stats.loaded,
        stats.failed,
        stats.retries,
        stats.evictions,
        stats.coalesced,
        stats.coalesce_rate() * 100.0
    );
    cache.close();
    logger.abort();

    if failed > 0 {
        bail!("{} of {} pages failed to load", failed, to - args.from + 1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let command = match parse_args(env::args().skip(1)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    match command {
        Command::Version => {
            println!("pagecache {}", VERSION);
            Ok(())
        }
        Command::Help => {
            println!("{}", USAGE);
            Ok(())
        }
        Command::Read(args) => read_thread(args).await,
    }
}
