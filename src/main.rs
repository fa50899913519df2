use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use regproxy::{
    config::Config,
    daemon::{self, Daemon},
    logging::{self, LogOptions},
    proxy::{reduce, Dispatcher, ProxyChecker, ProxyCrawler, ProxyParser},
    storage::ProxyDatabase,
    tui::ProbeMonitor,
};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Keeps a pool of proxies that can reach a target API
#[derive(Parser)]
#[command(name = "regproxy")]
#[command(about = "Crawls public proxy lists and keeps a pool of proxies that work against a target API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the crawl and maintenance scheduler until interrupted
    Daemon,
    /// Test proxies from a file against the configured API
    Test {
        /// Proxy file to use
        #[arg(short, long, default_value = "working_proxies.txt")]
        file: PathBuf,
        /// Number of proxies to test (0 for all)
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
        /// Output file for working proxies
        #[arg(short, long, default_value = "tested_working_proxies.txt")]
        output: PathBuf,
        /// Show live progress in a terminal UI
        #[arg(long)]
        tui: bool,
    },
    /// Crawl proxies from the built-in public sources
    Crawl {
        /// Output file for crawled proxies
        #[arg(short, long, default_value = "crawled_proxies.txt")]
        output: PathBuf,
    },
    /// Validate the configuration and print the effective settings
    Validate,
    /// Show database statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let tui = matches!(cli.command, Some(Commands::Test { tui: true, .. }));
    logging::init(LogOptions {
        level: &config.daemon.log_level,
        file: config.log_file(),
        console: !tui,
    })?;

    match cli.command {
        Some(Commands::Daemon) | None => {
            config.validate()?;
            run_daemon(&config).await?
        }
        Some(Commands::Test {
            file,
            count,
            output,
            tui,
        }) => {
            config.validate()?;
            test_proxies(&config, &file, count, &output, tui).await?
        }
        Some(Commands::Crawl { output }) => crawl_proxies(&config, &output).await?,
        Some(Commands::Validate) => {
            config.validate()?;
            println!("✅ Configuration is valid!\n");
            println!("{}", config.summary());
        }
        Some(Commands::Stats) => show_stats(&config).await?,
    }

    Ok(())
}

async fn run_daemon(config: &Config) -> Result<()> {
    let daemon = Daemon::from_config(config).await?;

    let shutdown = daemon.shutdown_token();
    tokio::spawn(async move {
        daemon::shutdown_signal().await;
        shutdown.cancel();
    });

    daemon.run().await?;
    Ok(())
}

async fn test_proxies(
    config: &Config,
    file: &Path,
    count: usize,
    output: &Path,
    tui: bool,
) -> Result<()> {
    let mut proxies = ProxyParser::parse_file(file)?;
    if proxies.is_empty() {
        bail!("no proxies found in {}", file.display());
    }
    if count > 0 {
        proxies.truncate(count);
    }

    let checker = ProxyChecker::with_config(config.checker_config()?);
    let deadline = Instant::now() + config.cycle_deadline();
    let cancel = CancellationToken::new();
    let total = proxies.len();

    if !tui {
        println!("🔍 Testing {} proxies from {}...", total, file.display());
    }

    let report = if tui {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(checker, config.daemon.threads).with_observer(tx);
        let run_cancel = cancel.clone();
        let run = tokio::spawn(async move {
            dispatcher
                .dispatch(proxies, &run_cancel, Some(deadline))
                .await
        });

        ProbeMonitor::new(total, rx)
            .with_cancellation(cancel)
            .run()
            .await?;
        run.await?
    } else {
        let dispatcher = Dispatcher::new(checker, config.daemon.threads);
        let report = dispatcher.dispatch(proxies, &cancel, Some(deadline)).await;
        for result in &report.results {
            let mark = if result.is_working { "✅" } else { "❌" };
            println!("{} {}", mark, result);
        }
        report
    };

    let working = reduce(&report.results, report.results.len());
    ProxyParser::save_to_file(&working.addresses(), output)?;

    let tested = report.results.len();
    let rate = if tested == 0 {
        0.0
    } else {
        working.len() as f64 / tested as f64 * 100.0
    };
    println!("\n📊 Results:");
    println!("  Tested: {}/{}", tested, total);
    println!("  Working: {} ({:.1}%)", working.len(), rate);
    if let Some(fastest) = working.iter().next() {
        if let Some(latency) = fastest.latency {
            println!("  Fastest: {} ({}ms)", fastest.address, latency.as_millis());
        }
    }
    println!("💾 Saved working proxies to {}", output.display());
    Ok(())
}

async fn crawl_proxies(config: &Config, output: &Path) -> Result<()> {
    let crawler = ProxyCrawler::with_config(config.crawler_config())?;
    println!("🕷️ Crawling proxies from {} sources...", crawler.sources().len());

    let proxies = tokio::time::timeout(config.crawl_deadline(), crawler.crawl_proxies())
        .await
        .map_err(|_| anyhow::anyhow!("crawl exceeded {:?}", config.crawl_deadline()))??;

    ProxyParser::save_to_file(&proxies, output)?;
    info!("Saved {} proxies to {}", proxies.len(), output.display());
    println!("✅ Found {} unique proxies", proxies.len());
    println!("💾 Saved to {}", output.display());
    Ok(())
}

async fn show_stats(config: &Config) -> Result<()> {
    if !config.database.enabled {
        bail!("database is disabled; set database.enabled = true in the config file");
    }

    let db = ProxyDatabase::connect(&config.database.url, config.database_timeout()).await?;
    let stats = db.stats().await?;
    let top = db.load_working(10).await?;
    db.close().await;

    println!("📊 Proxy database statistics");
    println!("  Total proxies: {}", stats.total);
    println!("  Working: {}", stats.working);
    match stats.avg_latency_ms {
        Some(latency) => println!("  Average latency: {:.0}ms", latency),
        None => println!("  Average latency: n/a"),
    }
    if let Some(rate) = stats.avg_success_rate {
        println!("  Average success rate: {:.1}%", rate * 100.0);
    }
    if !top.is_empty() {
        println!("\nBest proxies:");
        for address in top {
            println!("  {}", address);
        }
    }
    Ok(())
}
