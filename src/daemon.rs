//! Periodic crawl and maintenance scheduling

use crate::config::Config;
use crate::error::CycleError;
use crate::proxy::checker::{Prober, ProxyChecker};
use crate::proxy::crawler::ProxyCrawler;
use crate::proxy::cycle::{CycleController, CycleOutcome};
use crate::proxy::dispatcher::{Dispatcher, StopReason};
use crate::proxy::models::WorkingSet;
use crate::storage::{FileStore, ProxyDatabase};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How often each cycle kind runs and how long it may take
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub maintenance_interval: Duration,
    pub crawl_interval: Duration,
    /// Extra time a crawl cycle gets for fetching sources
    pub crawl_deadline: Duration,
    pub cycle_deadline: Duration,
}

impl Schedule {
    pub fn from_config(config: &Config) -> Self {
        Self {
            maintenance_interval: config.interval(),
            crawl_interval: config.sources_refresh_interval(),
            crawl_deadline: config.crawl_deadline(),
            cycle_deadline: config.cycle_deadline(),
        }
    }
}

/// Long-running owner of the working set
pub struct Daemon<P: Prober> {
    controller: CycleController<P>,
    schedule: Schedule,
    files: FileStore,
    database: Option<ProxyDatabase>,
    working_set: WorkingSet,
    shutdown: CancellationToken,
}

impl Daemon<ProxyChecker> {
    /// Wire the HTTP checker, the source crawler and the configured stores
    pub async fn from_config(config: &Config) -> Result<Self> {
        let database = if config.database.enabled {
            match ProxyDatabase::connect(&config.database.url, config.database_timeout()).await {
                Ok(db) => Some(db),
                Err(e) => {
                    warn!("Database unavailable, continuing with file storage only: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let files = FileStore::new(&config.files.working_proxies)
            .with_all_proxies(&config.files.all_proxies);
        let checker = ProxyChecker::with_config(config.checker_config()?);
        let crawler = ProxyCrawler::with_config(config.crawler_config())?;

        let mut controller =
            CycleController::new(Dispatcher::new(checker, config.daemon.threads), Arc::new(crawler))
                .with_capacity(config.proxy.keep_working_proxies)
                .with_sample_size(config.sample_size())
                .with_sink(Arc::new(files.clone()));
        if let Some(db) = &database {
            controller = controller.with_sink(Arc::new(db.clone()));
        }

        let mut daemon = Daemon::new(controller, Schedule::from_config(config), files);
        daemon.database = database;
        Ok(daemon)
    }
}

impl<P: Prober> Daemon<P> {
    /// The controller's cancellation token doubles as the shutdown signal
    pub fn new(controller: CycleController<P>, schedule: Schedule, files: FileStore) -> Self {
        let shutdown = controller.cancellation().clone();
        Self {
            controller,
            schedule,
            files,
            database: None,
            working_set: WorkingSet::new(),
            shutdown,
        }
    }

    pub fn with_database(mut self, database: ProxyDatabase) -> Self {
        self.database = Some(database);
        self
    }

    pub fn working_set(&self) -> &WorkingSet {
        &self.working_set
    }

    /// Cancelling this token stops the daemon after the current cycle
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Restore the pool saved by a previous run, database first
    pub async fn load_pool(&mut self) {
        let capacity = self.controller.capacity();

        if let Some(db) = &self.database {
            match db.load_working(capacity).await {
                Ok(addresses) if !addresses.is_empty() => {
                    self.working_set = WorkingSet::from_addresses(addresses);
                    info!("Loaded {} working proxies from database", self.working_set.len());
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to load working proxies from database: {:#}", e),
            }
        }

        match self.files.load_working() {
            Ok(set) if !set.is_empty() => {
                self.working_set =
                    WorkingSet::from_addresses(set.addresses().into_iter().take(capacity));
                info!(
                    "Loaded {} working proxies from {}",
                    self.working_set.len(),
                    self.files.working_path().display()
                );
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to load working proxies file: {:#}", e),
        }
    }

    /// Crawl sources and test a sample of what they return
    pub async fn run_crawl(&mut self) {
        info!("Starting proxy crawl cycle");
        let deadline =
            Instant::now() + self.schedule.crawl_deadline + self.schedule.cycle_deadline;
        let outcome = self
            .controller
            .run_crawl_cycle(self.controller.sample_size(), deadline)
            .await;
        self.apply(outcome);
    }

    /// Re-test the current pool
    pub async fn run_maintenance(&mut self) {
        info!("Testing {} current working proxies", self.working_set.len());
        let deadline = Instant::now()
            + self.schedule.cycle_deadline
            + if self.working_set.is_empty() {
                self.schedule.crawl_deadline
            } else {
                Duration::ZERO
            };
        let outcome = self
            .controller
            .run_maintenance_cycle(&self.working_set, deadline)
            .await;
        self.apply(outcome);
    }

    fn apply(&mut self, outcome: std::result::Result<CycleOutcome, CycleError>) {
        match outcome {
            // A cycle cut short by shutdown saw only part of the pool
            Ok(outcome) if outcome.stopped == Some(StopReason::Cancelled) => {
                info!("{} cycle interrupted by shutdown, keeping current pool", outcome.kind);
            }
            Ok(outcome) => {
                info!(
                    "{} cycle finished: {} working proxies (was {})",
                    outcome.kind,
                    outcome.working_set.len(),
                    self.working_set.len()
                );
                self.working_set = outcome.working_set;
            }
            Err(CycleError::Cancelled) => {
                info!("Cycle interrupted by shutdown, keeping current pool");
            }
            Err(e) => error!("Proxy cycle failed: {}", e),
        }
    }

    /// Run until the shutdown token is cancelled, then save the pool
    pub async fn run(mut self) -> Result<WorkingSet> {
        info!(
            "Starting proxy daemon (maintenance every {:?}, crawl every {:?})",
            self.schedule.maintenance_interval, self.schedule.crawl_interval
        );

        self.load_pool().await;
        if self.working_set.is_empty() && !self.shutdown.is_cancelled() {
            info!("No working proxies loaded, performing initial crawl");
            self.run_crawl().await;
        }

        let mut maintenance = time::interval_at(
            Instant::now() + self.schedule.maintenance_interval,
            self.schedule.maintenance_interval,
        );
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut crawl = time::interval_at(
            Instant::now() + self.schedule.crawl_interval,
            self.schedule.crawl_interval,
        );
        crawl.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = crawl.tick() => self.run_crawl().await,
                _ = maintenance.tick() => self.run_maintenance().await,
            }
        }

        self.stop().await
    }

    async fn stop(self) -> Result<WorkingSet> {
        info!("Shutting down daemon...");
        self.shutdown.cancel();

        if let Err(e) = self.files.save_working(&self.working_set).await {
            error!("Failed to save working proxies on shutdown: {:#}", e);
        }
        if let Some(db) = &self.database {
            db.close().await;
        }

        info!("Daemon stopped with {} working proxies", self.working_set.len());
        Ok(self.working_set)
    }
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeFailure;
    use crate::proxy::cycle::CandidateSource;
    use crate::proxy::models::{CandidateAddress, ProbeResult};
    use crate::proxy::testing::{addresses, Script, ScriptedProber};
    use crate::storage::PoolSink;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        candidates: Option<Vec<CandidateAddress>>,
        calls: AtomicUsize,
    }

    impl CountingSource {
        fn new(raw: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                candidates: Some(addresses(raw)),
                calls: AtomicUsize::new(0),
            })
        }

        fn broken() -> Arc<Self> {
            Arc::new(Self {
                candidates: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CandidateSource for CountingSource {
        async fn fetch_candidates(&self) -> Result<Vec<CandidateAddress>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.candidates
                .clone()
                .ok_or_else(|| anyhow!("every source failed"))
        }
    }

    fn schedule(maintenance_ms: u64, crawl_ms: u64) -> Schedule {
        Schedule {
            maintenance_interval: Duration::from_millis(maintenance_ms),
            crawl_interval: Duration::from_millis(crawl_ms),
            crawl_deadline: Duration::from_secs(5),
            cycle_deadline: Duration::from_secs(5),
        }
    }

    fn stop_after(daemon: &Daemon<ScriptedProber>, after: Duration) {
        let token = daemon.shutdown_token();
        tokio::spawn(async move {
            time::sleep(after).await;
            token.cancel();
        });
    }

    #[tokio::test]
    async fn test_initial_crawl_when_nothing_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileStore::new(dir.path().join("working.txt"))
            .with_all_proxies(dir.path().join("all.txt"));
        let source = CountingSource::new(&["10.0.0.1:80", "10.0.0.2:80"]);
        let prober = ScriptedProber::new().with(
            "10.0.0.2:80",
            Script::Fail(Duration::from_millis(1), ProbeFailure::Timeout),
        );
        let controller = CycleController::new(Dispatcher::new(prober, 2), source.clone())
            .with_sink(Arc::new(files.clone()));
        let daemon = Daemon::new(controller, schedule(60_000, 60_000), files);
        stop_after(&daemon, Duration::from_millis(200));

        let final_set = daemon.run().await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(final_set.addresses(), addresses(&["10.0.0.1:80"]));
        assert_eq!(
            fs::read_to_string(dir.path().join("working.txt")).unwrap(),
            "10.0.0.1:80\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("all.txt")).unwrap(),
            "10.0.0.1:80\n10.0.0.2:80\n"
        );
    }

    #[tokio::test]
    async fn test_maintenance_drops_dead_proxies() {
        let dir = tempfile::tempdir().unwrap();
        let working = dir.path().join("working.txt");
        fs::write(&working, "10.0.0.1:80\n10.0.0.2:80\n").unwrap();
        let source = CountingSource::new(&["10.9.9.9:80"]);
        let prober = ScriptedProber::new().with(
            "10.0.0.1:80",
            Script::Fail(
                Duration::from_millis(1),
                ProbeFailure::ConnectFailed("refused".to_string()),
            ),
        );
        let controller = CycleController::new(Dispatcher::new(prober, 2), source.clone());
        let daemon = Daemon::new(controller, schedule(50, 60_000), FileStore::new(&working));
        stop_after(&daemon, Duration::from_millis(300));

        let final_set = daemon.run().await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(final_set.addresses(), addresses(&["10.0.0.2:80"]));
        assert_eq!(fs::read_to_string(&working).unwrap(), "10.0.0.2:80\n");
    }

    #[tokio::test]
    async fn test_cycle_errors_do_not_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let source = CountingSource::broken();
        let controller =
            CycleController::new(Dispatcher::new(ScriptedProber::new(), 2), source.clone());
        let daemon = Daemon::new(
            controller,
            schedule(40, 60_000),
            FileStore::new(dir.path().join("working.txt")),
        );
        stop_after(&daemon, Duration::from_millis(300));

        let final_set = daemon.run().await.unwrap();

        // Initial crawl plus the maintenance ticks that fell back to crawling
        assert!(source.calls.load(Ordering::SeqCst) >= 2);
        assert!(final_set.is_empty());
    }

    #[tokio::test]
    async fn test_load_pool_prefers_database() {
        let dir = tempfile::tempdir().unwrap();
        let working = dir.path().join("working.txt");
        fs::write(&working, "10.0.0.9:80\n").unwrap();

        let db = ProxyDatabase::connect("sqlite::memory:", Duration::from_secs(5))
            .await
            .unwrap();
        let controller = CycleController::new(
            Dispatcher::new(ScriptedProber::new(), 2),
            CountingSource::new(&[]),
        );
        let mut daemon = Daemon::new(controller, schedule(1000, 1000), FileStore::new(&working))
            .with_database(db.clone());

        // Empty database falls through to the file
        daemon.load_pool().await;
        assert_eq!(daemon.working_set().addresses(), addresses(&["10.0.0.9:80"]));

        let result = ProbeResult::working(
            CandidateAddress::new("10.0.0.1:80"),
            Duration::from_millis(20),
            200,
            0,
        );
        db.persist(&WorkingSet::new(), &[result]).await.unwrap();

        daemon.load_pool().await;
        assert_eq!(daemon.working_set().addresses(), addresses(&["10.0.0.1:80"]));
    }

    #[tokio::test]
    async fn test_load_pool_respects_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let working = dir.path().join("working.txt");
        fs::write(&working, "10.0.0.1:80\n10.0.0.2:80\n10.0.0.3:80\n").unwrap();
        let controller = CycleController::new(
            Dispatcher::new(ScriptedProber::new(), 2),
            CountingSource::new(&[]),
        )
        .with_capacity(2);
        let mut daemon = Daemon::new(controller, schedule(1000, 1000), FileStore::new(&working));

        daemon.load_pool().await;

        assert_eq!(
            daemon.working_set().addresses(),
            addresses(&["10.0.0.1:80", "10.0.0.2:80"])
        );
    }

    #[tokio::test]
    async fn test_interrupted_cycle_keeps_pool() {
        let dir = tempfile::tempdir().unwrap();
        let working = dir.path().join("working.txt");
        fs::write(&working, "10.0.0.1:80\n").unwrap();
        let controller = CycleController::new(
            Dispatcher::new(ScriptedProber::new(), 2),
            CountingSource::new(&[]),
        );
        let mut daemon = Daemon::new(controller, schedule(1000, 1000), FileStore::new(&working));
        daemon.load_pool().await;

        daemon.shutdown_token().cancel();
        daemon.run_maintenance().await;

        assert_eq!(daemon.working_set().addresses(), addresses(&["10.0.0.1:80"]));
    }
}
