use crate::config::Config;
use crate::forward::{Forwarder, SmtpForwarder};
use crate::intake::{work_queue, Intake};
use crate::policy::Policy;
use crate::scorer::{Scorer, SpamdClient};
use crate::statistics::{ReportSettings, StatisticsCollector};
use crate::store::Store;
use crate::worker::{run_worker, Pipeline};
use anyhow::Context;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A running relay: the work queue, its worker pool and the optional
/// statistics collector.
pub struct Relay {
    intake: Intake,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    collector: Option<JoinHandle<()>>,
}

impl Relay {
    /// Starts a relay that scores with spamd and forwards over SMTP.
    pub fn start(config: &Config) -> anyhow::Result<Self> {
        let scorer = SpamdClient::new(
            &config.spamd.host,
            config.spamd.port,
            config.spamd.user.clone(),
            Duration::from_secs(config.spamd.timeout_seconds),
        );
        let forwarder = SmtpForwarder::new(
            &config.forward.host,
            config.forward.port,
            Duration::from_secs(config.forward.timeout_seconds),
        );
        log::info!(
            "Scoring with spamd at {}, forwarding to {}",
            scorer.address(),
            forwarder.target()
        );
        Self::start_with(config, Arc::new(scorer), Arc::new(forwarder))
    }

    /// Starts a relay around the given scorer and forwarder. Must be called
    /// from inside a tokio runtime.
    pub fn start_with(
        config: &Config,
        scorer: Arc<dyn Scorer>,
        forwarder: Arc<dyn Forwarder>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let running = Arc::new(AtomicBool::new(true));
        let mut pipeline = Pipeline::new(Policy::from_config(config), scorer, forwarder.clone());

        match &config.store_directory {
            Some(directory) => {
                let store = Store::open(directory).with_context(|| {
                    format!("Failed to open message store {}", directory.display())
                })?;
                pipeline = pipeline.with_store(Arc::new(store));
            }
            None => log::warn!("No store_directory configured, undeliverable mail will be lost"),
        }

        let collector = if config.stats.enabled {
            let settings = ReportSettings {
                interval: Duration::from_secs(config.stats.report_interval_minutes * 60),
                from: config.stats.report_from.clone().unwrap_or_default(),
                to: config.stats.report_to.clone().unwrap_or_default(),
                wait: config.queue_wait(),
            };
            let (collector, handle) = StatisticsCollector::new(settings, forwarder, running.clone());
            pipeline = pipeline.with_stats(handle);
            Some(collector.spawn())
        } else {
            None
        };

        let (intake, queue) = work_queue(config.queue_capacity());
        let pipeline = Arc::new(pipeline);
        let workers = (0..config.threads)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    pipeline.clone(),
                    queue.clone(),
                    running.clone(),
                    config.queue_wait(),
                ))
            })
            .collect();

        log::info!(
            "Relay started with {} workers, queue capacity {}",
            config.threads,
            intake.capacity()
        );

        Ok(Relay {
            intake,
            running,
            workers,
            collector,
        })
    }

    /// Handle for submitting messages. Clone it for each listener.
    pub fn intake(&self) -> Intake {
        self.intake.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Asks every worker to stop after its current unit. Queued units are
    /// abandoned.
    pub fn stop(&self) {
        log::info!("Stopping relay");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Closes the relay's own intake handle and waits for the workers. If
    /// `stop` was not called, the workers first drain everything already
    /// queued once all other intake handles are dropped.
    pub async fn shutdown(self) {
        let Relay {
            intake,
            running,
            workers,
            collector,
        } = self;
        drop(intake);

        for worker in workers {
            if let Err(e) = worker.await {
                log::error!("Worker task failed: {e}");
            }
        }

        running.store(false, Ordering::SeqCst);
        if let Some(collector) = collector {
            if let Err(e) = collector.await {
                log::error!("Statistics task failed: {e}");
            }
        }
        log::info!("Relay stopped");
    }
}
