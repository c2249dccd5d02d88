use crate::forward::Forwarder;
use crate::intake::{Dequeued, WorkQueue, WorkUnit};
use crate::policy::Policy;
use crate::scorer::{extract_rules, ScoreResult, Scorer};
use crate::statistics::{StatEvent, StatsHandle};
use crate::store::{Disposition, Store, StoreRecord};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a work unit left the pipeline. Every unit ends in exactly one.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Spam at or above the kill level. `record` is only set when killed
    /// messages are archived.
    Dropped {
        score: f64,
        record: Option<StoreRecord>,
    },
    /// Delivered downstream, possibly after keeping a filtered copy.
    Forwarded { archived: Option<StoreRecord> },
    /// Scoring failed and the original bytes were parked.
    StoredOnScorerError { record: Option<StoreRecord> },
    /// The relay refused the message; the processed body was parked.
    StoredOnForwardFailure { record: Option<StoreRecord> },
}

/// The per-message state machine shared by all workers.
pub struct Pipeline {
    policy: Policy,
    scorer: Arc<dyn Scorer>,
    forwarder: Arc<dyn Forwarder>,
    store: Option<Arc<Store>>,
    stats: Option<StatsHandle>,
}

/// Prepends score headers to the message. Returns the input untouched when
/// there is nothing to add.
pub fn annotate<'a>(data: &'a [u8], headers: &[String]) -> Cow<'a, [u8]> {
    if headers.is_empty() {
        return Cow::Borrowed(data);
    }
    let prefix = headers.join("\r\n");
    let mut body = Vec::with_capacity(prefix.len() + 2 + data.len());
    body.extend_from_slice(prefix.as_bytes());
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(data);
    Cow::Owned(body)
}

impl Pipeline {
    pub fn new(policy: Policy, scorer: Arc<dyn Scorer>, forwarder: Arc<dyn Forwarder>) -> Self {
        Pipeline {
            policy,
            scorer,
            forwarder,
            store: None,
            stats: None,
        }
    }

    pub fn with_store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_stats(mut self, stats: StatsHandle) -> Self {
        self.stats = Some(stats);
        self
    }

    pub async fn process(&self, unit: &WorkUnit) -> Outcome {
        log::info!(
            "Processing {} byte message from {} to {} (peer {})",
            unit.size(),
            unit.sender,
            unit.recipient,
            unit.peer
        );
        if let Some(max) = self.policy.max_size {
            if unit.size() > max {
                log::info!(
                    "Message to {} is {} bytes, above max_size {}",
                    unit.recipient,
                    unit.size(),
                    max
                );
            }
        }

        let result = match self.check(unit).await {
            Ok(result) => result,
            Err(reason) => return self.on_scorer_error(unit, &reason).await,
        };

        let body = annotate(&unit.data, &result.headers);
        self.record_rules(&result);

        if self.policy.should_kill(result.is_spam, result.score) {
            log::info!(
                "Dropping message to {} from {} due to score of {}",
                unit.recipient,
                unit.sender,
                result.score
            );
            let record = if self.policy.archive_killed {
                self.persist(unit, &body, Disposition::Killed).await
            } else {
                None
            };
            return Outcome::Dropped {
                score: result.score,
                record,
            };
        }

        let archived = if self
            .policy
            .filter
            .is_filtered(result.is_spam, result.score, &unit.sender)
        {
            self.persist(unit, &body, Disposition::Filtered).await
        } else {
            None
        };

        self.deliver(unit, &body, archived).await
    }

    async fn check(&self, unit: &WorkUnit) -> Result<ScoreResult, String> {
        if !self.scorer.ping().await {
            return Err("scorer unavailable".to_string());
        }
        match self.scorer.score(&unit.data, &unit.recipient).await {
            Ok(result) if result.is_ok() => Ok(result),
            Ok(result) => Err(format!("scorer returned status {}", result.status_code)),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn on_scorer_error(&self, unit: &WorkUnit, reason: &str) -> Outcome {
        if !self.policy.forward_on_error {
            log::warn!(
                "Unable to score message to {} from {} ({reason}), storing original",
                unit.recipient,
                unit.sender
            );
            let record = self.persist(unit, &unit.data, Disposition::Unmodified).await;
            return Outcome::StoredOnScorerError { record };
        }

        log::warn!(
            "Unable to score message to {} from {} ({reason}), forwarding unmodified",
            unit.recipient,
            unit.sender
        );
        self.deliver(unit, &unit.data, None).await
    }

    async fn deliver(
        &self,
        unit: &WorkUnit,
        body: &[u8],
        archived: Option<StoreRecord>,
    ) -> Outcome {
        match self
            .forwarder
            .relay(&unit.sender, &unit.recipient, body)
            .await
        {
            Ok(()) => {
                log::info!(
                    "Forwarded {} byte message from {} to {}",
                    body.len(),
                    unit.sender,
                    unit.recipient
                );
                Outcome::Forwarded { archived }
            }
            Err(e) => {
                log::warn!(
                    "Failed to forward message from {} to {}: {e}",
                    unit.sender,
                    unit.recipient
                );
                let record = self.persist(unit, body, Disposition::ForwardFailed).await;
                Outcome::StoredOnForwardFailure { record }
            }
        }
    }

    fn record_rules(&self, result: &ScoreResult) {
        let Some(stats) = &self.stats else {
            return;
        };
        stats.record_event(StatEvent::MessageScanned);
        for rule in extract_rules(&result.headers) {
            stats.record_event(StatEvent::RuleHit { rule });
        }
    }

    async fn persist(
        &self,
        unit: &WorkUnit,
        data: &[u8],
        disposition: Disposition,
    ) -> Option<StoreRecord> {
        let Some(store) = &self.store else {
            log::warn!(
                "No store directory configured, {disposition} copy of message to {} from {} not kept",
                unit.recipient,
                unit.sender
            );
            return None;
        };

        match store.persist(data, disposition).await {
            Ok(record) => {
                log::info!(
                    "Stored {disposition} copy of message to {} from {} as {}",
                    unit.recipient,
                    unit.sender,
                    record.path.display()
                );
                Some(record)
            }
            Err(e) => {
                log::error!(
                    "Lost {disposition} copy of {} byte message to {} from {}: {e}",
                    data.len(),
                    unit.recipient,
                    unit.sender
                );
                None
            }
        }
    }
}

/// Drains the queue until the running flag clears or every intake handle
/// is dropped and the queue is empty.
pub async fn run_worker(
    id: usize,
    pipeline: Arc<Pipeline>,
    queue: WorkQueue,
    running: Arc<AtomicBool>,
    wait: Duration,
) {
    log::debug!("Worker {id} started");
    while running.load(Ordering::SeqCst) {
        match queue.next(wait).await {
            Dequeued::Unit(unit) => {
                let outcome = pipeline.process(&unit).await;
                log::debug!("Worker {id}: {outcome:?}");
            }
            Dequeued::Idle => continue,
            Dequeued::Closed => break,
        }
    }
    log::debug!("Worker {id} stopped");
}
