use crate::forward::Forwarder;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatEvent {
    MessageScanned,
    RuleHit { rule: String },
}

/// Fire-and-forget sender used by the workers.
#[derive(Debug, Clone)]
pub struct StatsHandle {
    sender: mpsc::UnboundedSender<StatEvent>,
}

impl StatsHandle {
    pub fn record_event(&self, event: StatEvent) {
        if let Err(e) = self.sender.send(event) {
            log::warn!("Failed to send statistics event: {e}");
        }
    }
}

/// Creates the event stream. The receiver belongs to exactly one consumer.
pub fn stats_channel() -> (StatsHandle, mpsc::UnboundedReceiver<StatEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (StatsHandle { sender }, receiver)
}

/// Rule counts since the last report.
#[derive(Debug, Default, Clone)]
pub struct RuleUsage {
    messages: u64,
    rules: BTreeMap<String, u64>,
}

impl RuleUsage {
    pub fn record(&mut self, event: StatEvent) {
        match event {
            StatEvent::MessageScanned => self.messages += 1,
            StatEvent::RuleHit { rule } => *self.rules.entry(rule).or_insert(0) += 1,
        }
    }

    pub fn messages(&self) -> u64 {
        self.messages
    }

    pub fn count(&self, rule: &str) -> u64 {
        self.rules.get(rule).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.messages == 0 && self.rules.is_empty()
    }

    pub fn render_report(&self, from: &str, to: &str) -> String {
        let mut report = format!(
            "To: {to}\r\nFrom: {from}\r\nSubject: surgat Rule Summary\r\n\r\n"
        );
        report.push_str("Rule Usage Summary\n==================\n\n");
        report.push_str(&format!("Total of {} messages scanned.\n\n", self.messages));
        for (rule, count) in &self.rules {
            report.push_str(&format!("  {rule:<40}: {count:5}\n"));
        }
        report
    }

    /// Renders the report and starts a fresh count.
    pub fn take_report(&mut self, from: &str, to: &str) -> String {
        let report = self.render_report(from, to);
        *self = RuleUsage::default();
        report
    }
}

#[derive(Debug, Clone)]
pub struct ReportSchedule {
    interval: Duration,
    due: Instant,
}

impl ReportSchedule {
    pub fn starting_at(now: Instant, interval: Duration) -> Self {
        Self {
            interval,
            due: now + interval,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.due
    }

    pub fn due(&self) -> Instant {
        self.due
    }

    pub fn advance(&mut self, now: Instant) {
        self.due += self.interval;
        if self.due <= now {
            self.due = now + self.interval;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub interval: Duration,
    pub from: String,
    pub to: String,
    /// Longest the collector sleeps before re-checking the schedule.
    pub wait: Duration,
}

/// Owns the rule accumulator and periodically mails a usage summary.
pub struct StatisticsCollector {
    receiver: mpsc::UnboundedReceiver<StatEvent>,
    usage: RuleUsage,
    schedule: ReportSchedule,
    settings: ReportSettings,
    mailer: Arc<dyn Forwarder>,
    running: Arc<AtomicBool>,
}

impl StatisticsCollector {
    pub fn new(
        settings: ReportSettings,
        mailer: Arc<dyn Forwarder>,
        running: Arc<AtomicBool>,
    ) -> (Self, StatsHandle) {
        let (handle, receiver) = stats_channel();
        let collector = StatisticsCollector {
            receiver,
            usage: RuleUsage::default(),
            schedule: ReportSchedule::starting_at(Instant::now(), settings.interval),
            settings,
            mailer,
            running,
        };
        (collector, handle)
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        log::info!(
            "Statistics collection started, report interval {} minutes",
            self.settings.interval.as_secs() / 60
        );
        while self.running.load(Ordering::SeqCst) {
            match tokio::time::timeout(self.settings.wait, self.receiver.recv()).await {
                Ok(Some(event)) => self.usage.record(event),
                Ok(None) => break,
                Err(_) => {}
            }

            let now = Instant::now();
            if self.schedule.is_due(now) {
                self.send_report().await;
                self.schedule.advance(now);
            }
        }
        log::info!("Statistics collection stopped");
    }

    async fn send_report(&mut self) {
        let report = self
            .usage
            .take_report(&self.settings.from, &self.settings.to);
        match self
            .mailer
            .relay(&self.settings.from, &self.settings.to, report.as_bytes())
            .await
        {
            Ok(()) => log::info!("Rule summary report sent to {}", self.settings.to),
            Err(e) => log::warn!("Failed to send rule summary report: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingForwarder;

    fn hit(rule: &str) -> StatEvent {
        StatEvent::RuleHit {
            rule: rule.to_string(),
        }
    }

    #[test]
    fn test_report_is_sorted_and_counts_messages() {
        let mut usage = RuleUsage::default();
        usage.record(StatEvent::MessageScanned);
        usage.record(StatEvent::MessageScanned);
        usage.record(hit("URIBL_BLACK"));
        usage.record(hit("BAYES_99"));
        usage.record(hit("BAYES_99"));

        let report = usage.render_report("surgat@example.com", "admin@example.com");
        assert!(report.starts_with(
            "To: admin@example.com\r\nFrom: surgat@example.com\r\nSubject: surgat Rule Summary\r\n\r\n"
        ));
        assert!(report.contains("Total of 2 messages scanned.\n"));
        let bayes = report.find("BAYES_99").unwrap();
        let uribl = report.find("URIBL_BLACK").unwrap();
        assert!(bayes < uribl);
        assert!(report.contains(&format!("  {:<40}: {:5}\n", "BAYES_99", 2)));
    }

    #[test]
    fn test_take_report_resets_counts() {
        let mut usage = RuleUsage::default();
        usage.record(hit("BAYES_99"));
        usage.record(StatEvent::MessageScanned);
        let _ = usage.take_report("a@example.com", "b@example.com");
        assert!(usage.is_empty());

        usage.record(hit("BAYES_99"));
        assert_eq!(usage.count("BAYES_99"), 1);
        assert_eq!(usage.messages(), 0);
    }

    #[test]
    fn test_schedule_advances_by_interval() {
        let start = Instant::now();
        let interval = Duration::from_secs(60);
        let mut schedule = ReportSchedule::starting_at(start, interval);

        assert!(!schedule.is_due(start + Duration::from_secs(59)));
        assert!(schedule.is_due(start + interval));

        schedule.advance(start + interval);
        assert_eq!(schedule.due(), start + interval * 2);

        // A stall longer than an interval does not cause a burst of reports.
        schedule.advance(start + interval * 10);
        assert_eq!(schedule.due(), start + interval * 11);
    }

    #[tokio::test]
    async fn test_collector_mails_report_and_resets() {
        let forwarder = Arc::new(RecordingForwarder::default());
        let running = Arc::new(AtomicBool::new(true));
        let settings = ReportSettings {
            interval: Duration::from_millis(50),
            from: "surgat@example.com".to_string(),
            to: "admin@example.com".to_string(),
            wait: Duration::from_millis(10),
        };
        let (collector, handle) =
            StatisticsCollector::new(settings, forwarder.clone(), running.clone());
        let task = collector.spawn();

        handle.record_event(StatEvent::MessageScanned);
        handle.record_event(hit("BAYES_99"));
        handle.record_event(hit("HTML_IMAGE_ONLY_08"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        running.store(false, Ordering::SeqCst);
        task.await.unwrap();

        let sent = forwarder.sent();
        assert!(!sent.is_empty(), "expected at least one report");
        let (from, to, body) = &sent[0];
        assert_eq!(from, "surgat@example.com");
        assert_eq!(to, "admin@example.com");
        let body = String::from_utf8_lossy(body);
        assert!(body.contains("Total of 1 messages scanned."));
        assert!(body.contains("BAYES_99"));
        assert!(body.contains("HTML_IMAGE_ONLY_08"));

        // Later reports start from zero.
        for (_, _, later) in sent.iter().skip(1) {
            let later = String::from_utf8_lossy(later);
            assert!(later.contains("Total of 0 messages scanned."));
            assert!(!later.contains("BAYES_99"));
        }
    }
}
