use crate::config::{Config, FilterConfig};
use std::collections::HashSet;

/// Score thresholds and address lists applied to every scored message.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub kill_level: Option<f64>,
    pub forward_on_error: bool,
    pub archive_killed: bool,
    pub max_size: Option<usize>,
    pub filter: FilterPolicy,
}

#[derive(Debug, Clone, Default)]
pub struct FilterPolicy {
    pub enabled: bool,
    pub above: Option<f64>,
    pub addresses: HashSet<String>,
}

impl Policy {
    pub fn from_config(config: &Config) -> Self {
        Policy {
            kill_level: config.kill_level,
            forward_on_error: config.forward_on_error,
            archive_killed: config.archive_killed,
            max_size: config.max_size,
            filter: FilterPolicy::from(&config.filter),
        }
    }

    /// Spam at or above the kill level is discarded.
    pub fn should_kill(&self, is_spam: bool, score: f64) -> bool {
        match self.kill_level {
            Some(level) => is_spam && score >= level,
            None => false,
        }
    }
}

impl From<&FilterConfig> for FilterPolicy {
    fn from(config: &FilterConfig) -> Self {
        FilterPolicy {
            enabled: config.enabled,
            above: config.above,
            addresses: config
                .addresses
                .iter()
                .map(|address| address.to_lowercase())
                .collect(),
        }
    }
}

impl FilterPolicy {
    /// Whether an archival copy should be kept. Filtering never blocks
    /// delivery.
    pub fn is_filtered(&self, is_spam: bool, score: f64, sender: &str) -> bool {
        if !self.enabled {
            return false;
        }
        is_spam
            || self.above.is_some_and(|above| score >= above)
            || self.addresses.contains(&sender.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(above: Option<f64>, addresses: &[&str]) -> FilterPolicy {
        FilterPolicy {
            enabled: true,
            above,
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn test_spam_is_always_filtered_when_enabled() {
        let policy = filter(None, &[]);
        for score in [-10.0, 0.0, 4.9, 1000.0] {
            assert!(policy.is_filtered(true, score, "anyone@example.com"));
        }
    }

    #[test]
    fn test_disabled_filter_never_matches() {
        let mut policy = filter(Some(1.0), &["bad@example.com"]);
        policy.enabled = false;
        assert!(!policy.is_filtered(true, 100.0, "bad@example.com"));
    }

    #[test]
    fn test_filter_above_is_inclusive() {
        let policy = filter(Some(3.0), &[]);
        assert!(policy.is_filtered(false, 3.0, "a@example.com"));
        assert!(policy.is_filtered(false, 3.5, "a@example.com"));
        assert!(!policy.is_filtered(false, 2.9, "a@example.com"));
    }

    #[test]
    fn test_filter_by_sender_address() {
        let policy = FilterPolicy::from(&FilterConfig {
            enabled: true,
            above: None,
            addresses: ["Watch@Example.com".to_string()].into_iter().collect(),
        });
        assert!(policy.addresses.contains("watch@example.com"));
        assert!(policy.is_filtered(false, 0.0, "WATCH@example.com"));
        assert!(policy.is_filtered(false, 0.0, "watch@example.com"));
        assert!(!policy.is_filtered(false, 0.0, "other@example.com"));
    }

    #[test]
    fn test_kill_level_is_inclusive_and_spam_only() {
        let policy = Policy {
            kill_level: Some(50.0),
            ..Default::default()
        };
        assert!(policy.should_kill(true, 50.0));
        assert!(policy.should_kill(true, 75.0));
        assert!(!policy.should_kill(true, 49.9));
        assert!(!policy.should_kill(false, 75.0));

        let no_kill = Policy::default();
        assert!(!no_kill.should_kill(true, 1000.0));
    }
}
