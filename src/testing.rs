//! Fakes for the scorer and relay seams.

use crate::forward::{ForwardError, Forwarder};
use crate::scorer::{ScoreResult, Scorer, ScorerError};
use async_trait::async_trait;
use lettre::address::Address;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct ScriptedScorer {
    alive: bool,
    result: Option<ScoreResult>,
    pings: AtomicUsize,
    requests: Mutex<Vec<(Vec<u8>, String)>>,
}

impl ScriptedScorer {
    pub fn answering(result: ScoreResult) -> Self {
        Self {
            alive: true,
            result: Some(result),
            pings: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Pings succeed but every score request fails at the transport.
    pub fn broken() -> Self {
        Self {
            result: None,
            ..Self::answering(ScoreResult::default())
        }
    }

    pub fn unreachable() -> Self {
        Self {
            alive: false,
            ..Self::broken()
        }
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(Vec<u8>, String)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Scorer for ScriptedScorer {
    async fn ping(&self) -> bool {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.alive
    }

    async fn score(&self, data: &[u8], identity: &str) -> Result<ScoreResult, ScorerError> {
        self.requests
            .lock()
            .unwrap()
            .push((data.to_vec(), identity.to_string()));
        match &self.result {
            Some(result) => Ok(result.clone()),
            None => Err(ScorerError::Protocol("scripted failure".to_string())),
        }
    }
}

#[derive(Default)]
pub struct RecordingForwarder {
    fail: bool,
    sent: Mutex<Vec<(String, String, Vec<u8>)>>,
}

impl RecordingForwarder {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Every attempted relay, including failed ones.
    pub fn sent(&self) -> Vec<(String, String, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Forwarder for RecordingForwarder {
    async fn relay(&self, sender: &str, recipient: &str, body: &[u8]) -> Result<(), ForwardError> {
        self.sent
            .lock()
            .unwrap()
            .push((sender.to_string(), recipient.to_string(), body.to_vec()));
        if self.fail {
            return Err(ForwardError::Address {
                address: recipient.to_string(),
                source: "relay refused".parse::<Address>().unwrap_err(),
            });
        }
        Ok(())
    }
}
