use crate::scorer::{parse_headers, ScoreResult, Scorer, ScorerError};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref ANGLE_ADDRESS: Regex = Regex::new(r"(.*)<(.*@.*)>").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0} has no To header")]
    MissingRecipient(PathBuf),
    #[error("Unable to connect to spamd")]
    ScorerUnavailable,
    #[error(transparent)]
    Scorer(#[from] ScorerError),
}

/// Reduces `Name <addr@host>` to `addr@host`. Anything else is returned
/// trimmed but otherwise unchanged.
pub fn just_email(full_address: &str) -> &str {
    match ANGLE_ADDRESS.captures(full_address) {
        Some(captures) => captures.get(2).map_or(full_address, |m| m.as_str()),
        None => full_address.trim(),
    }
}

/// A stored message re-submitted to the scorer by hand.
#[derive(Debug, Clone)]
pub struct ReplayMessage {
    pub path: PathBuf,
    pub recipient: String,
    pub data: Vec<u8>,
}

impl ReplayMessage {
    /// Returns `Ok(None)` when there is no such file.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>, ReplayError> {
        let path = path.as_ref();
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ReplayError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let to = parse_headers(&data)
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("To"))
            .map(|(_, value)| value)
            .ok_or_else(|| ReplayError::MissingRecipient(path.to_path_buf()))?;

        Ok(Some(ReplayMessage {
            path: path.to_path_buf(),
            recipient: just_email(&to).to_string(),
            data,
        }))
    }

    /// Scores the message as its recipient. One ping, then one request.
    pub async fn process(&self, scorer: &dyn Scorer) -> Result<ScoreResult, ReplayError> {
        if !scorer.ping().await {
            return Err(ReplayError::ScorerUnavailable);
        }
        let result = scorer.score(&self.data, &self.recipient).await?;
        log::debug!(
            "Replayed {} for {}: spam={} score={}/{}",
            self.path.display(),
            self.recipient,
            result.is_spam,
            result.score,
            result.base_score
        );
        Ok(result)
    }
}
