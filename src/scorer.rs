use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const PROTOCOL: &str = "SPAMC/1.5";

lazy_static! {
    static ref RULE_LIST: Regex =
        Regex::new(r"tests=([A-Za-z0-9_]+(?:,\s*[A-Za-z0-9_]+)*)").unwrap();
}

/// Outcome of one scoring round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreResult {
    /// 0 on success, anything else is a scorer-side failure.
    pub status_code: i32,
    pub is_spam: bool,
    pub score: f64,
    pub base_score: f64,
    /// `Name: Value` lines to prepend to the message, in order.
    pub headers: Vec<String>,
    pub symbols: Vec<String>,
}

impl ScoreResult {
    pub fn is_ok(&self) -> bool {
        self.status_code == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScorerError {
    #[error("Failed to connect to spamd: {0}")]
    Connect(std::io::Error),
    #[error("spamd I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("spamd did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Malformed spamd response: {0}")]
    Protocol(String),
}

/// Request/response contract with the external scoring service.
#[async_trait]
pub trait Scorer: Send + Sync {
    /// Liveness probe. Never fails; an unreachable scorer is `false`.
    async fn ping(&self) -> bool;

    /// Scores `data` against the rule profile of `identity`. Exactly one
    /// request per call.
    async fn score(&self, data: &[u8], identity: &str) -> Result<ScoreResult, ScorerError>;
}

/// SPAMC client for SpamAssassin's `spamd`. Each request uses its own
/// connection, so one client is shared by every worker.
#[derive(Debug, Clone)]
pub struct SpamdClient {
    host: String,
    port: u16,
    user: Option<String>,
    timeout: Duration,
}

#[derive(Debug)]
struct SpamdResponse {
    code: i32,
    message: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl SpamdClient {
    pub fn new(host: &str, port: u16, user: Option<String>, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            user,
            timeout,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, ScorerError> {
        let address = self.address();
        let io = async {
            let mut stream = TcpStream::connect(&address)
                .await
                .map_err(ScorerError::Connect)?;
            stream.write_all(request).await?;
            stream.shutdown().await?;
            let mut response = Vec::new();
            stream.read_to_end(&mut response).await?;
            Ok::<_, ScorerError>(response)
        };
        tokio::time::timeout(self.timeout, io)
            .await
            .map_err(|_| ScorerError::Timeout(self.timeout))?
    }

    async fn check_ping(&self) -> Result<(), ScorerError> {
        let request = format!("PING {PROTOCOL}\r\n\r\n");
        let response = parse_response(&self.exchange(request.as_bytes()).await?)?;
        if response.code != 0 || !response.message.eq_ignore_ascii_case("PONG") {
            return Err(ScorerError::Protocol(format!(
                "unexpected ping reply: {} {}",
                response.code, response.message
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Scorer for SpamdClient {
    async fn ping(&self) -> bool {
        match self.check_ping().await {
            Ok(()) => true,
            Err(e) => {
                log::debug!("spamd ping to {} failed: {e}", self.address());
                false
            }
        }
    }

    async fn score(&self, data: &[u8], identity: &str) -> Result<ScoreResult, ScorerError> {
        let user = if identity.is_empty() {
            self.user.as_deref()
        } else {
            Some(identity)
        };

        let mut request = format!("HEADERS {PROTOCOL}\r\nContent-length: {}\r\n", data.len());
        if let Some(user) = user {
            request.push_str(&format!("User: {user}\r\n"));
        }
        request.push_str("\r\n");
        let mut request = request.into_bytes();
        request.extend_from_slice(data);

        let response = parse_response(&self.exchange(&request).await?)?;
        if response.code != 0 {
            log::debug!("spamd returned {} {}", response.code, response.message);
            return Ok(ScoreResult {
                status_code: response.code,
                ..Default::default()
            });
        }

        let (is_spam, score, base_score) = response
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("Spam"))
            .and_then(|(_, value)| parse_spam_header(value))
            .ok_or_else(|| ScorerError::Protocol("missing Spam header".to_string()))?;

        let message_headers = parse_headers(&response.body);
        let symbols = extract_rules(message_headers.iter().map(|(n, v)| format!("{n}: {v}")));

        Ok(ScoreResult {
            status_code: 0,
            is_spam,
            score,
            base_score,
            headers: spam_headers(is_spam, &message_headers),
            symbols,
        })
    }
}

/// Picks the headers worth prepending: every `X-Spam*` header for spam,
/// only the status and checker version otherwise.
pub fn spam_headers(is_spam: bool, headers: &[(String, String)]) -> Vec<String> {
    headers
        .iter()
        .filter(|(name, _)| name.starts_with("X-Spam"))
        .filter(|(name, _)| {
            is_spam || name == "X-Spam-Status" || name == "X-Spam-Checker-Version"
        })
        .map(|(name, value)| format!("{name}: {value}"))
        .collect()
}

/// Collects rule names from every `tests=A,B,C` list in the given header
/// lines. Folding whitespace inside a list is ignored.
pub fn extract_rules<I, S>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut rules = Vec::new();
    for line in lines {
        let cleaned = line.as_ref().replace(&['\r', '\t'][..], "");
        for captures in RULE_LIST.captures_iter(&cleaned) {
            rules.extend(
                captures[1]
                    .split(',')
                    .map(str::trim)
                    .filter(|rule| !rule.is_empty() && *rule != "none")
                    .map(str::to_string),
            );
        }
    }
    rules
}

/// Parses the header block of an RFC 5322 message. Continuation lines are
/// kept folded in the value so the header can be written back verbatim.
pub fn parse_headers(data: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(data);
    let mut headers: Vec<(String, String)> = Vec::new();

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            break;
        }
        if line.starts_with(&[' ', '\t'][..]) {
            if let Some((_, value)) = headers.last_mut() {
                value.push_str("\r\n");
                value.push_str(line);
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    headers
}

fn parse_response(raw: &[u8]) -> Result<SpamdResponse, ScorerError> {
    let (head, body) = match find(raw, b"\r\n\r\n") {
        Some(pos) => (&raw[..pos], &raw[pos + 4..]),
        None => match find(raw, b"\n\n") {
            Some(pos) => (&raw[..pos], &raw[pos + 2..]),
            None => (raw, &raw[raw.len()..]),
        },
    };
    let head = String::from_utf8_lossy(head);
    let mut lines = head.lines();

    let status = lines
        .next()
        .ok_or_else(|| ScorerError::Protocol("empty response".to_string()))?;
    let mut parts = status.splitn(3, ' ');
    let protocol = parts.next().unwrap_or_default();
    if !protocol.starts_with("SPAMD/") {
        return Err(ScorerError::Protocol(format!("bad status line: {status}")));
    }
    let code = parts
        .next()
        .and_then(|code| code.parse::<i32>().ok())
        .ok_or_else(|| ScorerError::Protocol(format!("bad status code: {status}")))?;
    let message = parts.next().unwrap_or_default().trim().to_string();

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Ok(SpamdResponse {
        code,
        message,
        headers,
        body: body.to_vec(),
    })
}

/// `True ; 15.3 / 5.0`
fn parse_spam_header(value: &str) -> Option<(bool, f64, f64)> {
    let (flag, scores) = value.split_once(';')?;
    let (score, base) = scores.split_once('/')?;
    let flag = flag.trim();
    let is_spam = flag.eq_ignore_ascii_case("true") || flag.eq_ignore_ascii_case("yes");
    Some((is_spam, score.trim().parse().ok()?, base.trim().parse().ok()?))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
