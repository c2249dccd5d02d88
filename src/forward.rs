use async_trait::async_trait;
use lettre::address::{Address, AddressError, Envelope};
use lettre::transport::smtp::AsyncSmtpTransport;
use lettre::{AsyncTransport, Tokio1Executor};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Invalid address {address:?}: {source}")]
    Address {
        address: String,
        source: AddressError,
    },
    #[error("Invalid envelope: {0}")]
    Envelope(lettre::error::Error),
    #[error("Relay transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

/// Hands a single-recipient message to the downstream relay. Implementations
/// do not retry; the caller decides what to do with a failure.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn relay(&self, sender: &str, recipient: &str, body: &[u8]) -> Result<(), ForwardError>;
}

/// Plain SMTP relay client. A fresh connection is opened for every message.
#[derive(Clone)]
pub struct SmtpForwarder {
    target: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpForwarder {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .timeout(Some(timeout))
            .build();
        Self {
            target: format!("{host}:{port}"),
            transport,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

/// Builds a one-recipient envelope. An empty or `<>` sender is the null
/// reverse path used by bounces.
pub fn envelope(sender: &str, recipient: &str) -> Result<Envelope, ForwardError> {
    let from = match strip_brackets(sender) {
        "" => None,
        address => Some(parse_address(address)?),
    };
    let to = parse_address(strip_brackets(recipient))?;
    Envelope::new(from, vec![to]).map_err(ForwardError::Envelope)
}

fn strip_brackets(address: &str) -> &str {
    address.trim().trim_start_matches('<').trim_end_matches('>').trim()
}

fn parse_address(address: &str) -> Result<Address, ForwardError> {
    address
        .parse::<Address>()
        .map_err(|source| ForwardError::Address {
            address: address.to_string(),
            source,
        })
}

#[async_trait]
impl Forwarder for SmtpForwarder {
    async fn relay(&self, sender: &str, recipient: &str, body: &[u8]) -> Result<(), ForwardError> {
        let envelope = envelope(sender, recipient)?;
        let response = self.transport.send_raw(&envelope, body).await?;
        log::debug!(
            "Relayed {} bytes for {} via {}: {:?}",
            body.len(),
            recipient,
            self.target,
            response.code()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_with_brackets() {
        let envelope = envelope("<alice@example.com>", "bob@example.com").unwrap();
        assert_eq!(
            envelope.from().map(|a| a.to_string()),
            Some("alice@example.com".to_string())
        );
        assert_eq!(envelope.to().len(), 1);
        assert_eq!(envelope.to()[0].to_string(), "bob@example.com");
    }

    #[test]
    fn test_null_sender_is_allowed() {
        let envelope = envelope("<>", "bob@example.com").unwrap();
        assert!(envelope.from().is_none());
        let envelope = super::envelope("", "bob@example.com").unwrap();
        assert!(envelope.from().is_none());
    }

    #[test]
    fn test_bad_recipient_is_an_error() {
        assert!(matches!(
            envelope("alice@example.com", "not an address"),
            Err(ForwardError::Address { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_relay_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let forwarder = SmtpForwarder::new("127.0.0.1", port, Duration::from_secs(2));
        let result = forwarder
            .relay("alice@example.com", "bob@example.com", b"Subject: x\r\n\r\nbody\r\n")
            .await;
        assert!(matches!(result, Err(ForwardError::Transport(_))));
    }
}
