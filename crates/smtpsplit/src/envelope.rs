//! The contract between the inbound SMTP acceptor and whatever
//! handles a transaction on its behalf.
use async_trait::async_trait;
use rfc5321::{ForwardPath, ReversePath};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code} {message}")]
#[must_use]
pub struct RejectError {
    /// SMTP 3-digit response code
    pub code: u16,
    /// The textual portion of the response to send
    pub message: String,
}

impl RejectError {
    pub fn new<S: Into<String>>(code: u16, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// One inbound transaction. The acceptor calls these in order:
/// `add_recipient` once per accepted RCPT TO, then `begin_data`,
/// then `write` once per body line, then `close`.
/// Any `Err` is relayed to the client as the reply for that stage.
#[async_trait]
pub trait Envelope: Send {
    fn add_recipient(&mut self, recipient: ForwardPath) -> Result<(), RejectError>;
    async fn begin_data(&mut self) -> Result<(), RejectError>;
    async fn write(&mut self, line: &[u8]) -> Result<(), RejectError>;
    async fn close(&mut self) -> Result<(), RejectError>;
}

/// Produces an `Envelope` for every MAIL FROM the acceptor sees
pub trait EnvelopeFactory: Send + Sync {
    fn new_envelope(
        &self,
        sender: ReversePath,
        size: Option<u64>,
    ) -> Result<Box<dyn Envelope>, RejectError>;
}

/// Minimal bookkeeping shared by envelope implementations:
/// who the message is from and who it was accepted for.
#[derive(Debug, Clone)]
pub struct BasicEnvelope {
    sender: ReversePath,
    size: Option<u64>,
    recipients: Vec<ForwardPath>,
}

impl BasicEnvelope {
    pub fn new(sender: ReversePath, size: Option<u64>) -> Self {
        Self {
            sender,
            size,
            recipients: vec![],
        }
    }

    pub fn sender(&self) -> &ReversePath {
        &self.sender
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn recipients(&self) -> &[ForwardPath] {
        &self.recipients
    }
}

#[async_trait]
impl Envelope for BasicEnvelope {
    fn add_recipient(&mut self, recipient: ForwardPath) -> Result<(), RejectError> {
        self.recipients.push(recipient);
        Ok(())
    }

    async fn begin_data(&mut self) -> Result<(), RejectError> {
        if self.recipients.is_empty() {
            return Err(RejectError::new(554, "5.5.1 No valid recipients"));
        }
        Ok(())
    }

    async fn write(&mut self, _line: &[u8]) -> Result<(), RejectError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RejectError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[tokio::test]
    async fn basic_envelope_bookkeeping() {
        let mut env = BasicEnvelope::new(ReversePath::try_from("u@x.com").unwrap(), Some(10));
        assert_equal!(
            env.begin_data().await,
            Err(RejectError::new(554, "5.5.1 No valid recipients"))
        );

        env.add_recipient(ForwardPath::try_from("r1@a.com").unwrap())
            .unwrap();
        assert_equal!(env.recipients().len(), 1);
        assert_equal!(env.size(), Some(10));
        assert_equal!(env.sender().to_string(), "u@x.com");
        env.begin_data().await.unwrap();
        env.write(b"hello\r\n").await.unwrap();
        env.close().await.unwrap();
    }

    #[test]
    fn reject_display() {
        assert_equal!(
            RejectError::new(451, "4.4.1 Backend server is not responding").to_string(),
            "451 4.4.1 Backend server is not responding"
        );
    }
}
