//! The envelope relay engine: fans one inbound transaction out to
//! one backend session per recipient domain, and collapses their
//! individual outcomes into a single pass/fail for the client.
use crate::envelope::{BasicEnvelope, Envelope, EnvelopeFactory, RejectError};
use crate::routing::RoutingTable;
use crate::session::{BackendSession, SessionParams};
use async_trait::async_trait;
use futures::future::try_join_all;
use indexmap::IndexMap;
use rfc5321::{ClientError, ForwardPath, Response, ReversePath, SmtpClientTimeouts};
use std::sync::Arc;
use thiserror::Error;

const UNAVAILABLE_CODE: u16 = 451;
const UNAVAILABLE_MESSAGE: &str = "4.4.1 Backend server is not responding";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Couldn't talk to the backend at all: dial failure, timeout,
    /// broken connection or garbled reply.
    #[error("backend {address} for {domain} is not responding: {reason}")]
    Unavailable {
        domain: String,
        address: String,
        reason: String,
    },
    /// The backend answered, but not with what the dialog required
    #[error("backend {address} for {domain} rejected: {}", .response.to_single_line())]
    Rejected {
        domain: String,
        address: String,
        response: Response,
    },
}

impl RelayError {
    fn from_client(session: &BackendSession, err: ClientError) -> Self {
        match err {
            ClientError::Rejected(response) => Self::Rejected {
                domain: session.domain().to_string(),
                address: session.address().to_string(),
                response,
            },
            err => Self::Unavailable {
                domain: session.domain().to_string(),
                address: session.address().to_string(),
                reason: format!("{err:#}"),
            },
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl From<&RelayError> for RejectError {
    fn from(err: &RelayError) -> Self {
        match err {
            // A non-error reply in the wrong place can't be relayed
            // to the client as-is without it looking like success.
            RelayError::Rejected { response, .. } if response.code >= 400 => {
                RejectError::new(response.code, response.text_with_enhanced_code())
            }
            _ => RejectError::new(UNAVAILABLE_CODE, UNAVAILABLE_MESSAGE),
        }
    }
}

/// Settings shared by every envelope the relay creates
#[derive(Debug, Clone)]
pub struct RelayParams {
    /// Name we introduce ourselves with in HELO
    pub hostname: String,
    pub timeouts: SmtpClientTimeouts,
}

pub struct RelayFactory {
    routes: Arc<RoutingTable>,
    params: RelayParams,
}

impl RelayFactory {
    pub fn new(routes: Arc<RoutingTable>, params: RelayParams) -> Self {
        Self { routes, params }
    }
}

impl EnvelopeFactory for RelayFactory {
    fn new_envelope(
        &self,
        sender: ReversePath,
        size: Option<u64>,
    ) -> Result<Box<dyn Envelope>, RejectError> {
        Ok(Box::new(RelayEnvelope::new(
            self.routes.clone(),
            self.params.clone(),
            sender,
            size,
        )))
    }
}

struct Bucket {
    address: String,
    recipients: Vec<ForwardPath>,
}

pub struct RelayEnvelope {
    basic: BasicEnvelope,
    routes: Arc<RoutingTable>,
    params: RelayParams,
    /// Keyed by domain, never by backend address: two domains that
    /// route to the same backend still get their own session.
    buckets: IndexMap<String, Bucket>,
    sessions: Vec<BackendSession>,
    failed: Option<RelayError>,
}

impl RelayEnvelope {
    pub fn new(
        routes: Arc<RoutingTable>,
        params: RelayParams,
        sender: ReversePath,
        size: Option<u64>,
    ) -> Self {
        Self {
            basic: BasicEnvelope::new(sender, size),
            routes,
            params,
            buckets: IndexMap::new(),
            sessions: vec![],
            failed: None,
        }
    }

    /// The routable domains seen so far, in first-seen order
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(|k| k.as_str())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn fail(&mut self, err: RelayError) -> RejectError {
        if err.is_unavailable() {
            tracing::error!("relay transaction failed: {err:#}");
        } else {
            tracing::warn!("relay transaction failed: {err:#}");
        }
        let reject = RejectError::from(&err);
        self.failed.replace(err);
        reject
    }

    async fn abort_all(&mut self) {
        for session in &mut self.sessions {
            tracing::debug!(
                "aborting {} via {} in state {:?}",
                session.domain(),
                session.address(),
                session.state()
            );
            session.abort().await;
        }
        self.sessions.clear();
    }

    async fn establish_sessions(&mut self) -> Result<(), RelayError> {
        let timeouts = self.params.timeouts;
        let helo_name = self.params.hostname.as_str();
        let sender = self.basic.sender();
        let size = self.basic.size();

        let mut sessions: Vec<BackendSession> = self
            .buckets
            .iter()
            .map(|(domain, bucket)| BackendSession::new(domain, &bucket.address))
            .collect();

        // The first failure drops the establishes still in flight;
        // whatever they got through is torn down by abort_all
        let result = try_join_all(sessions.iter_mut().zip(self.buckets.values()).map(
            |(session, bucket)| async move {
                let params = SessionParams {
                    helo_name,
                    sender,
                    size,
                    recipients: &bucket.recipients,
                    timeouts,
                };
                match session.establish(&params).await {
                    Ok(()) => Ok(()),
                    Err(err) => Err(RelayError::from_client(session, err)),
                }
            },
        ))
        .await;

        self.sessions = sessions;
        result.map(|_| ())
    }

    async fn open_data(&mut self) -> Result<(), RelayError> {
        try_join_all(self.sessions.iter_mut().map(|session| async move {
            match session.open_data().await {
                Ok(()) => Ok(()),
                Err(err) => Err(RelayError::from_client(session, err)),
            }
        }))
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl Envelope for RelayEnvelope {
    fn add_recipient(&mut self, recipient: ForwardPath) -> Result<(), RejectError> {
        match self.routes.route_for(&recipient) {
            Some((domain, address)) => {
                let address = address.to_string();
                self.buckets
                    .entry(domain)
                    .or_insert_with(|| Bucket {
                        address,
                        recipients: vec![],
                    })
                    .recipients
                    .push(recipient.clone());
            }
            None => {
                tracing::debug!("no route for {recipient}; it will not be delivered");
            }
        }
        self.basic.add_recipient(recipient)
    }

    async fn begin_data(&mut self) -> Result<(), RejectError> {
        if let Some(err) = &self.failed {
            return Err(err.into());
        }
        self.basic.begin_data().await?;

        if self.buckets.is_empty() {
            // Every recipient was unroutable; there is nowhere to
            // send the message, but the client is not told.
            tracing::warn!(
                "none of the {} recipients from {} are routable",
                self.basic.recipients().len(),
                self.basic.sender()
            );
            return Ok(());
        }

        if let Err(err) = self.establish_sessions().await {
            self.abort_all().await;
            return Err(self.fail(err));
        }

        // Every session has reached RecipientsAccepted; only now
        // may any of them enter DATA.
        if let Err(err) = self.open_data().await {
            self.abort_all().await;
            return Err(self.fail(err));
        }

        tracing::debug!(
            "relaying to {} backend sessions: {:?}",
            self.session_count(),
            self.domains().collect::<Vec<_>>()
        );
        Ok(())
    }

    async fn write(&mut self, line: &[u8]) -> Result<(), RejectError> {
        if let Some(err) = &self.failed {
            return Err(err.into());
        }
        tracing::trace!("sending data line to all: {}", line.escape_ascii());

        let mut failure = None;
        for session in &mut self.sessions {
            if let Err(err) = session.write(line).await {
                failure = Some(RelayError::from_client(session, err));
                break;
            }
        }

        match failure {
            Some(err) => {
                self.abort_all().await;
                Err(self.fail(err))
            }
            None => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<(), RejectError> {
        if let Some(err) = &self.failed {
            return Err(err.into());
        }

        let mut first_error = None;
        for session in &mut self.sessions {
            match session.finish().await {
                Ok(response) => tracing::debug!(
                    "{} via {} accepted the message: {}",
                    session.domain(),
                    session.address(),
                    response.to_single_line()
                ),
                Err(err) => {
                    let err = RelayError::from_client(session, err);
                    tracing::error!("finalizing {}: {err:#}", session.domain());
                    first_error.get_or_insert(err);
                }
            }
        }
        self.sessions.clear();

        match first_error {
            Some(err) => Err(self.fail(err)),
            None => self.basic.close().await,
        }
    }
}
