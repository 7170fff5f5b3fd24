use rfc5321::{
    ClientError, EsmtpParameter, ForwardPath, Response, ReversePath, SmtpClient,
    SmtpClientTimeouts,
};

/// Where a backend connection is in its dialog.
/// Sessions only ever move forward through these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Idle,
    /// TCP connected and the 220 banner was received
    Connected,
    /// HELO accepted
    Greeted,
    MailAccepted,
    RecipientsAccepted,
    /// DATA accepted with 354; body may be written
    DataOpen,
    Finalized,
}

/// What a backend session needs to replay a transaction
#[derive(Debug, Clone)]
pub struct SessionParams<'a> {
    pub helo_name: &'a str,
    pub sender: &'a ReversePath,
    pub size: Option<u64>,
    pub recipients: &'a [ForwardPath],
    pub timeouts: SmtpClientTimeouts,
}

/// One outbound SMTP connection carrying the recipients of a single domain
#[derive(Debug)]
pub struct BackendSession {
    domain: String,
    address: String,
    state: SessionState,
    client: Option<SmtpClient>,
}

impl BackendSession {
    pub fn new(domain: &str, address: &str) -> Self {
        Self {
            domain: domain.to_string(),
            address: address.to_string(),
            state: SessionState::Idle,
            client: None,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn advance(&mut self, state: SessionState) {
        tracing::debug!(
            "{} via {}: {:?} -> {state:?}",
            self.domain,
            self.address,
            self.state
        );
        self.state = state;
    }

    fn client_in(&mut self, expected: SessionState) -> Result<&mut SmtpClient, ClientError> {
        if self.state != expected {
            tracing::error!(
                "{} via {}: operation requires {expected:?} but session is {:?}",
                self.domain,
                self.address,
                self.state
            );
            return Err(ClientError::NotConnected);
        }
        self.client.as_mut().ok_or(ClientError::NotConnected)
    }

    /// Dial the backend and replay the envelope up to and
    /// including the last RCPT TO.
    pub async fn establish(&mut self, params: &SessionParams<'_>) -> Result<(), ClientError> {
        if self.state != SessionState::Idle {
            return Err(ClientError::NotConnected);
        }

        let mut client = SmtpClient::connect(&self.address, params.timeouts).await?;
        client.read_banner().await?;
        self.client.replace(client);
        self.advance(SessionState::Connected);

        self.client_in(SessionState::Connected)?
            .helo(params.helo_name)
            .await?;
        self.advance(SessionState::Greeted);

        let parameters = match params.size {
            Some(size) => vec![EsmtpParameter {
                name: "SIZE".to_string(),
                value: Some(size.to_string()),
            }],
            None => vec![],
        };
        self.client_in(SessionState::Greeted)?
            .mail_from(params.sender.clone(), parameters)
            .await?;
        self.advance(SessionState::MailAccepted);

        let client = self.client_in(SessionState::MailAccepted)?;
        for recipient in params.recipients {
            client.rcpt_to(recipient.clone()).await?;
        }
        self.advance(SessionState::RecipientsAccepted);

        Ok(())
    }

    pub async fn open_data(&mut self) -> Result<(), ClientError> {
        self.client_in(SessionState::RecipientsAccepted)?
            .data()
            .await?;
        self.advance(SessionState::DataOpen);
        Ok(())
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), ClientError> {
        self.client_in(SessionState::DataOpen)?
            .write_data(data)
            .await
    }

    /// Terminate the message, say QUIT and close the socket.
    /// The socket is closed even if the dot or QUIT is refused.
    pub async fn finish(&mut self) -> Result<Response, ClientError> {
        let result = self.finish_dialog().await;
        self.close().await;
        self.advance(SessionState::Finalized);
        result
    }

    async fn finish_dialog(&mut self) -> Result<Response, ClientError> {
        let client = self.client_in(SessionState::DataOpen)?;
        let response = client.finish_data().await?;
        client.quit().await?;
        Ok(response)
    }

    /// Abandon the session. QUIT is only attempted outside of the
    /// DATA phase, where the backend would treat it as message text.
    pub async fn abort(&mut self) {
        if self.state >= SessionState::Connected && self.state < SessionState::DataOpen {
            if let Some(client) = self.client.as_mut() {
                if let Err(err) = client.quit().await {
                    tracing::debug!(
                        "{} via {}: QUIT during abort failed: {err:#}",
                        self.domain,
                        self.address
                    );
                }
            }
        }
        self.close().await;
        self.advance(SessionState::Finalized);
    }

    async fn close(&mut self) {
        if let Some(mut client) = self.client.take() {
            if let Err(err) = client.close().await {
                tracing::warn!(
                    "{} via {}: error while closing connection: {err:#}",
                    self.domain,
                    self.address
                );
            }
        }
    }
}
