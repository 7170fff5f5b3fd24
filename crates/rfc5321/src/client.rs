use crate::client_types::{parse_response_line, ResponseBuilder};
use crate::{
    AsyncReadAndWrite, BoxedAsyncReadAndWrite, Command, Domain, EsmtpParameter, ForwardPath,
    Response, ReversePath, SmtpClientTimeouts,
};
use memchr::memmem::Finder;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;

const MAX_LINE_LEN: usize = 4096;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed Response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Command rejected {}", .0.to_single_line())]
    Rejected(Response),
    #[error("Timed Out connecting to {address} after {duration:?}")]
    TimeOutConnect { address: String, duration: Duration },
    #[error("Timed Out waiting {duration:?} for response to {command:?}")]
    TimeOutResponse {
        command: Option<Command>,
        duration: Duration,
    },
    #[error("Timed Out writing {duration:?} {command:?}")]
    TimeOutRequest {
        command: Command,
        duration: Duration,
    },
    #[error("Timed Out sending message payload data")]
    TimeOutData,
}

impl ClientError {
    /// Returns true if the peer answered with a reply we didn't
    /// expect, as opposed to being unreachable or timing out.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Rejected(response) => Some(response),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct SmtpClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    read_buffer: Vec<u8>,
    timeouts: SmtpClientTimeouts,
    data_at_line_start: bool,
}

fn extract_hostname(hostname: &str) -> &str {
    // Just the hostname, without any :port
    let fields: Vec<&str> = hostname.rsplitn(2, ':').collect();
    let hostname = if fields.len() == 2 {
        fields[1]
    } else {
        hostname
    };

    if hostname.starts_with('[') && hostname.ends_with(']') {
        &hostname[1..hostname.len() - 1]
    } else {
        hostname
    }
}

impl SmtpClient {
    /// Dial `addr` (a `host:port` string), bounded by the connect timeout
    pub async fn connect(addr: &str, timeouts: SmtpClientTimeouts) -> Result<Self, ClientError> {
        let stream = dial(addr, timeouts.connect_timeout, TcpStream::connect(addr)).await?;
        // No need for Nagle with SMTP request/response
        stream.set_nodelay(true)?;
        Ok(Self::with_stream(BufStream::new(stream), addr, timeouts))
    }

    pub fn with_stream<S: AsyncReadAndWrite + 'static, H: AsRef<str>>(
        stream: S,
        peer_hostname: H,
        timeouts: SmtpClientTimeouts,
    ) -> Self {
        let hostname = extract_hostname(peer_hostname.as_ref()).to_string();

        Self {
            socket: Some(Box::new(stream)),
            hostname,
            read_buffer: Vec::with_capacity(1024),
            timeouts,
            data_at_line_start: true,
        }
    }

    pub fn timeouts(&self) -> &SmtpClientTimeouts {
        &self.timeouts
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&Command>,
    ) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            let mut iter = self.read_buffer.iter().enumerate();
            while let Some((i, &b)) = iter.next() {
                if b != b'\r' {
                    continue;
                }
                if let Some((_, b'\n')) = iter.next() {
                    if too_long {
                        self.read_buffer.drain(0..i + 2);
                        return Err(ClientError::ResponseTooLong);
                    }

                    let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                    self.read_buffer.drain(0..i + 2);
                    return Ok(line?);
                }
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            // Didn't find a complete line, fill up the rest of the buffer
            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(ClientError::TimeOutResponse {
                            command: cmd.cloned(),
                            duration: timeout_duration,
                        })
                    }
                },
                None => return Err(ClientError::NotConnected),
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::NotConnected);
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    async fn write_bytes(
        &mut self,
        data: &[u8],
        duration: Duration,
        command: &Command,
    ) -> Result<(), ClientError> {
        match self.socket.as_mut() {
            Some(socket) => match timeout(duration, socket.write_all(data)).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(ClientError::TimeOutRequest {
                    command: command.clone(),
                    duration,
                }),
            },
            None => Err(ClientError::NotConnected),
        }
    }

    pub async fn read_response(
        &mut self,
        command: Option<&Command>,
        timeout_duration: Duration,
    ) -> Result<Response, ClientError> {
        if let Some(sock) = self.socket.as_mut() {
            match timeout(timeout_duration, sock.flush()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ClientError::TimeOutResponse {
                        command: command.cloned(),
                        duration: timeout_duration,
                    })
                }
            }
        }

        let mut line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let mut parsed = parse_response_line(&line)?;
        let mut builder = ResponseBuilder::new(&parsed);

        let subsequent_line_timeout_duration = Duration::from_secs(60).min(timeout_duration);
        while !parsed.is_final {
            line = self
                .read_line(subsequent_line_timeout_duration, command)
                .await?;
            tracing::trace!("recv<-{}: {line}", self.hostname);
            parsed = parse_response_line(&line)?;
            builder
                .add_line(&parsed)
                .map_err(ClientError::MalformedResponseLine)?;
        }

        let response = builder.build(command.map(|cmd| cmd.encode()));
        tracing::trace!("{}: {command:?} response: {response:?}", self.hostname);

        Ok(response)
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, ClientError> {
        let line = command.encode();
        tracing::trace!("send->{}: {}", self.hostname, line.escape_debug());
        self.write_bytes(
            line.as_bytes(),
            command.client_timeout_request(&self.timeouts),
            command,
        )
        .await?;

        self.read_response(Some(command), command.client_timeout(&self.timeouts))
            .await
    }

    /// Send `command`; any reply code not listed in `codes` is
    /// reported as `ClientError::Rejected`.
    pub async fn expect(
        &mut self,
        command: &Command,
        codes: &[u16],
    ) -> Result<Response, ClientError> {
        let response = self.send_command(command).await?;
        if !codes.contains(&response.code) {
            return Err(ClientError::Rejected(response));
        }
        Ok(response)
    }

    /// Read the initial 220 greeting
    pub async fn read_banner(&mut self) -> Result<Response, ClientError> {
        let banner = self
            .read_response(None, self.timeouts.banner_timeout)
            .await?;
        if banner.code != 220 {
            return Err(ClientError::Rejected(banner));
        }
        Ok(banner)
    }

    pub async fn helo(&mut self, helo_name: &str) -> Result<Response, ClientError> {
        self.expect(&Command::Helo(Domain::Name(helo_name.to_string())), &[250])
            .await
    }

    pub async fn mail_from(
        &mut self,
        sender: ReversePath,
        parameters: Vec<EsmtpParameter>,
    ) -> Result<Response, ClientError> {
        self.expect(
            &Command::MailFrom {
                address: sender,
                parameters,
            },
            &[250],
        )
        .await
    }

    pub async fn rcpt_to(&mut self, recipient: ForwardPath) -> Result<Response, ClientError> {
        self.expect(
            &Command::RcptTo {
                address: recipient,
                parameters: vec![],
            },
            &[250, 251],
        )
        .await
    }

    /// Issue DATA; on success the connection is ready to accept
    /// message content via `write_data`.
    pub async fn data(&mut self) -> Result<Response, ClientError> {
        let response = self.expect(&Command::Data, &[354]).await?;
        self.data_at_line_start = true;
        Ok(response)
    }

    /// Write a piece of message content. Lines beginning with `.`
    /// are stuffed, including when the preceding chunk ended a line,
    /// so that the peer decodes exactly the supplied bytes.
    pub async fn write_data(&mut self, data: &[u8]) -> Result<(), ClientError> {
        if data.is_empty() {
            return Ok(());
        }

        let stuffed = apply_dot_stuffing(data, self.data_at_line_start);
        let data = stuffed.as_deref().unwrap_or(data);

        let duration = Command::Data.client_timeout_request(&self.timeouts);
        match self.socket.as_mut() {
            Some(sock) => match timeout(duration, sock.write_all(data)).await {
                Ok(result) => result?,
                Err(_) => return Err(ClientError::TimeOutData),
            },
            None => return Err(ClientError::NotConnected),
        }
        self.data_at_line_start = data.ends_with(b"\n");
        Ok(())
    }

    /// Terminate the message content and wait for the peer to accept it
    pub async fn finish_data(&mut self) -> Result<Response, ClientError> {
        let marker = if self.data_at_line_start {
            ".\r\n"
        } else {
            "\r\n.\r\n"
        };
        tracing::trace!("send->{}: {}", self.hostname, marker.escape_debug());

        let data_dot = Command::DataDot;
        self.write_bytes(
            marker.as_bytes(),
            data_dot.client_timeout_request(&self.timeouts),
            &data_dot,
        )
        .await?;

        let resp = self
            .read_response(Some(&data_dot), data_dot.client_timeout(&self.timeouts))
            .await?;
        if resp.code != 250 {
            return Err(ClientError::Rejected(resp));
        }
        Ok(resp)
    }

    pub async fn quit(&mut self) -> Result<Response, ClientError> {
        self.expect(&Command::Quit, &[221]).await
    }

    /// Flush and shut down the socket. Subsequent operations
    /// report `NotConnected`.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        if let Some(mut socket) = self.socket.take() {
            let duration = self.timeouts.quit_timeout;
            match timeout(duration, socket.shutdown()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ClientError::TimeOutRequest {
                        command: Command::Quit,
                        duration,
                    })
                }
            }
        }
        Ok(())
    }
}

async fn dial<F>(address: &str, duration: Duration, connect: F) -> Result<TcpStream, ClientError>
where
    F: Future<Output = std::io::Result<TcpStream>>,
{
    match timeout(duration, connect).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(ClientError::TimeOutConnect {
            address: address.to_string(),
            duration,
        }),
    }
}

fn apply_dot_stuffing(data: &[u8], at_line_start: bool) -> Option<Vec<u8>> {
    static LFDOT: LazyLock<Finder<'static>> = LazyLock::new(|| Finder::new("\n."));

    let leading = at_line_start && data.starts_with(b".");
    if !leading && LFDOT.find(data).is_none() {
        return None;
    }

    let mut stuffed = Vec::with_capacity(data.len() + 8);
    if leading {
        stuffed.push(b'.');
    }
    let mut last_idx = 0;
    for i in LFDOT.find_iter(data) {
        stuffed.extend_from_slice(&data[last_idx..=i]);
        stuffed.push(b'.');
        last_idx = i + 1;
    }
    stuffed.extend_from_slice(&data[last_idx..]);
    Some(stuffed)
}
