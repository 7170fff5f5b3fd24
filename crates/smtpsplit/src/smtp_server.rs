use crate::config::Config;
use crate::envelope::{Envelope, EnvelopeFactory, RejectError};
use crate::lifecycle::ShutdownSubscription;
use crate::tls_helpers::make_server_config;
use anyhow::Context;
use rfc5321::{BoxedAsyncReadAndWrite, Command, CommandError, EsmtpParameter};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::instrument;

const MAX_COMMAND_LINE: usize = 4096;
/// Longer body lines are passed on in pieces of this size
const MAX_DATA_CHUNK: usize = 64 * 1024;

/// What every inbound connection needs to know
pub struct ServerParams {
    pub hostname: String,
    pub timeout: Duration,
    pub tls: Option<Arc<ServerConfig>>,
    pub factory: Arc<dyn EnvelopeFactory>,
}

pub struct SmtpListener {
    listener: TcpListener,
    params: Arc<ServerParams>,
}

impl SmtpListener {
    pub async fn bind(config: &Config, factory: Arc<dyn EnvelopeFactory>) -> anyhow::Result<Self> {
        let tls = match &config.tls {
            Some(files) => Some(make_server_config(files)?),
            None => None,
        };
        let listener = TcpListener::bind(&config.listen_address)
            .await
            .with_context(|| format!("listen on {}", config.listen_address))?;

        Ok(Self {
            listener,
            params: Arc::new(ServerParams {
                hostname: config.host.clone(),
                timeout: config.timeout(),
                tls,
                factory,
            }),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown is requested.
    /// Connections already in progress are left to finish on their own.
    pub async fn run(self, mut shutdown: ShutdownSubscription) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        tracing::info!("smtp listener on {addr}");

        loop {
            tokio::select! {
                _ = shutdown.shutting_down() => {
                    tracing::info!("smtp listener on {addr} -> stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (socket, peer_address) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::error!("accept on {addr} failed: {err:#}");
                            continue;
                        }
                    };
                    if let Err(err) = socket.set_nodelay(true) {
                        tracing::debug!("set_nodelay for {peer_address}: {err:#}");
                    }
                    let params = self.params.clone();
                    tokio::spawn(async move {
                        let socket: BoxedAsyncReadAndWrite = Box::new(socket);
                        if let Err(err) = SmtpServer::run(socket, peer_address, params).await {
                            tracing::error!("Error in SmtpServer for {peer_address}: {err:#}");
                        }
                    });
                }
            }
        }
    }
}

enum ReadLine {
    Line(Vec<u8>),
    TooLong,
    TimedOut,
    Disconnected,
}

struct Transaction {
    envelope: Box<dyn Envelope>,
    recipients: usize,
}

pub struct SmtpServer {
    socket: Option<BufReader<BoxedAsyncReadAndWrite>>,
    params: Arc<ServerParams>,
    peer_address: SocketAddr,
    said_hello: Option<String>,
    transaction: Option<Transaction>,
    tls_active: bool,
}

impl SmtpServer {
    pub async fn run(
        socket: BoxedAsyncReadAndWrite,
        peer_address: SocketAddr,
        params: Arc<ServerParams>,
    ) -> anyhow::Result<()> {
        let mut server = SmtpServer {
            socket: Some(BufReader::new(socket)),
            params,
            peer_address,
            said_hello: None,
            transaction: None,
            tls_active: false,
        };

        let result = server.process().await;
        if let Err(err) = &result {
            tracing::debug!("{peer_address}: {err:#}");
            server
                .write_response(421, "4.3.0 technical difficulties")
                .await
                .ok();
        }
        if let Some(mut socket) = server.socket.take() {
            socket.get_mut().shutdown().await.ok();
        }
        result
    }

    async fn write_response<S: AsRef<str>>(
        &mut self,
        status: u16,
        message: S,
    ) -> anyhow::Result<()> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("connection is closed"))?
            .get_mut();

        let mut text = String::new();
        let mut lines = message.as_ref().lines().peekable();
        while let Some(line) = lines.next() {
            let is_last = lines.peek().is_none();
            let sep = if is_last { ' ' } else { '-' };
            text.push_str(&format!("{status}{sep}{line}\r\n"));
        }
        tracing::trace!("{}: send-> {}", self.peer_address, text.escape_debug());
        socket.write_all(text.as_bytes()).await?;
        socket.flush().await?;
        Ok(())
    }

    async fn write_reject(&mut self, rej: RejectError) -> anyhow::Result<()> {
        self.write_response(rej.code, rej.message).await
    }

    /// Read up to and including the next LF, or at most `limit` bytes
    /// of it. On TooLong the rest of the line has been discarded.
    async fn read_line(&mut self, limit: usize, discard_long: bool) -> anyhow::Result<ReadLine> {
        let timeout_duration = self.params.timeout;
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("connection is closed"))?;

        let mut line = vec![];
        let read = tokio::time::timeout(timeout_duration, async {
            let n = (&mut *socket)
                .take(limit as u64)
                .read_until(b'\n', &mut line)
                .await?;
            if n == 0 {
                return Ok::<_, std::io::Error>(false);
            }
            if discard_long && line.len() >= limit && !line.ends_with(b"\n") {
                let mut junk = vec![];
                loop {
                    junk.clear();
                    let n = (&mut *socket)
                        .take(limit as u64)
                        .read_until(b'\n', &mut junk)
                        .await?;
                    if n == 0 || junk.ends_with(b"\n") {
                        break;
                    }
                }
            }
            Ok(true)
        })
        .await;

        Ok(match read {
            Err(_) => ReadLine::TimedOut,
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(false)) => ReadLine::Disconnected,
            Ok(Ok(true)) if discard_long && line.len() >= limit && !line.ends_with(b"\n") => {
                ReadLine::TooLong
            }
            Ok(Ok(true)) => ReadLine::Line(line),
        })
    }

    async fn idle_timeout(&mut self) -> anyhow::Result<()> {
        tracing::debug!("{}: client idle for too long", self.peer_address);
        self.write_response(
            421,
            format!(
                "4.4.2 {} idle for too long, closing connection",
                self.params.hostname
            ),
        )
        .await
    }

    #[instrument(skip(self), fields(peer = %self.peer_address))]
    async fn process(&mut self) -> anyhow::Result<()> {
        self.write_response(220, format!("{} ESMTP smtpsplit", self.params.hostname))
            .await?;

        loop {
            let line = match self.read_line(MAX_COMMAND_LINE, true).await? {
                ReadLine::Line(line) => line,
                ReadLine::TooLong => {
                    self.write_response(500, "5.5.6 Line too long").await?;
                    continue;
                }
                ReadLine::TimedOut => return self.idle_timeout().await,
                ReadLine::Disconnected => {
                    tracing::debug!("client disconnected");
                    return Ok(());
                }
            };

            let Ok(line) = String::from_utf8(line) else {
                self.write_response(500, "5.5.2 Command line is not valid UTF-8")
                    .await?;
                continue;
            };
            tracing::trace!("recv<- {}", line.escape_debug());

            match Command::parse(&line) {
                Err(CommandError::Unknown(cmd)) => {
                    self.write_response(
                        502,
                        format!("5.5.1 Command unrecognized/unimplemented: {cmd}"),
                    )
                    .await?;
                }
                Err(err) => {
                    self.write_response(
                        501,
                        format!("5.5.4 Syntax error in command or arguments: {err}"),
                    )
                    .await?;
                }
                Ok(Command::Quit) => {
                    self.write_response(221, "2.0.0 Bye").await?;
                    return Ok(());
                }
                Ok(Command::Ehlo(domain)) => {
                    self.transaction.take();
                    let mut reply = format!("{} Hello {domain}\nSIZE\nHELP", self.params.hostname);
                    if self.params.tls.is_some() && !self.tls_active {
                        reply.push_str("\nSTARTTLS");
                    }
                    self.said_hello.replace(domain.to_string());
                    self.write_response(250, reply).await?;
                }
                Ok(Command::Helo(domain)) => {
                    self.transaction.take();
                    self.said_hello.replace(domain.to_string());
                    self.write_response(250, format!("{} Hello {domain}", self.params.hostname))
                        .await?;
                }
                Ok(Command::StartTls) => {
                    if self.tls_active {
                        self.write_response(503, "5.5.1 TLS is already active")
                            .await?;
                        continue;
                    }
                    let Some(tls) = self.params.tls.clone() else {
                        self.write_response(454, "4.7.0 TLS not available").await?;
                        continue;
                    };
                    self.write_response(220, "2.0.0 Ready to start TLS").await?;
                    self.start_tls(tls).await?;
                }
                Ok(Command::MailFrom {
                    address,
                    parameters,
                }) => {
                    if self.said_hello.is_none() {
                        self.write_response(503, "5.5.1 EHLO or HELO must be issued first")
                            .await?;
                        continue;
                    }
                    if self.transaction.is_some() {
                        self.write_response(
                            503,
                            "5.5.1 MAIL FROM already issued; you must RSET first",
                        )
                        .await?;
                        continue;
                    }
                    let size = match declared_size(&parameters) {
                        Ok(size) => size,
                        Err(reason) => {
                            self.write_response(501, format!("5.5.4 {reason}")).await?;
                            continue;
                        }
                    };
                    tracing::debug!("MAIL FROM:<{address}> size={size:?}");
                    match self.params.factory.new_envelope(address, size) {
                        Ok(envelope) => {
                            self.transaction.replace(Transaction {
                                envelope,
                                recipients: 0,
                            });
                            self.write_response(250, "2.1.0 OK").await?;
                        }
                        Err(rej) => self.write_reject(rej).await?,
                    }
                }
                Ok(Command::RcptTo { address, .. }) => {
                    let Some(transaction) = self.transaction.as_mut() else {
                        self.write_response(503, "5.5.1 MAIL FROM must be issued first")
                            .await?;
                        continue;
                    };
                    tracing::debug!("RCPT TO:<{address}>");
                    match transaction.envelope.add_recipient(address) {
                        Ok(()) => {
                            transaction.recipients += 1;
                            self.write_response(250, "2.1.5 OK").await?;
                        }
                        Err(rej) => self.write_reject(rej).await?,
                    }
                }
                Ok(Command::Data) => {
                    let Some(mut transaction) = self.transaction.take() else {
                        self.write_response(503, "5.5.1 MAIL FROM must be issued first")
                            .await?;
                        continue;
                    };
                    if transaction.recipients == 0 {
                        self.transaction.replace(transaction);
                        self.write_response(503, "5.5.1 RCPT TO must be issued first")
                            .await?;
                        continue;
                    }
                    if let Err(rej) = transaction.envelope.begin_data().await {
                        self.write_reject(rej).await?;
                        continue;
                    }
                    self.write_response(354, "Send body; end with CRLF.CRLF")
                        .await?;

                    if !self.receive_data(transaction.envelope.as_mut()).await? {
                        return Ok(());
                    }
                }
                Ok(Command::Rset) => {
                    self.transaction.take();
                    self.write_response(250, "2.0.0 Reset state").await?;
                }
                Ok(Command::Noop(_)) => {
                    self.write_response(250, "2.0.0 OK").await?;
                }
                Ok(Command::Help(_)) => {
                    self.write_response(
                        214,
                        "2.0.0 Commands: HELO EHLO MAIL RCPT DATA RSET NOOP QUIT HELP VRFY",
                    )
                    .await?;
                }
                Ok(Command::Vrfy(_)) => {
                    self.write_response(252, "2.5.0 Cannot VRFY user").await?;
                }
                Ok(Command::DataDot) => {
                    self.write_response(502, "5.5.1 Command unrecognized/unimplemented: .")
                        .await?;
                }
            }
        }
    }

    /// Pass the message body to `envelope` line by line, then
    /// finalize it. Returns false if the connection is gone.
    async fn receive_data(&mut self, envelope: &mut dyn Envelope) -> anyhow::Result<bool> {
        let mut failure: Option<RejectError> = None;
        let mut at_line_start = true;

        loop {
            let line = match self.read_line(MAX_DATA_CHUNK, false).await? {
                ReadLine::Line(line) => line,
                ReadLine::TooLong => anyhow::bail!("oversize data line was not chunked"),
                ReadLine::TimedOut => {
                    self.idle_timeout().await?;
                    return Ok(false);
                }
                ReadLine::Disconnected => {
                    tracing::debug!("client disconnected during DATA");
                    return Ok(false);
                }
            };

            if at_line_start && (line == b".\r\n" || line == b".\n") {
                break;
            }

            let data = if at_line_start && line.starts_with(b".") {
                &line[1..]
            } else {
                &line[..]
            };
            at_line_start = line.ends_with(b"\n");

            if failure.is_none() {
                if let Err(rej) = envelope.write(data).await {
                    tracing::debug!("write failed: {rej}; draining remaining body");
                    failure.replace(rej);
                }
            }
        }

        let result = match failure {
            Some(rej) => Err(rej),
            None => envelope.close().await,
        };
        match result {
            Ok(()) => self.write_response(250, "2.0.0 OK").await?,
            Err(rej) => self.write_reject(rej).await?,
        }
        Ok(true)
    }

    async fn start_tls(&mut self, tls: Arc<ServerConfig>) -> anyhow::Result<()> {
        // Anything the client pipelined after STARTTLS is discarded
        let socket = self
            .socket
            .take()
            .ok_or_else(|| anyhow::anyhow!("connection is closed"))?
            .into_inner();
        let stream = TlsAcceptor::from(tls)
            .accept(socket)
            .await
            .context("TLS handshake")?;
        let stream: BoxedAsyncReadAndWrite = Box::new(stream);
        self.socket.replace(BufReader::new(stream));
        self.tls_active = true;
        self.said_hello.take();
        self.transaction.take();
        tracing::debug!("TLS established");
        Ok(())
    }
}

fn declared_size(parameters: &[EsmtpParameter]) -> Result<Option<u64>, String> {
    match parameters
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case("SIZE"))
    {
        None => Ok(None),
        Some(p) => match p.value.as_deref().map(str::parse::<u64>) {
            Some(Ok(size)) => Ok(Some(size)),
            _ => Err(format!("invalid SIZE parameter {p}")),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lifecycle::LifeCycle;
    use crate::relay::{RelayFactory, RelayParams};
    use crate::routing::RoutingTable;
    use crate::test_backend::{MockBackend, Script};
    use k9::assert_equal;
    use maplit::btreemap;
    use rfc5321::{SmtpClient, SmtpClientTimeouts};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct TestClient {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl TestClient {
        async fn send(&mut self, text: &str) {
            self.writer.write_all(text.as_bytes()).await.unwrap();
        }

        /// Returns the code and the text of every line of the next reply
        async fn reply(&mut self) -> (u16, String) {
            let mut lines = vec![];
            loop {
                let mut line = String::new();
                self.reader.read_line(&mut line).await.unwrap();
                assert!(line.len() >= 4, "short reply {line:?}");
                let code: u16 = line[..3].parse().unwrap();
                let last = line.as_bytes()[3] == b' ';
                lines.push(line[4..].trim_end().to_string());
                if last {
                    return (code, lines.join("\n"));
                }
            }
        }

        async fn command(&mut self, line: &str) -> (u16, String) {
            self.send(&format!("{line}\r\n")).await;
            self.reply().await
        }

        async fn code(&mut self, line: &str) -> u16 {
            self.command(line).await.0
        }
    }

    fn start(
        routes: RoutingTable,
        timeout: Duration,
    ) -> (TestClient, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let factory = RelayFactory::new(
            Arc::new(routes),
            RelayParams {
                hostname: "mx.example.com".to_string(),
                timeouts: SmtpClientTimeouts::uniform(Duration::from_secs(5)),
            },
        );
        let params = Arc::new(ServerParams {
            hostname: "mx.example.com".to_string(),
            timeout,
            tls: None,
            factory: Arc::new(factory),
        });

        let (client, server) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(SmtpServer::run(
            Box::new(server),
            "127.0.0.1:4000".parse().unwrap(),
            params,
        ));
        let (reader, writer) = tokio::io::split(client);
        (
            TestClient {
                reader: BufReader::new(reader),
                writer,
            },
            handle,
        )
    }

    #[tokio::test]
    async fn bare_lf_terminator_ends_data() {
        let a = MockBackend::start(Script::default()).await;
        let routes = RoutingTable::new(btreemap! {
            "a.com".to_string() => a.address(),
        })
        .unwrap();
        let (mut client, handle) = start(routes, Duration::from_secs(5));

        assert_equal!(client.reply().await.0, 220);
        assert_equal!(client.code("HELO client.example.com").await, 250);
        assert_equal!(client.code("MAIL FROM:<u@x.com>").await, 250);
        assert_equal!(client.code("RCPT TO:<r1@a.com>").await, 250);
        assert_equal!(client.code("DATA").await, 354);
        client.send("line one\nline two\n.\n").await;
        assert_equal!(client.reply().await.0, 250);
        assert_equal!(client.code("QUIT").await, 221);
        handle.await.unwrap().unwrap();

        let t = &a.transcripts()[0];
        assert_equal!(t.body(), b"line one\nline two\n".to_vec());
        assert!(t.completed);
    }

    #[tokio::test]
    async fn relays_a_message() {
        let a = MockBackend::start(Script::default()).await;
        let b = MockBackend::start(Script::default()).await;
        let routes = RoutingTable::new(btreemap! {
            "a.com".to_string() => a.address(),
            "b.com".to_string() => b.address(),
        })
        .unwrap();
        let (mut client, handle) = start(routes, Duration::from_secs(5));

        let (code, banner) = client.reply().await;
        assert_equal!(code, 220);
        assert!(banner.starts_with("mx.example.com"));

        let (code, ehlo) = client.command("EHLO client.example.com").await;
        assert_equal!(code, 250);
        assert_equal!(
            ehlo,
            "mx.example.com Hello client.example.com\nSIZE\nHELP".to_string()
        );

        assert_equal!(client.code("MAIL FROM:<u@x.com> SIZE=42").await, 250);
        assert_equal!(client.code("RCPT TO:<r1@a.com>").await, 250);
        assert_equal!(client.code("RCPT TO:<r2@b.com>").await, 250);
        assert_equal!(client.code("RCPT TO:<r3@unknown.com>").await, 250);
        assert_equal!(client.code("DATA").await, 354);
        client
            .send("Subject: test\r\n\r\n..stuffed\r\nlast\r\n.\r\n")
            .await;
        assert_equal!(client.reply().await.0, 250);
        assert_equal!(client.code("QUIT").await, 221);
        handle.await.unwrap().unwrap();

        let expected = b"Subject: test\r\n\r\n.stuffed\r\nlast\r\n".to_vec();
        for backend in [&a, &b] {
            let t = &backend.transcripts()[0];
            assert_equal!(t.helo.as_deref(), Some("HELO mx.example.com"));
            assert_equal!(t.mail_from.as_deref(), Some("MAIL FROM:<u@x.com> SIZE=42"));
            assert_equal!(t.body(), expected);
            assert!(t.quit);
        }
        assert_equal!(
            a.transcripts()[0].rcpt_to,
            vec!["RCPT TO:<r1@a.com>".to_string()]
        );
    }

    #[tokio::test]
    async fn sequencing_and_syntax() {
        let a = MockBackend::start(Script::default()).await;
        let routes = RoutingTable::new(btreemap! {
            "a.com".to_string() => a.address(),
        })
        .unwrap();
        let (mut client, handle) = start(routes, Duration::from_secs(5));
        client.reply().await;

        assert_equal!(client.code("MAIL FROM:<u@x.com>").await, 503);
        assert_equal!(client.code("HELO client").await, 250);
        assert_equal!(client.code("RCPT TO:<r1@a.com>").await, 503);
        assert_equal!(client.code("DATA").await, 503);
        assert_equal!(client.code("MAIL FROM:<u@x.com> SIZE=big").await, 501);
        assert_equal!(client.code("MAIL FROM:<u@x.com>").await, 250);
        assert_equal!(client.code("MAIL FROM:<u@x.com>").await, 503);
        assert_equal!(client.code("DATA").await, 503);
        assert_equal!(client.code("RCPT TO:<not an address>").await, 501);
        assert_equal!(client.code("RSET").await, 250);
        assert_equal!(client.code("RCPT TO:<r1@a.com>").await, 503);
        assert_equal!(client.code("NOOP").await, 250);
        assert_equal!(client.code("HELP").await, 214);
        assert_equal!(client.code("VRFY someone").await, 252);
        assert_equal!(client.code("STARTTLS").await, 454);
        assert_equal!(client.code("WHAT").await, 502);
        let long = format!("NOOP {}", "x".repeat(MAX_COMMAND_LINE * 2));
        assert_equal!(client.code(&long).await, 500);
        assert_equal!(client.code("NOOP").await, 250);
        assert_equal!(client.code("QUIT").await, 221);
        handle.await.unwrap().unwrap();

        assert!(a.transcripts().is_empty());
    }

    #[tokio::test]
    async fn backend_rejection_is_relayed() {
        let a = MockBackend::start(Script {
            reject_rcpt: Some("550 5.1.1 no such user\r\n"),
            ..Script::default()
        })
        .await;
        let routes = RoutingTable::new(btreemap! {
            "a.com".to_string() => a.address(),
        })
        .unwrap();
        let (mut client, handle) = start(routes, Duration::from_secs(5));
        client.reply().await;

        assert_equal!(client.code("HELO client").await, 250);
        assert_equal!(client.code("MAIL FROM:<u@x.com>").await, 250);
        assert_equal!(client.code("RCPT TO:<r1@a.com>").await, 250);
        assert_equal!(
            client.command("DATA").await,
            (550, "5.1.1 no such user".to_string())
        );
        // The failed transaction is gone; a new one may start
        assert_equal!(client.code("RCPT TO:<r1@a.com>").await, 503);
        assert_equal!(client.code("MAIL FROM:<u@x.com>").await, 250);
        assert_equal!(client.code("QUIT").await, 221);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unavailable_backend_gets_451() {
        let routes = RoutingTable::new(btreemap! {
            "a.com".to_string() => MockBackend::refused_address().await,
        })
        .unwrap();
        let (mut client, handle) = start(routes, Duration::from_secs(5));
        client.reply().await;

        assert_equal!(client.code("HELO client").await, 250);
        assert_equal!(client.code("MAIL FROM:<u@x.com>").await, 250);
        assert_equal!(client.code("RCPT TO:<r1@a.com>").await, 250);
        assert_equal!(
            client.command("DATA").await,
            (451, "4.4.1 Backend server is not responding".to_string())
        );
        assert_equal!(client.code("QUIT").await, 221);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn idle_client_is_disconnected() {
        let a = MockBackend::start(Script::default()).await;
        let routes = RoutingTable::new(btreemap! {
            "a.com".to_string() => a.address(),
        })
        .unwrap();
        let (mut client, handle) = start(routes, Duration::from_millis(100));
        assert_equal!(client.reply().await.0, 220);
        assert_equal!(client.reply().await.0, 421);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn listener_stops_on_shutdown() {
        let a = MockBackend::start(Script::default()).await;
        let config = Config::parse(&format!(
            r#"{{
                "listen_address": "127.0.0.1:0",
                "host": "mx.example.com",
                "timeout_seconds": 5,
                "routes": {{"a.com": "{}"}}
            }}"#,
            a.address()
        ))
        .unwrap();
        let factory = RelayFactory::new(
            Arc::new(config.routes.clone()),
            RelayParams {
                hostname: config.host.clone(),
                timeouts: SmtpClientTimeouts::uniform(config.timeout()),
            },
        );
        let listener = SmtpListener::bind(&config, Arc::new(factory))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let mut life_cycle = LifeCycle::new();
        let handle = tokio::spawn(listener.run(life_cycle.subscribe()));

        let timeouts = SmtpClientTimeouts::uniform(Duration::from_secs(5));
        let mut client = SmtpClient::connect(&addr.to_string(), timeouts)
            .await
            .unwrap();
        let banner = client.read_banner().await.unwrap();
        assert_equal!(banner.content, "mx.example.com ESMTP smtpsplit");
        client.quit().await.unwrap();

        life_cycle.requester().request_shutdown();
        life_cycle.wait_for_shutdown().await.unwrap();
        handle.await.unwrap().unwrap();
        assert!(SmtpClient::connect(&addr.to_string(), timeouts).await.is_err());
    }

    #[test]
    fn size_parameter() {
        let param = |value: Option<&str>| EsmtpParameter {
            name: "size".to_string(),
            value: value.map(|s| s.to_string()),
        };
        assert_equal!(declared_size(&[]), Ok(None));
        assert_equal!(declared_size(&[param(Some("100"))]), Ok(Some(100)));
        assert!(declared_size(&[param(Some("-1"))]).is_err());
        assert!(declared_size(&[param(None)]).is_err());
    }
}
