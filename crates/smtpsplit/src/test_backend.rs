//! A scripted SMTP server used to stand in for relay backends in tests.
//! Every accepted connection gets a `Transcript` recording what the
//! relay sent to it.
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Reply line sent to every RCPT TO instead of 250
    pub reject_rcpt: Option<&'static str>,
    /// Reply line sent after the dot terminator instead of 250
    pub reject_data_dot: Option<&'static str>,
    /// Accept the connection but never say anything
    pub silent: bool,
    /// Wait this long after accepting before sending the banner
    pub banner_delay: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    pub helo: Option<String>,
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
    pub data_started: bool,
    /// Body lines exactly as they appeared on the wire
    pub data: Vec<Vec<u8>>,
    pub completed: bool,
    pub quit: bool,
}

impl Transcript {
    /// The message content after undoing dot-stuffing
    pub fn body(&self) -> Vec<u8> {
        let mut body = vec![];
        for line in &self.data {
            match line.strip_prefix(b".") {
                Some(rest) => body.extend_from_slice(rest),
                None => body.extend_from_slice(line),
            }
        }
        body
    }
}

pub struct MockBackend {
    addr: SocketAddr,
    transcripts: Arc<Mutex<Vec<Transcript>>>,
}

impl MockBackend {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let transcripts = Arc::new(Mutex::new(vec![]));

        let shared = transcripts.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _peer)) = listener.accept().await else {
                    return;
                };
                let idx = {
                    let mut transcripts = shared.lock().unwrap();
                    transcripts.push(Transcript::default());
                    transcripts.len() - 1
                };
                let shared = shared.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    serve(socket, script, shared, idx).await.ok();
                });
            }
        });

        Self { addr, transcripts }
    }

    /// An address that refuses connections
    pub async fn refused_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn transcripts(&self) -> Vec<Transcript> {
        self.transcripts.lock().unwrap().clone()
    }
}

async fn serve(
    socket: TcpStream,
    script: Script,
    transcripts: Arc<Mutex<Vec<Transcript>>>,
    idx: usize,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(socket);

    if let Some(delay) = script.banner_delay {
        tokio::time::sleep(delay).await;
    }

    if script.silent {
        // Hold the connection open until the client goes away
        let mut line = vec![];
        while reader.read_until(b'\n', &mut line).await? > 0 {
            line.clear();
        }
        return Ok(());
    }

    let record = |f: &dyn Fn(&mut Transcript)| {
        let mut transcripts = transcripts.lock().unwrap();
        f(&mut transcripts[idx]);
    };

    reader
        .get_mut()
        .write_all(b"220-mock.example.com ESMTP\r\n220 ready\r\n")
        .await?;

    loop {
        let mut line = vec![];
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&line).trim_end().to_string();
        let verb = text.to_ascii_uppercase();

        let reply: &str = if verb.starts_with("HELO") || verb.starts_with("EHLO") {
            record(&|t| t.helo = Some(text.clone()));
            "250-mock.example.com greets you\r\n250 HELP\r\n"
        } else if verb.starts_with("MAIL FROM:") {
            record(&|t| t.mail_from = Some(text.clone()));
            "250 2.1.0 sender ok\r\n"
        } else if verb.starts_with("RCPT TO:") {
            record(&|t| t.rcpt_to.push(text.clone()));
            match script.reject_rcpt {
                Some(reply) => reply,
                None => "250 2.1.5 recipient ok\r\n",
            }
        } else if verb == "DATA" {
            record(&|t| t.data_started = true);
            reader
                .get_mut()
                .write_all(b"354 end with <CRLF>.<CRLF>\r\n")
                .await?;
            loop {
                let mut line = vec![];
                if reader.read_until(b'\n', &mut line).await? == 0 {
                    return Ok(());
                }
                if line == b".\r\n" {
                    break;
                }
                record(&|t| t.data.push(line.clone()));
            }
            match script.reject_data_dot {
                Some(reply) => reply,
                None => {
                    record(&|t| t.completed = true);
                    "250 2.0.0 queued\r\n"
                }
            }
        } else if verb == "QUIT" {
            record(&|t| t.quit = true);
            reader.get_mut().write_all(b"221 bye\r\n").await?;
            return Ok(());
        } else {
            "502 unrecognized\r\n"
        };

        reader.get_mut().write_all(reply.as_bytes()).await?;
    }
}
