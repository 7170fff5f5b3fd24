use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncWrite, BufStream, DuplexStream};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream as TlsServerStream;

pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Debug + Unpin + Send {}
impl AsyncReadAndWrite for TcpStream {}
impl AsyncReadAndWrite for BufStream<TcpStream> {}
impl AsyncReadAndWrite for DuplexStream {}
impl AsyncReadAndWrite for TlsServerStream<TcpStream> {}
impl AsyncReadAndWrite for TlsServerStream<BoxedAsyncReadAndWrite> {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;
