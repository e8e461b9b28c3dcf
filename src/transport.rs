//! Uniform transport over TCP, Unix-domain sockets, and TLS (C2).
//!
//! The connection actor only ever calls `read_buf`/`write_all`/`shutdown`
//! on a [`Transport`]; it never sees which concrete socket kind is in use.

use crate::error::{Error, Result};
use bytes::BytesMut;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;

/// Where to connect. Unix sockets carry no TLS option; `tls` on [`Endpoint::Tcp`]
/// is the one switch between plain TCP and TLS-wrapped TCP.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

/// Pass-through TLS configuration. The concrete TLS library choice is out of
/// scope for the protocol design; this crate wires `tokio-rustls` as one real
/// implementation behind the abstraction.
#[derive(Clone)]
pub struct TlsOptions {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    pub async fn connect(
        endpoint: &Endpoint,
        tls: Option<&TlsOptions>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let tcp = timeout(connect_timeout, TcpStream::connect((host.as_str(), *port)))
                    .await
                    .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")))??;
                tcp.set_nodelay(true)?;

                match tls {
                    Some(opts) => {
                        let stream = opts
                            .connector
                            .connect(opts.server_name.clone(), tcp)
                            .await
                            .map_err(|e| Error::Tls(e.to_string()))?;
                        Ok(Transport::Tls(Box::new(stream)))
                    }
                    None => Ok(Transport::Tcp(tcp)),
                }
            }
            Endpoint::Unix { path } => {
                let sock = timeout(connect_timeout, UnixStream::connect(path))
                    .await
                    .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")))??;
                Ok(Transport::Unix(sock))
            }
        }
    }

    /// Read whatever is available into `buf`. Returns `0` on clean EOF.
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let n = match self {
            Transport::Tcp(s) => s.read_buf(buf).await?,
            Transport::Unix(s) => s.read_buf(buf).await?,
            Transport::Tls(s) => s.read_buf(buf).await?,
        };
        Ok(n)
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Transport::Tcp(s) => s.write_all(bytes).await?,
            Transport::Unix(s) => s.write_all(bytes).await?,
            Transport::Tls(s) => s.write_all(bytes).await?,
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Transport::Tcp(s) => s.shutdown().await?,
            Transport::Unix(s) => s.shutdown().await?,
            Transport::Tls(s) => s.shutdown().await?,
        }
        Ok(())
    }
}
