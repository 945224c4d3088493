//! Transport layer: TCP and Unix-socket streams wrapped in mutual TLS.
//!
//! Both transports surface the same interface: an authenticated byte
//! stream plus access to the peer certificate chain. Servers accept and
//! wrap incoming connections; clients dial and wrap outgoing ones.

use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::config::{Config, TransportKind};
use crate::error::{Result, SsntpError};
use crate::tls;

/// Server name used for TLS verification over local sockets, where no DNS
/// name is being dialed.
const LOCAL_SERVER_NAME: &str = "localhost";

/// A bound, not yet TLS-wrapped listener.
pub(crate) enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// An accepted or dialed stream, before the TLS handshake.
pub(crate) enum RawStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Listener {
    /// Bind according to the endpoint configuration. An empty URI means
    /// all interfaces for TCP; for Unix sockets the URI is the socket path
    /// and any stale socket file is removed first.
    pub(crate) async fn bind(config: &Config) -> Result<Listener> {
        match config.transport {
            TransportKind::Tcp => {
                let host = if config.uri.is_empty() {
                    "0.0.0.0"
                } else {
                    config.uri.as_str()
                };
                let listener = TcpListener::bind((host, config.port)).await?;
                Ok(Listener::Tcp(listener))
            }
            TransportKind::UnixSocket => {
                let path = Path::new(&config.uri);
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                Ok(Listener::Unix(listener))
            }
        }
    }

    /// The bound TCP address, if this is a TCP listener.
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }

    /// Accept one raw connection.
    pub(crate) async fn accept(&self) -> Result<RawStream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok(RawStream::Tcp(stream))
            }
            Listener::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok(RawStream::Unix(stream))
            }
        }
    }
}

/// Dial the configured server, without TLS.
pub(crate) async fn dial(config: &Config) -> Result<RawStream> {
    match config.transport {
        TransportKind::Tcp => {
            let stream = TcpStream::connect((config.uri.as_str(), config.port)).await?;
            Ok(RawStream::Tcp(stream))
        }
        TransportKind::UnixSocket => {
            let stream = UnixStream::connect(&config.uri).await?;
            Ok(RawStream::Unix(stream))
        }
    }
}

/// Build the TLS acceptor once at server startup; it is cloned into every
/// per-connection task.
pub(crate) fn acceptor(config: &Config) -> Result<TlsAcceptor> {
    let tls_config = tls::server_config(config)?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Complete the server-side TLS handshake over a raw stream.
pub(crate) async fn accept_tls(acceptor: &TlsAcceptor, raw: RawStream) -> Result<ServerStream> {
    match raw {
        RawStream::Tcp(stream) => Ok(ServerStream::Tcp(acceptor.accept(stream).await?)),
        RawStream::Unix(stream) => Ok(ServerStream::Unix(acceptor.accept(stream).await?)),
    }
}

/// Complete the client-side TLS handshake over a raw stream.
pub(crate) async fn connect_tls(config: &Config, raw: RawStream) -> Result<ClientStream> {
    let tls_config = tls::client_config(config)?;
    let connector = TlsConnector::from(Arc::new(tls_config));

    let host = match config.transport {
        TransportKind::Tcp if !config.uri.is_empty() => config.uri.clone(),
        _ => String::from(LOCAL_SERVER_NAME),
    };
    let server_name = ServerName::try_from(host)
        .map_err(|e| SsntpError::CertificateInvalid(format!("server name: {}", e)))?;

    match raw {
        RawStream::Tcp(stream) => Ok(ClientStream::Tcp(
            connector.connect(server_name, stream).await?,
        )),
        RawStream::Unix(stream) => Ok(ClientStream::Unix(
            connector.connect(server_name, stream).await?,
        )),
    }
}

macro_rules! tls_stream {
    ($name:ident, $tls:ident) => {
        /// An authenticated SSNTP transport stream.
        pub enum $name {
            /// TLS over TCP.
            Tcp($tls::TlsStream<TcpStream>),
            /// TLS over a Unix domain socket.
            Unix($tls::TlsStream<UnixStream>),
        }

        impl $name {
            /// The peer's certificate chain, leaf first.
            pub fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
                match self {
                    $name::Tcp(stream) => {
                        stream.get_ref().1.peer_certificates().map(|c| c.to_vec())
                    }
                    $name::Unix(stream) => {
                        stream.get_ref().1.peer_certificates().map(|c| c.to_vec())
                    }
                }
            }
        }

        impl AsyncRead for $name {
            fn poll_read(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<std::io::Result<()>> {
                match self.get_mut() {
                    $name::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
                    $name::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
                }
            }
        }

        impl AsyncWrite for $name {
            fn poll_write(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &[u8],
            ) -> Poll<std::io::Result<usize>> {
                match self.get_mut() {
                    $name::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
                    $name::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
                }
            }

            fn poll_flush(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
            ) -> Poll<std::io::Result<()>> {
                match self.get_mut() {
                    $name::Tcp(stream) => Pin::new(stream).poll_flush(cx),
                    $name::Unix(stream) => Pin::new(stream).poll_flush(cx),
                }
            }

            fn poll_shutdown(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
            ) -> Poll<std::io::Result<()>> {
                match self.get_mut() {
                    $name::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
                    $name::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
                }
            }
        }
    };
}

tls_stream!(ServerStream, server);
tls_stream!(ClientStream, client);
