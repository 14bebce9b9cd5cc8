//! The `Socket` trait and the plain TCP/UDS/TLS transports that implement
//! it. Grounded on `sqlx-core::net::mod.rs`'s `Socket`/`connect_tcp`/
//! `connect_uds` re-exports.

use std::io;
use std::path::Path;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

/// Any duplex byte stream a [`super::buffered::BufferedSocket`] can drive:
/// plain TCP, a Unix domain socket, or either wrapped in TLS.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Socket for T {}

pub type BoxSocket = Pin<Box<dyn Socket>>;

pub async fn connect_tcp(host: &str, port: u16) -> io::Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub async fn connect_uds(path: impl AsRef<Path>) -> io::Result<UnixStream> {
    UnixStream::connect(path).await
}

/// Upgrade an established TCP/UDS stream to TLS, as the reply to an
/// affirmative `SSLRequest`. A failure here (certificate rejection, a peer
/// that isn't actually speaking TLS, ...) is treated the same as a failed
/// plain connect: the socket is simply dropped, no protocol-level
/// `Terminate` is attempted, since no startup session exists yet.
#[cfg(feature = "tls-native-tls")]
pub async fn upgrade_tls<S>(
    stream: S,
    domain: &str,
    accept_invalid_certs: bool,
    accept_invalid_hostnames: bool,
) -> Result<tokio_native_tls::TlsStream<S>, crate::error::ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut builder = native_tls::TlsConnector::builder();
    builder.danger_accept_invalid_certs(accept_invalid_certs);
    builder.danger_accept_invalid_hostnames(accept_invalid_hostnames);

    let connector: tokio_native_tls::TlsConnector = builder
        .build()
        .map_err(|e| crate::error::ConnectError::Tls(e.to_string()))?
        .into();

    connector
        .connect(domain, stream)
        .await
        .map_err(|e| crate::error::ConnectError::Tls(e.to_string()))
}
