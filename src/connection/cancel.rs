//! Query cancellation (C4 "cancellation of an in-flight query"): opens a
//! fresh connection to the exact backend address and sends the 16-byte
//! `CancelRequest`.
//!
//! Grounded on spec.md §4.4/§6's `CancelRequest` contract directly --
//! `sqlx-postgres::connection::establish.rs`'s dial/TLS-negotiation style is
//! reused for opening the throwaway socket.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::ConnectError;
use crate::message::CancelRequest as CancelRequestMessage;
use crate::net::{self, BoxSocket};

/// Sends `CancelRequest` on a brand-new connection to `host:port`, then
/// reads until EOF and closes. Per spec.md §4.4, a successful return does
/// not guarantee the target query was actually canceled -- that is
/// inherent to the protocol, which gives no acknowledgement.
pub async fn send_cancel_request(
    host: &str,
    port: u16,
    process_id: u32,
    secret_key: u32,
) -> Result<(), ConnectError> {
    let mut socket: BoxSocket = Box::pin(net::connect_tcp(host, port).await.map_err(|source| {
        ConnectError::Io {
            host: host.to_string(),
            port,
            source,
        }
    })?);

    let mut buf = Vec::new();
    CancelRequestMessage {
        process_id,
        secret_key,
    }
    .encode(&mut buf);

    socket
        .write_all(&buf)
        .await
        .map_err(|source| ConnectError::Io { host: host.to_string(), port, source })?;
    socket
        .flush()
        .await
        .map_err(|source| ConnectError::Io { host: host.to_string(), port, source })?;

    // The server closes the connection without replying; draining to EOF
    // (rather than just dropping the socket) gives it the chance to process
    // the request before the FIN races it.
    let mut discard = [0u8; 64];
    loop {
        match socket.read(&mut discard).await {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn sends_cancel_request_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        send_cancel_request(&addr.ip().to_string(), addr.port(), 42, 99)
            .await
            .unwrap();

        let received = server.await.unwrap();
        let len = u32::from_be_bytes(received[0..4].try_into().unwrap());
        let code = u32::from_be_bytes(received[4..8].try_into().unwrap());
        let pid = u32::from_be_bytes(received[8..12].try_into().unwrap());
        let secret = u32::from_be_bytes(received[12..16].try_into().unwrap());
        assert_eq!(len, 16);
        assert_eq!(code, crate::message::CANCEL_REQUEST_CODE);
        assert_eq!(pid, 42);
        assert_eq!(secret, 99);
    }
}
