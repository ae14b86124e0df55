//! DNS-over-UDP hijack
//!
//! Each UDP datagram to port 53 becomes one DNS-over-TCP exchange across
//! the tunnel: the query is framed with a 2-byte big-endian length
//! prefix, written to a tunneled stream to the query's original
//! destination, and the framed response is returned to the client as a
//! single datagram. No caching, no retries.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest response body accepted from the remote resolver
const MAX_DNS_RESPONSE: usize = u16::MAX as usize;

/// Frame a UDP DNS query for transport over TCP.
pub fn frame_query(query: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(2 + query.len());
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(query);
    framed
}

/// Perform one framed query/response round-trip over `stream`.
pub async fn roundtrip<S>(mut stream: S, query: &[u8]) -> io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if query.len() > MAX_DNS_RESPONSE {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "DNS query too large"));
    }

    stream.write_all(&frame_query(query)).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_prefixes_big_endian_length() {
        let framed = frame_query(&[0xAB; 300]);
        assert_eq!(&framed[..2], &300u16.to_be_bytes());
        assert_eq!(framed.len(), 302);
    }

    #[tokio::test]
    async fn roundtrip_preserves_transaction_id() {
        // Minimal DNS query: transaction id 0x1234 followed by header.
        let query: Vec<u8> = vec![0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

        let (client, mut server) = tokio::io::duplex(4096);

        let query_clone = query.clone();
        let server_task = tokio::spawn(async move {
            let mut len_buf = [0u8; 2];
            server.read_exact(&mut len_buf).await.unwrap();
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut q = vec![0u8; len];
            server.read_exact(&mut q).await.unwrap();
            assert_eq!(q, query_clone);

            // Echo a response carrying the same transaction id.
            let mut resp = q.clone();
            resp[2] = 0x81; // QR bit set
            server
                .write_all(&frame_query(&resp))
                .await
                .unwrap();
        });

        let resp = roundtrip(client, &query).await.unwrap();
        server_task.await.unwrap();

        // Transaction id survives end-to-end.
        assert_eq!(&resp[..2], &query[..2]);
        assert_eq!(resp.len(), query.len());
    }

    #[tokio::test]
    async fn oversized_query_is_rejected() {
        let (client, _server) = tokio::io::duplex(16);
        let huge = vec![0u8; MAX_DNS_RESPONSE + 1];
        assert!(roundtrip(client, &huge).await.is_err());
    }
}
