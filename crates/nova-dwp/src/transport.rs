use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::{tcp, TcpStream, ToSocketAddrs};

use crate::codec::{validate_packet_length, Packet, PacketHeader, HEADER_LEN};
use crate::error::{DwpError, Result};

/// An ordered, reliable byte stream that can be split into independently
/// owned read and write halves.
///
/// The read half is moved into the connection's receive task; the write half
/// is shared by every sender behind a lock.
pub trait Transport: Send + 'static {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    fn into_split(self) -> (Self::Reader, Self::Writer);
}

impl Transport for TcpStream {
    type Reader = tcp::OwnedReadHalf;
    type Writer = tcp::OwnedWriteHalf;

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        TcpStream::into_split(self)
    }
}

impl Transport for DuplexStream {
    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self)
    }
}

/// Pair of already separated halves.
pub struct Split<R, W> {
    pub reader: R,
    pub writer: W,
}

impl<R, W> Transport for Split<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    type Reader = R;
    type Writer = W;

    fn into_split(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            nodelay: true,
        }
    }
}

pub async fn connect_tcp(addr: impl ToSocketAddrs, config: &TcpConfig) -> Result<TcpStream> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| DwpError::Timeout)??;
    if config.nodelay {
        if let Err(err) = stream.set_nodelay(true) {
            tracing::warn!(target: "nova.dwp", error = %err, "failed to set TCP_NODELAY");
        }
    }
    Ok(stream)
}

/// Fill `buf` completely.
///
/// Returns `Ok(false)` if the stream ended before the first byte (orderly
/// close); an end-of-stream after a partial read is an error.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream closed after {filled} of {} bytes", buf.len()),
            ));
        }
        filled += n;
    }
    Ok(true)
}

/// Read one whole packet. `Ok(None)` means the peer closed the stream
/// between packets.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_packet_bytes: usize,
) -> Result<Option<Packet>> {
    let mut header = [0u8; HEADER_LEN];
    if !read_full(reader, &mut header).await? {
        return Ok(None);
    }
    let header = PacketHeader::decode(&header);
    validate_packet_length(header.length as usize, max_packet_bytes)?;

    let mut payload = Vec::new();
    payload
        .try_reserve_exact(header.payload_len())
        .map_err(|_| {
            DwpError::Protocol(format!(
                "unable to allocate packet buffer ({} bytes)",
                header.payload_len()
            ))
        })?;
    payload.resize(header.payload_len(), 0);
    if !payload.is_empty() && !read_full(reader, &mut payload).await? {
        return Err(DwpError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed after packet header",
        )));
    }
    Ok(Some(Packet::from_parts(header, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_command, encode_reply};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_packets_until_orderly_close() {
        let (mut client, mut server) = tokio::io::duplex(256);
        server.write_all(&encode_reply(7, 0, &[1, 2, 3])).await.unwrap();
        server.write_all(&encode_command(8, 64, 100, &[])).await.unwrap();
        drop(server);

        let first = read_packet(&mut client, 1024).await.unwrap().unwrap();
        assert_eq!(
            first,
            Packet::Reply {
                id: 7,
                error_code: 0,
                payload: vec![1, 2, 3]
            }
        );
        let second = read_packet(&mut client, 1024).await.unwrap().unwrap();
        assert_eq!(second.id(), 8);
        assert!(read_packet(&mut client, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_packet_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let packet = encode_reply(1, 0, &[0; 8]);
        server.write_all(&packet[..packet.len() - 2]).await.unwrap();
        drop(server);

        let err = read_packet(&mut client, 1024).await.unwrap_err();
        assert!(matches!(err, DwpError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let mut header = encode_reply(1, 0, &[]);
        header[0..4].copy_from_slice(&(1024u32 * 1024).to_be_bytes());
        server.write_all(&header).await.unwrap();

        let err = read_packet(&mut client, 4096).await.unwrap_err();
        assert!(matches!(err, DwpError::Protocol(msg) if msg.contains("exceeds maximum")));
    }
}
