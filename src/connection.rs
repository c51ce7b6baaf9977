// ABOUTME: Provides framed TCP I/O for the render farm protocol
// ABOUTME: Buffers reads to reassemble length-prefixed JSON headers and raw payloads

use crate::protocol::{LENGTH_PREFIX, MAX_HEADER_SIZE, ProtocolError};
use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Framed connection over a `TcpStream`.
///
/// Reads are buffered in a `BytesMut` so that a header fragmented by the
/// socket layer is reassembled transparently; the loop keeps pulling bytes
/// until a whole length-prefixed JSON object is available. Writes go
/// through a `BufWriter` and are flushed once per logical message so a
/// header and its payload leave as one burst of syscalls.
#[derive(Debug)]
pub struct Connection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
}

impl Connection {
    /// Create a new `Connection`, backed by `socket`.
    pub fn new(socket: TcpStream) -> Connection {
        Connection {
            stream: BufWriter::new(socket),
            // Headers are small; payloads grow the buffer on demand.
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Read one length-prefixed JSON header from the stream.
    ///
    /// Returns `Ok(None)` when the peer closes the connection cleanly
    /// between messages. A close in the middle of a message is an error.
    pub async fn read_header<T: DeserializeOwned>(&mut self) -> crate::Result<Option<T>> {
        read_header(self.stream.get_mut(), &mut self.buffer).await
    }

    /// Read exactly `len` raw payload bytes following a header.
    pub async fn read_payload(&mut self, len: u64) -> crate::Result<Bytes> {
        read_payload(self.stream.get_mut(), &mut self.buffer, len).await
    }

    /// Write a single length-prefixed JSON header.
    pub async fn write_header<T: Serialize>(&mut self, message: &T) -> crate::Result<()> {
        write_header(&mut self.stream, message).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write a header immediately followed by its raw payload, flushed as
    /// one message.
    pub async fn write_message<T: Serialize>(
        &mut self,
        message: &T,
        payload: &[u8],
    ) -> crate::Result<()> {
        write_header(&mut self.stream, message).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Split into independently owned read and write halves.
    ///
    /// The server needs this for the client socket: one task reads requests
    /// while several workers share the write half behind a lock.
    pub fn into_split(self) -> (ReadConnection, WriteConnection) {
        let (read, write) = self.stream.into_inner().into_split();
        (
            ReadConnection { stream: read, buffer: self.buffer },
            WriteConnection { stream: BufWriter::new(write) },
        )
    }
}

/// Read half of a split [`Connection`]. Carries the read buffer with it so
/// no buffered bytes are lost across the split.
#[derive(Debug)]
pub struct ReadConnection {
    stream: OwnedReadHalf,
    buffer: BytesMut,
}

impl ReadConnection {
    pub async fn read_header<T: DeserializeOwned>(&mut self) -> crate::Result<Option<T>> {
        read_header(&mut self.stream, &mut self.buffer).await
    }

    pub async fn read_payload(&mut self, len: u64) -> crate::Result<Bytes> {
        read_payload(&mut self.stream, &mut self.buffer, len).await
    }
}

/// Write half of a split [`Connection`].
#[derive(Debug)]
pub struct WriteConnection {
    stream: BufWriter<OwnedWriteHalf>,
}

impl WriteConnection {
    pub async fn write_header<T: Serialize>(&mut self, message: &T) -> crate::Result<()> {
        write_header(&mut self.stream, message).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn write_message<T: Serialize>(
        &mut self,
        message: &T,
        payload: &[u8],
    ) -> crate::Result<()> {
        write_header(&mut self.stream, message).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut down the write direction, signalling the peer that nothing
    /// further is coming.
    pub async fn shutdown(&mut self) -> crate::Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

async fn read_header<S, T>(stream: &mut S, buffer: &mut BytesMut) -> crate::Result<Option<T>>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    loop {
        if let Some(header) = parse_header(buffer)? {
            return Ok(Some(header));
        }

        // Not enough buffered data for a whole header yet. `0` from the
        // socket means the peer closed; that is only a clean shutdown when
        // it falls on a message boundary.
        if 0 == stream.read_buf(buffer).await? {
            return buffer
                .is_empty()
                .then_some(None)
                .ok_or_else(|| "connection reset by peer".into());
        }
    }
}

/// Try to parse one header out of `buffer`. Returns `Ok(None)` while the
/// buffered data is still shorter than the prefix announces.
fn parse_header<T: DeserializeOwned>(buffer: &mut BytesMut) -> crate::Result<Option<T>> {
    if buffer.len() < LENGTH_PREFIX {
        return Ok(None);
    }

    let mut prefix = [0u8; LENGTH_PREFIX];
    prefix.copy_from_slice(&buffer[..LENGTH_PREFIX]);
    let announced = u64::from_be_bytes(prefix);
    if announced > MAX_HEADER_SIZE {
        return Err(ProtocolError::OversizedHeader(announced).into());
    }

    let len = announced as usize;
    if buffer.len() < LENGTH_PREFIX + len {
        return Ok(None);
    }

    buffer.advance(LENGTH_PREFIX);
    let header = serde_json::from_slice(&buffer[..len])?;
    buffer.advance(len);
    Ok(Some(header))
}

async fn read_payload<S>(stream: &mut S, buffer: &mut BytesMut, len: u64) -> crate::Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let len = usize::try_from(len)?;
    while buffer.len() < len {
        if 0 == stream.read_buf(buffer).await? {
            return Err("connection reset by peer".into());
        }
    }
    Ok(buffer.split_to(len).freeze())
}

async fn write_header<S, T>(stream: &mut S, message: &T) -> crate::Result<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let header = serde_json::to_vec(message)?;
    stream.write_all(&(header.len() as u64).to_be_bytes()).await?;
    stream.write_all(&header).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Reply, Request, UploadRequest};

    fn framed(message: &impl Serialize) -> Vec<u8> {
        let header = serde_json::to_vec(message).unwrap();
        let mut bytes = (header.len() as u64).to_be_bytes().to_vec();
        bytes.extend_from_slice(&header);
        bytes
    }

    #[test]
    fn parse_header_waits_for_prefix() {
        let mut buffer = BytesMut::from(&[0u8, 0, 0][..]);
        let parsed: Option<Reply> = parse_header(&mut buffer).unwrap();
        assert!(parsed.is_none());
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn parse_header_waits_for_body() {
        let bytes = framed(&Reply::Okay);
        let mut buffer = BytesMut::from(&bytes[..bytes.len() - 1]);
        let parsed: Option<Reply> = parse_header(&mut buffer).unwrap();
        assert!(parsed.is_none());

        buffer.extend_from_slice(&bytes[bytes.len() - 1..]);
        let parsed: Option<Reply> = parse_header(&mut buffer).unwrap();
        assert_eq!(parsed, Some(Reply::Okay));
        assert!(buffer.is_empty());
    }

    #[test]
    fn parse_header_leaves_following_bytes() {
        let mut bytes = framed(&Reply::Okay);
        bytes.extend_from_slice(b"payload");
        let mut buffer = BytesMut::from(&bytes[..]);

        let parsed: Option<Reply> = parse_header(&mut buffer).unwrap();
        assert_eq!(parsed, Some(Reply::Okay));
        assert_eq!(&buffer[..], b"payload");
    }

    #[test]
    fn parse_header_rejects_oversized_prefix() {
        let mut bytes = (MAX_HEADER_SIZE + 1).to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        let mut buffer = BytesMut::from(&bytes[..]);

        let result: crate::Result<Option<Reply>> = parse_header(&mut buffer);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn round_trip_survives_fragmented_writes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let request = Request::Upload(UploadRequest { session: "scene1".to_string(), size: 5 });
        let mut bytes = framed(&request);
        bytes.extend_from_slice(b"hello");

        // Dribble the message one byte at a time so the reader has to
        // reassemble it across many partial reads.
        let writer = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            for byte in bytes {
                stream.write_all(&[byte]).await.unwrap();
                stream.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let (socket, _) = listener.accept().await.unwrap();
        let mut connection = Connection::new(socket);
        let received: Request = connection.read_header().await.unwrap().unwrap();
        assert_eq!(received, request);
        let payload = connection.read_payload(5).await.unwrap();
        assert_eq!(&payload[..], b"hello");

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(&framed(&Reply::Okay)).await.unwrap();
            // Dropping the stream closes it on a message boundary.
        });

        let (socket, _) = listener.accept().await.unwrap();
        let mut connection = Connection::new(socket);
        let first: Option<Reply> = connection.read_header().await.unwrap();
        assert_eq!(first, Some(Reply::Okay));
        let second: Option<Reply> = connection.read_header().await.unwrap();
        assert!(second.is_none());

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn close_mid_message_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            let bytes = framed(&Reply::Okay);
            stream.write_all(&bytes[..bytes.len() - 2]).await.unwrap();
        });

        let (socket, _) = listener.accept().await.unwrap();
        let mut connection = Connection::new(socket);
        let result: crate::Result<Option<Reply>> = connection.read_header().await;
        assert!(result.is_err());

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn split_halves_share_the_buffer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(&framed(&Reply::Okay)).await.unwrap();
            stream.write_all(&framed(&Reply::Okay)).await.unwrap();
            let mut connection = Connection::new(stream);
            let echoed: Option<Reply> = connection.read_header().await.unwrap();
            assert_eq!(echoed, Some(Reply::Okay));
        });

        let (socket, _) = listener.accept().await.unwrap();
        let mut connection = Connection::new(socket);
        // Buffer both messages, consume one, then split; the second must
        // still come out of the read half.
        let first: Option<Reply> = connection.read_header().await.unwrap();
        assert_eq!(first, Some(Reply::Okay));

        let (mut read, mut write) = connection.into_split();
        let second: Option<Reply> = read.read_header().await.unwrap();
        assert_eq!(second, Some(Reply::Okay));
        write.write_header(&Reply::Okay).await.unwrap();

        peer.await.unwrap();
    }
}
