//! Length-prefixed protobuf framing.
//!
//! Wire format: one magic byte, four little-endian length bytes, then the
//! protobuf payload. Oversize frames and bad magic are protocol violations;
//! the violation response carries the fixed message id `0x0BADC0DE` and the
//! connection closes after it is written.

use crate::proto::{request, Envelope, Response, Status};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// First byte of every frame.
pub const FRAME_MAGIC: u8 = 0x0B;

/// Maximum frame payload (1 MiB). The length prefix may not exceed this.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Message id of a protocol-violation response.
pub const PROTOCOL_VIOLATION_ID: u32 = 0x0BAD_C0DE;

/// Frame header: magic byte plus 4 length bytes.
const FRAME_HEADER_LEN: usize = 5;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("bad frame magic 0x{0:02X}")]
    BadMagic(u8),
    #[error("frame payload of {0} bytes exceeds the 1 MiB limit")]
    Oversize(usize),
    #[error("malformed protobuf payload: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Io(std::io::Error),
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Closed
        } else {
            FrameError::Io(e)
        }
    }
}

impl FrameError {
    /// Framing faults caused by the peer, as opposed to transport failures.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, FrameError::BadMagic(_) | FrameError::Oversize(_) | FrameError::Decode(_))
    }
}

/// Read one frame payload. Buffers the header, validates magic and size,
/// then buffers exactly the declared payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    if header[0] != FRAME_MAGIC {
        return Err(FrameError::BadMagic(header[0]));
    }

    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(FrameError::Oversize(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(payload.len() <= MAX_FRAME_PAYLOAD);
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(FRAME_MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_envelope<R>(reader: &mut R) -> Result<Envelope, FrameError>
where
    R: AsyncRead + Unpin,
{
    let payload = read_frame(reader).await?;
    Ok(Envelope::decode(payload.as_slice())?)
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &envelope.encode_to_vec()).await
}

/// Builds outgoing envelopes for one connection.
///
/// Responses echo the id of the request they answer. Server-initiated
/// requests draw from this builder's own monotonically increasing id space,
/// so they can never collide with ids the peer chose.
#[derive(Debug)]
pub struct MessageBuilder {
    next_server_request_id: u32,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self { next_server_request_id: 1 }
    }

    pub fn response_to(id: u32, response: Response) -> Envelope {
        Envelope::response(id, response)
    }

    pub fn server_request(&mut self, content: request::Content) -> Envelope {
        let id = self.next_server_request_id;
        self.next_server_request_id = self.next_server_request_id.wrapping_add(1);
        Envelope::server_request(id, content)
    }

    /// Terminal response for a malformed frame.
    pub fn protocol_violation(details: impl Into<String>) -> Envelope {
        Envelope::response(
            PROTOCOL_VIOLATION_ID,
            Response::error(Status::ErrorProtocolViolation, details),
        )
    }
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::PingRequest;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let env = Envelope::request(
            42,
            request::Content::Ping(PingRequest { payload: b"ping".to_vec() }),
        );
        write_envelope(&mut client, &env).await.unwrap();

        let back = read_envelope(&mut server).await.unwrap();
        assert_eq!(back, env);
    }

    #[tokio::test]
    async fn bad_magic_is_a_violation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0xFF, 0, 0, 0, 0]).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, FrameError::BadMagic(0xFF)));
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn oversize_is_a_violation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_PAYLOAD as u32 + 1).to_le_bytes();
        client.write_all(&[FRAME_MAGIC]).await.unwrap();
        client.write_all(&len).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, FrameError::Oversize(_)));
    }

    #[tokio::test]
    async fn closed_connection_is_not_a_violation() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, FrameError::Closed));
        assert!(!err.is_protocol_violation());
    }

    #[test]
    fn server_request_ids_increase() {
        let mut builder = MessageBuilder::new();
        let a = builder.server_request(request::Content::Ping(PingRequest::default()));
        let b = builder.server_request(request::Content::Ping(PingRequest::default()));
        assert!(b.id > a.id);
    }

    #[test]
    fn violation_uses_the_fixed_id() {
        let env = MessageBuilder::protocol_violation("bad magic");
        assert_eq!(env.id, PROTOCOL_VIOLATION_ID);
    }
}
