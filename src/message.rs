use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{self, AsyncRead, AsyncReadExt};

use crate::MESSAGE_BUFFER_SIZE;

/// Frame tag: a control message follows.
pub const INCOMING_MESSAGE: u8 = 0x1;
/// Frame tag: raw stream bytes follow, owned by the application handler.
pub const INCOMING_STREAM: u8 = 0x2;

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An opaque control payload, decoded further by the file server.
    Message(Vec<u8>),
    /// A stream marker. Carries no body; the connection's read loop must
    /// hand the socket to the application until the stream completes.
    Stream,
}

/// A control message surfaced to the file server, stamped with the remote
/// address it arrived from. Stream markers never cross the consumer
/// channel; they are handled on the connection itself.
#[derive(Debug, Clone)]
pub struct Rpc {
    pub from: SocketAddr,
    pub payload: Vec<u8>,
}

/// Control message envelope exchanged between peers.
///
/// `key` is always the hashed form of the logical key, so the plaintext
/// key never crosses the wire. For a store announcement `size` counts the
/// IV plus ciphertext that will follow as a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    StoreFile { id: String, key: String, size: i64 },
    GetFile { id: String, key: String },
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Decodes one frame from `src`.
///
/// Reads a single tag byte; end of input before the tag decodes to
/// `Ok(None)` (a soft close). The stream marker has no body. Any other tag
/// is followed by a control payload read in one bounded chunk of at most
/// [`MESSAGE_BUFFER_SIZE`] bytes; there is no length prefix, so a larger
/// payload is silently truncated. End of input mid-frame is an error.
pub async fn decode_frame<R>(src: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut tag = [0u8; 1];
    if src.read(&mut tag).await? == 0 {
        return Ok(None);
    }

    if tag[0] == INCOMING_STREAM {
        return Ok(Some(Frame::Stream));
    }

    // Any tag other than the stream marker announces a control payload
    let mut buf = vec![0u8; MESSAGE_BUFFER_SIZE];
    let n = src.read(&mut buf).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-frame",
        ));
    }
    buf.truncate(n);

    Ok(Some(Frame::Message(buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_decode_stream_marker() {
        let frame = decode_frame(&mut &[INCOMING_STREAM][..]).await.unwrap();
        assert_eq!(frame, Some(Frame::Stream));
    }

    #[tokio::test]
    async fn test_decode_control_frame() {
        let frame = decode_frame(&mut &[INCOMING_MESSAGE, 0x41, 0x42][..])
            .await
            .unwrap();
        assert_eq!(frame, Some(Frame::Message(vec![0x41, 0x42])));
    }

    #[tokio::test]
    async fn test_decode_empty_input_is_soft_close() {
        let frame = decode_frame(&mut &[][..]).await.unwrap();
        assert_eq!(frame, None);
    }

    #[tokio::test]
    async fn test_decode_tag_without_payload_is_error() {
        let result = decode_frame(&mut &[INCOMING_MESSAGE][..]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_decode_payload_is_bounded() {
        let mut input = vec![INCOMING_MESSAGE];
        input.extend(std::iter::repeat(0xAB).take(MESSAGE_BUFFER_SIZE + 500));

        let frame = decode_frame(&mut &input[..]).await.unwrap();
        match frame {
            Some(Frame::Message(payload)) => assert_eq!(payload.len(), MESSAGE_BUFFER_SIZE),
            other => panic!("expected control frame, got {:?}", other),
        }
    }

    #[test]
    fn test_message_roundtrip() {
        let store = Message::StoreFile {
            id: "a".repeat(64),
            key: "b".repeat(32),
            size: 38,
        };
        let get = Message::GetFile {
            id: "a".repeat(64),
            key: "b".repeat(32),
        };

        for msg in [store, get] {
            let encoded = msg.encode().unwrap();
            assert_eq!(Message::decode(&encoded).unwrap(), msg);
        }
    }

    #[test]
    fn test_encoded_message_fits_one_frame() {
        // Realistic ids (64 hex) and hashed keys (32 hex) must stay well
        // under the single-read payload bound
        let msg = Message::StoreFile {
            id: "f".repeat(64),
            key: "0".repeat(32),
            size: i64::MAX,
        };
        assert!(msg.encode().unwrap().len() < MESSAGE_BUFFER_SIZE);
    }
}
