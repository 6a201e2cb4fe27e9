//! Framing: one JSON value per message, terminated by `\n`. Discovery uses one JSON object per datagram.

use crate::protocol::{DiscoveryMessage, Message};

const DELIMITER: u8 = b'\n';
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024; // 16 MiB
/// Receive buffer for one discovery datagram.
pub const MAX_DATAGRAM_LEN: usize = 4096;

/// Encode a message into a single frame: compact JSON followed by a newline.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = serde_json::to_vec(msg).map_err(FrameEncodeError::Encode)?;
    if out.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    out.push(DELIMITER);
    Ok(out)
}

/// Error encoding a message into a frame (serialization or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed
/// (including the newline). Blank lines are skipped and counted as consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let mut offset = 0;
    loop {
        let rest = &bytes[offset..];
        let Some(pos) = rest.iter().position(|b| *b == DELIMITER) else {
            if rest.len() > MAX_FRAME_LEN {
                return Err(FrameDecodeError::TooLarge);
            }
            return Err(FrameDecodeError::NeedMore);
        };
        if pos > MAX_FRAME_LEN {
            return Err(FrameDecodeError::TooLarge);
        }
        let line = &rest[..pos];
        offset += pos + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let msg = serde_json::from_slice(line).map_err(FrameDecodeError::Decode)?;
        return Ok((msg, offset));
    }
}

/// Error decoding a frame (need more bytes, too large, or malformed JSON).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
}

pub fn encode_datagram(msg: &DiscoveryMessage) -> Result<Vec<u8>, FrameEncodeError> {
    let out = serde_json::to_vec(msg).map_err(FrameEncodeError::Encode)?;
    if out.len() > MAX_DATAGRAM_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    Ok(out)
}

pub fn decode_datagram(bytes: &[u8]) -> Result<DiscoveryMessage, FrameDecodeError> {
    serde_json::from_slice(bytes).map_err(FrameDecodeError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::protocol::{DiscoveryKind, HandshakeInfo, MessageKind, Payload};

    fn sample_handshake() -> Message {
        let kp = Keypair::generate();
        Message::new(
            "10.0.0.1_100",
            "",
            Payload::Handshake(HandshakeInfo {
                public_key: *kp.public_key(),
                name: "alice".into(),
                port: 8888,
            }),
        )
        .unwrap()
    }

    #[test]
    fn roundtrip_handshake() {
        let msg = sample_handshake();
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_handshake()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(decode_frame(&[]), Err(FrameDecodeError::NeedMore)));
    }

    #[test]
    fn multiple_messages() {
        let a = sample_handshake();
        let b = Message::chat("10.0.0.1_100", "all", "hi");
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(m1.kind, MessageKind::Handshake);
        assert_eq!(m2.kind, MessageKind::Chat);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let frame = encode_frame(&Message::chat("a", "all", "x")).unwrap();
        let mut buf = b"\n\r\n".to_vec();
        buf.extend_from_slice(&frame);
        let (_, n) = decode_frame(&buf).unwrap();
        assert_eq!(n, buf.len());
    }

    #[test]
    fn garbage_is_decode_error() {
        assert!(matches!(
            decode_frame(b"{not json}\n"),
            Err(FrameDecodeError::Decode(_))
        ));
    }

    #[test]
    fn oversized_line_rejected() {
        let buf = vec![b'a'; MAX_FRAME_LEN + 1];
        assert!(matches!(decode_frame(&buf), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn decodes_foreign_announce() {
        let raw = br#"{"type":"announce","id":"192.168.1.5_1700000000","name":"bob","ip":"192.168.1.5","port":8888,"webPort":8080,"version":"1.2.0"}"#;
        let msg = decode_datagram(raw).unwrap();
        assert_eq!(msg.kind, DiscoveryKind::Announce);
        assert_eq!(msg.port, 8888);
        assert_eq!(msg.web_port, Some(8080));
        assert_eq!(msg.version.as_deref(), Some("1.2.0"));
        assert!(msg.pub_key.is_none());
        let back = decode_datagram(&encode_datagram(&msg).unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn decodes_zero_timestamp_chat() {
        let raw = b"{\"type\":\"chat\",\"from\":\"a\",\"to\":\"all\",\"content\":\"hey\",\"timestamp\":\"0001-01-01T00:00:00Z\",\"encrypted\":false}\n";
        let (msg, n) = decode_frame(raw).unwrap();
        assert_eq!(n, raw.len());
        assert_eq!(msg.content, "hey");
        assert!(msg.data.is_none());
    }
}
