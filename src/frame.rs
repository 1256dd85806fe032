//! Control and data frame codec for the tunnel protocol.
//!
//! Control frames are WebSocket Text messages of the form
//! `TAG:<field>|<field>|...`. Data-bearing frames (`TCP:`, `DATA:`,
//! `UDP_DATA:`) are Binary messages whose final field is opaque payload
//! bytes, so parsers must split on the first N `|` separators only.

use tokio_tungstenite::tungstenite::Message;

/// Maximum WebSocket message size accepted and produced on a channel.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Claim { id: String, channel: usize },
    ClaimAck { id: String, channel: usize },
    Tcp { id: String, target: String, first_frame: Vec<u8> },
    Connected { id: String },
    Close { id: String },
    Error { message: String },
    UdpConnect { id: String, target: String },
    UdpConnected { id: String },
    UdpClose { id: String },
    UdpError { id: String, reason: String },
    Data { id: String, payload: Vec<u8> },
    /// UDP payload. Gateway-bound frames carry `id|payload`; client-bound
    /// frames additionally carry the origin peer as `id|host:port|payload`.
    UdpData { id: String, peer: Option<String>, payload: Vec<u8> },
}

#[derive(Debug)]
pub enum FrameError {
    /// A recognized tag with fields that do not conform to the grammar.
    Malformed(String),
    /// A tag this endpoint does not understand. Dropped, never fatal.
    UnknownTag(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Malformed(msg) => write!(f, "malformed frame: {}", msg),
            FrameError::UnknownTag(tag) => write!(f, "unknown frame tag: {}", tag),
        }
    }
}

fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn parse_channel_index(s: &str) -> Result<usize, FrameError> {
    s.parse::<usize>()
        .map_err(|_| FrameError::Malformed(format!("bad channel index: {}", s)))
}

fn checked_id(id: &str) -> Result<String, FrameError> {
    if !is_valid_session_id(id) {
        return Err(FrameError::Malformed(format!("bad session id: {:?}", id)));
    }
    Ok(id.to_string())
}

impl Frame {
    /// Encode into a single WebSocket message. Control frames travel as
    /// Text; frames whose last field is opaque bytes travel as Binary.
    pub fn encode(&self) -> Message {
        match self {
            Frame::Claim { id, channel } => text(format!("CLAIM:{}|{}", id, channel)),
            Frame::ClaimAck { id, channel } => text(format!("CLAIM_ACK:{}|{}", id, channel)),
            Frame::Connected { id } => text(format!("CONNECTED:{}", id)),
            Frame::Close { id } => text(format!("CLOSE:{}", id)),
            Frame::Error { message } => text(format!("ERROR:{}", message)),
            Frame::UdpConnect { id, target } => text(format!("UDP_CONNECT:{}|{}", id, target)),
            Frame::UdpConnected { id } => text(format!("UDP_CONNECTED:{}", id)),
            Frame::UdpClose { id } => text(format!("UDP_CLOSE:{}", id)),
            Frame::UdpError { id, reason } => text(format!("UDP_ERROR:{}|{}", id, reason)),
            Frame::Tcp {
                id,
                target,
                first_frame,
            } => {
                let mut buf = Vec::with_capacity(5 + id.len() + target.len() + first_frame.len() + 2);
                buf.extend_from_slice(b"TCP:");
                buf.extend_from_slice(id.as_bytes());
                buf.push(b'|');
                buf.extend_from_slice(target.as_bytes());
                buf.push(b'|');
                buf.extend_from_slice(first_frame);
                Message::Binary(buf)
            }
            Frame::Data { id, payload } => {
                let mut buf = Vec::with_capacity(6 + id.len() + payload.len());
                buf.extend_from_slice(b"DATA:");
                buf.extend_from_slice(id.as_bytes());
                buf.push(b'|');
                buf.extend_from_slice(payload);
                Message::Binary(buf)
            }
            Frame::UdpData { id, peer, payload } => {
                let peer_len = peer.as_ref().map(|p| p.len() + 1).unwrap_or(0);
                let mut buf = Vec::with_capacity(10 + id.len() + peer_len + payload.len());
                buf.extend_from_slice(b"UDP_DATA:");
                buf.extend_from_slice(id.as_bytes());
                buf.push(b'|');
                if let Some(peer) = peer {
                    buf.extend_from_slice(peer.as_bytes());
                    buf.push(b'|');
                }
                buf.extend_from_slice(payload);
                Message::Binary(buf)
            }
        }
    }

    /// Decode a message received by the gateway.
    pub fn decode_from_client(message: &Message) -> Result<Frame, FrameError> {
        Self::decode(message, false)
    }

    /// Decode a message received by the client.
    pub fn decode_from_server(message: &Message) -> Result<Frame, FrameError> {
        Self::decode(message, true)
    }

    /// Ping/Pong/Close messages are not frames and must be filtered out by
    /// the caller. `udp_peer_field` selects the UDP_DATA form: the gateway
    /// reports the origin peer, the client does not.
    fn decode(message: &Message, udp_peer_field: bool) -> Result<Frame, FrameError> {
        match message {
            Message::Text(data) => Self::decode_text(data),
            Message::Binary(data) => Self::decode_binary(data, udp_peer_field),
            _ => Err(FrameError::Malformed(
                "not a text or binary message".to_string(),
            )),
        }
    }

    fn decode_text(data: &str) -> Result<Frame, FrameError> {
        let (tag, rest) = data
            .split_once(':')
            .ok_or_else(|| FrameError::Malformed("missing tag separator".to_string()))?;
        match tag {
            "CLAIM" | "CLAIM_ACK" => {
                let (id, channel) = rest
                    .split_once('|')
                    .ok_or_else(|| FrameError::Malformed(format!("{} needs 2 fields", tag)))?;
                let id = checked_id(id)?;
                let channel = parse_channel_index(channel)?;
                if tag == "CLAIM" {
                    Ok(Frame::Claim { id, channel })
                } else {
                    Ok(Frame::ClaimAck { id, channel })
                }
            }
            "CONNECTED" => Ok(Frame::Connected { id: checked_id(rest)? }),
            "CLOSE" => Ok(Frame::Close { id: checked_id(rest)? }),
            "ERROR" => Ok(Frame::Error {
                message: rest.to_string(),
            }),
            "UDP_CONNECT" => {
                let (id, target) = rest
                    .split_once('|')
                    .ok_or_else(|| FrameError::Malformed("UDP_CONNECT needs 2 fields".to_string()))?;
                Ok(Frame::UdpConnect {
                    id: checked_id(id)?,
                    target: target.to_string(),
                })
            }
            "UDP_CONNECTED" => Ok(Frame::UdpConnected { id: checked_id(rest)? }),
            "UDP_CLOSE" => Ok(Frame::UdpClose { id: checked_id(rest)? }),
            "UDP_ERROR" => {
                let (id, reason) = rest
                    .split_once('|')
                    .ok_or_else(|| FrameError::Malformed("UDP_ERROR needs 2 fields".to_string()))?;
                Ok(Frame::UdpError {
                    id: checked_id(id)?,
                    reason: reason.to_string(),
                })
            }
            // Legacy peers ship the TCP open frame as Text when the first
            // frame happens to be valid UTF-8. Treat it like the binary form.
            "TCP" => Self::decode_tcp(rest.as_bytes()),
            "DATA" => Self::decode_data(rest.as_bytes()),
            _ => Err(FrameError::UnknownTag(tag.to_string())),
        }
    }

    fn decode_binary(data: &[u8], udp_peer_field: bool) -> Result<Frame, FrameError> {
        // The tag is short ASCII; cap the search so payload bytes that
        // happen to contain ':' never masquerade as a tag.
        let colon = data
            .iter()
            .take(16)
            .position(|&b| b == b':')
            .ok_or_else(|| FrameError::Malformed("missing tag separator".to_string()))?;
        let tag = std::str::from_utf8(&data[..colon])
            .map_err(|_| FrameError::Malformed("non-ascii tag".to_string()))?;
        let rest = &data[colon + 1..];
        match tag {
            "TCP" => Self::decode_tcp(rest),
            "DATA" => Self::decode_data(rest),
            "UDP_DATA" => {
                let (id, rest) = split_field(rest)
                    .ok_or_else(|| FrameError::Malformed("UDP_DATA needs 2 fields".to_string()))?;
                let (peer, payload) = if udp_peer_field {
                    let (peer, payload) = split_field(rest).ok_or_else(|| {
                        FrameError::Malformed("UDP_DATA needs 3 fields".to_string())
                    })?;
                    (Some(field_str(peer)?.to_string()), payload)
                } else {
                    (None, rest)
                };
                Ok(Frame::UdpData {
                    id: checked_id(field_str(id)?)?,
                    peer,
                    payload: payload.to_vec(),
                })
            }
            _ => Err(FrameError::UnknownTag(tag.to_string())),
        }
    }

    fn decode_tcp(rest: &[u8]) -> Result<Frame, FrameError> {
        let (id, rest) = split_field(rest)
            .ok_or_else(|| FrameError::Malformed("TCP needs 3 fields".to_string()))?;
        let (target, first_frame) = split_field(rest)
            .ok_or_else(|| FrameError::Malformed("TCP needs 3 fields".to_string()))?;
        Ok(Frame::Tcp {
            id: checked_id(field_str(id)?)?,
            target: field_str(target)?.to_string(),
            first_frame: first_frame.to_vec(),
        })
    }

    fn decode_data(rest: &[u8]) -> Result<Frame, FrameError> {
        let (id, payload) = split_field(rest)
            .ok_or_else(|| FrameError::Malformed("DATA needs 2 fields".to_string()))?;
        Ok(Frame::Data {
            id: checked_id(field_str(id)?)?,
            payload: payload.to_vec(),
        })
    }

    /// Session id carried by this frame, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Frame::Claim { id, .. }
            | Frame::ClaimAck { id, .. }
            | Frame::Tcp { id, .. }
            | Frame::Connected { id }
            | Frame::Close { id }
            | Frame::UdpConnect { id, .. }
            | Frame::UdpConnected { id }
            | Frame::UdpClose { id }
            | Frame::UdpError { id, .. }
            | Frame::Data { id, .. }
            | Frame::UdpData { id, .. } => Some(id),
            Frame::Error { .. } => None,
        }
    }
}

fn text(s: String) -> Message {
    Message::Text(s)
}

/// Split on the first `|` only, so later fields may contain `|` bytes.
fn split_field(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = data.iter().position(|&b| b == b'|')?;
    Some((&data[..pos], &data[pos + 1..]))
}

fn field_str(data: &[u8]) -> Result<&str, FrameError> {
    std::str::from_utf8(data).map_err(|_| FrameError::Malformed("non-utf8 field".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let decoded = Frame::decode_from_server(&frame.encode()).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_control_frames() {
        roundtrip(Frame::Claim {
            id: "abc-123".to_string(),
            channel: 2,
        });
        roundtrip(Frame::ClaimAck {
            id: "abc-123".to_string(),
            channel: 0,
        });
        roundtrip(Frame::Connected {
            id: "a".to_string(),
        });
        roundtrip(Frame::Close {
            id: "a".to_string(),
        });
        roundtrip(Frame::UdpConnect {
            id: "u1".to_string(),
            target: "dns.example:53".to_string(),
        });
        roundtrip(Frame::UdpConnected {
            id: "u1".to_string(),
        });
        roundtrip(Frame::UdpClose {
            id: "u1".to_string(),
        });
        roundtrip(Frame::UdpError {
            id: "u1".to_string(),
            reason: "resolve failed".to_string(),
        });
    }

    #[test]
    fn test_claim_wire_format() {
        let msg = Frame::Claim {
            id: "id-1".to_string(),
            channel: 7,
        }
        .encode();
        assert_eq!(msg, Message::Text("CLAIM:id-1|7".to_string()));
    }

    #[test]
    fn test_payload_may_contain_separator() {
        let frame = Frame::Data {
            id: "s".to_string(),
            payload: b"a|b|c".to_vec(),
        };
        roundtrip(frame.clone());
        match Frame::decode_from_server(&frame.encode()).unwrap() {
            Frame::Data { payload, .. } => assert_eq!(payload, b"a|b|c"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_tcp_frame_is_binary_with_raw_bytes() {
        let frame = Frame::Tcp {
            id: "tcp-1".to_string(),
            target: "example.com:443".to_string(),
            first_frame: vec![0x16, 0x03, 0x01, 0xff, b'|', 0x00],
        };
        let msg = frame.encode();
        assert!(matches!(msg, Message::Binary(_)));
        roundtrip(frame);
    }

    #[test]
    fn test_tcp_frame_accepted_as_text() {
        let msg = Message::Text("TCP:id-9|example.com:80|GET / HTTP/1.1\r\n".to_string());
        match Frame::decode_from_server(&msg).unwrap() {
            Frame::Tcp {
                id,
                target,
                first_frame,
            } => {
                assert_eq!(id, "id-9");
                assert_eq!(target, "example.com:80");
                assert_eq!(first_frame, b"GET / HTTP/1.1\r\n");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_empty_payloads() {
        roundtrip(Frame::Data {
            id: "x".to_string(),
            payload: Vec::new(),
        });
        roundtrip(Frame::Tcp {
            id: "x".to_string(),
            target: "a:1".to_string(),
            first_frame: Vec::new(),
        });
        roundtrip(Frame::UdpData {
            id: "x".to_string(),
            peer: Some("127.0.0.1:53".to_string()),
            payload: Vec::new(),
        });
    }

    #[test]
    fn test_udp_data_splits_first_two_separators_only() {
        let msg = Message::Binary(b"UDP_DATA:u|127.0.0.1:53|ab|cd".to_vec());
        match Frame::decode_from_server(&msg).unwrap() {
            Frame::UdpData { id, peer, payload } => {
                assert_eq!(id, "u");
                assert_eq!(peer.as_deref(), Some("127.0.0.1:53"));
                assert_eq!(payload, b"ab|cd");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_udp_data_is_asymmetric() {
        // Gateway-bound UDP payloads have no peer field; separators belong
        // to the payload.
        let msg = Message::Binary(b"UDP_DATA:u|raw|data".to_vec());
        match Frame::decode_from_client(&msg).unwrap() {
            Frame::UdpData { id, peer, payload } => {
                assert_eq!(id, "u");
                assert_eq!(peer, None);
                assert_eq!(payload, b"raw|data");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        // And the client emits exactly that two-field form.
        let msg = Frame::UdpData {
            id: "u".to_string(),
            peer: None,
            payload: b"raw".to_vec(),
        }
        .encode();
        assert_eq!(msg, Message::Binary(b"UDP_DATA:u|raw".to_vec()));

        // A gateway-bound payload that happens to contain no separator is
        // still a complete frame; from the server it would be malformed.
        let msg = Message::Binary(b"UDP_DATA:u|payload".to_vec());
        assert!(Frame::decode_from_client(&msg).is_ok());
        assert!(matches!(
            Frame::decode_from_server(&msg),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_tag() {
        assert!(matches!(
            Frame::decode_from_server(&Message::Text("NOPE:abc".to_string())),
            Err(FrameError::UnknownTag(_))
        ));
        assert!(matches!(
            Frame::decode_from_server(&Message::Binary(b"NOPE:abc|def".to_vec())),
            Err(FrameError::UnknownTag(_))
        ));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            Frame::decode_from_server(&Message::Text("CLAIM:missing-channel".to_string())),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            Frame::decode_from_server(&Message::Text("CLAIM:id|notanumber".to_string())),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            Frame::decode_from_server(&Message::Binary(b"DATA:no-separator".to_vec())),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            Frame::decode_from_server(&Message::Binary(b"no tag at all".to_vec())),
            Err(FrameError::Malformed(_))
        ));
        // Ids are restricted to [0-9A-Za-z-]{1,64}.
        assert!(matches!(
            Frame::decode_from_server(&Message::Text("CONNECTED:bad id".to_string())),
            Err(FrameError::Malformed(_))
        ));
        let long_id = "a".repeat(65);
        assert!(matches!(
            Frame::decode_from_server(&Message::Text(format!("CONNECTED:{}", long_id))),
            Err(FrameError::Malformed(_))
        ));
    }
}
