//! Wire framing for the reliable and unreliable channels.
//!
//! Every message begins with a 1-byte type tag. Reliable-channel bodies are
//! encoded with the crate [`codec`]; the unreliable input packet is framed by
//! hand because it aggregates a variable number of records against a
//! transport-provided size budget and needs exact control over its layout.
//!
//! Malformed input (unknown tag, truncated body, length mismatch) decodes to
//! [`NetcodeError::Protocol`]: the receiver logs it, discards the message and
//! keeps the connection alive.

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::NetcodeError;
use crate::{Frame, PeerId};

/// Tag byte of `Initialize`.
pub const TAG_INITIALIZE: u8 = 1;
/// Tag byte of `AuthoritativeInput`.
pub const TAG_AUTHORITATIVE_INPUT: u8 = 2;
/// Tag byte of `SetDelay`.
pub const TAG_SET_DELAY: u8 = 3;
/// Tag byte of the unreliable client-input packet.
pub const TAG_CLIENT_INPUT: u8 = 4;

/// Fixed overhead of an encoded [`InputPacket`]: tag plus connection id.
pub const INPUT_PACKET_HEADER_LEN: usize = 1 + 8;
/// Fixed overhead of each [`InputRecord`]: frame plus payload length.
pub const INPUT_RECORD_HEADER_LEN: usize = 8 + 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct InitializeBody {
    client_id: PeerId,
    frame: Frame,
    state: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AuthoritativeInputBody {
    frame: Frame,
    checksum: Option<u64>,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SetDelayBody {
    frame: Frame,
    delay_ms: f32,
}

/// A message on the ordered, guaranteed-delivery channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ReliableMessage {
    /// Sent once per new connection: the snapshot a client boots from.
    Initialize {
        /// The id the server assigned to this connection.
        client_id: PeerId,
        /// The frame of the snapshot.
        frame: Frame,
        /// The canonical serialization of the state at `frame`.
        state: Vec<u8>,
    },
    /// One per server-stepped frame: the canonical input batch, optionally
    /// with the state checksum after applying it.
    AuthoritativeInput {
        /// The frame this batch advances the simulation to.
        frame: Frame,
        /// Checksum of the post-step state, when checksumming is enabled for
        /// this frame.
        checksum: Option<u64>,
        /// The encoded [`UpdateInput`](crate::UpdateInput).
        payload: Vec<u8>,
    },
    /// Pacing feedback: how much slack the recipient's input for `frame` had
    /// when the server consumed it.
    SetDelay {
        /// The frame the measurement describes.
        frame: Frame,
        /// The measured slack in milliseconds.
        delay_ms: f32,
    },
}

impl ReliableMessage {
    /// Encodes this message as tag byte plus body.
    pub fn encode(&self) -> Result<Vec<u8>, NetcodeError> {
        let mut buffer = Vec::new();
        match self {
            ReliableMessage::Initialize {
                client_id,
                frame,
                state,
            } => {
                buffer.push(TAG_INITIALIZE);
                codec::encode_append(
                    &InitializeBody {
                        client_id: *client_id,
                        frame: *frame,
                        state: state.clone(),
                    },
                    &mut buffer,
                )?;
            }
            ReliableMessage::AuthoritativeInput {
                frame,
                checksum,
                payload,
            } => {
                buffer.push(TAG_AUTHORITATIVE_INPUT);
                codec::encode_append(
                    &AuthoritativeInputBody {
                        frame: *frame,
                        checksum: *checksum,
                        payload: payload.clone(),
                    },
                    &mut buffer,
                )?;
            }
            ReliableMessage::SetDelay { frame, delay_ms } => {
                buffer.push(TAG_SET_DELAY);
                codec::encode_append(
                    &SetDelayBody {
                        frame: *frame,
                        delay_ms: *delay_ms,
                    },
                    &mut buffer,
                )?;
            }
        }
        Ok(buffer)
    }

    /// Decodes a message from tag byte plus body.
    pub fn decode(bytes: &[u8]) -> Result<Self, NetcodeError> {
        let (&tag, body) = bytes.split_first().ok_or_else(|| NetcodeError::Protocol {
            context: "empty message".to_owned(),
        })?;
        let message = match tag {
            TAG_INITIALIZE => {
                let (body, consumed): (InitializeBody, _) = decode_body(body)?;
                expect_consumed(body_kind(tag), consumed, bytes.len())?;
                ReliableMessage::Initialize {
                    client_id: body.client_id,
                    frame: body.frame,
                    state: body.state,
                }
            }
            TAG_AUTHORITATIVE_INPUT => {
                let (body, consumed): (AuthoritativeInputBody, _) = decode_body(body)?;
                expect_consumed(body_kind(tag), consumed, bytes.len())?;
                ReliableMessage::AuthoritativeInput {
                    frame: body.frame,
                    checksum: body.checksum,
                    payload: body.payload,
                }
            }
            TAG_SET_DELAY => {
                let (body, consumed): (SetDelayBody, _) = decode_body(body)?;
                expect_consumed(body_kind(tag), consumed, bytes.len())?;
                ReliableMessage::SetDelay {
                    frame: body.frame,
                    delay_ms: body.delay_ms,
                }
            }
            other => {
                return Err(NetcodeError::Protocol {
                    context: format!("unknown message tag {other}"),
                })
            }
        };
        Ok(message)
    }
}

fn body_kind(tag: u8) -> &'static str {
    match tag {
        TAG_INITIALIZE => "Initialize",
        TAG_AUTHORITATIVE_INPUT => "AuthoritativeInput",
        TAG_SET_DELAY => "SetDelay",
        _ => "unknown",
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<(T, usize), NetcodeError> {
    codec::decode(body).map_err(|e| NetcodeError::Protocol {
        context: format!("malformed message body: {e}"),
    })
}

fn expect_consumed(kind: &str, consumed: usize, total: usize) -> Result<(), NetcodeError> {
    if consumed + 1 != total {
        return Err(NetcodeError::Protocol {
            context: format!(
                "{kind} length mismatch: {consumed} byte body inside {total} byte message"
            ),
        });
    }
    Ok(())
}

/// One not-yet-acknowledged input inside an [`InputPacket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRecord {
    /// The frame the input is for.
    pub frame: Frame,
    /// The encoded client input.
    pub payload: Vec<u8>,
}

/// The unreliable-channel packet: a client's pending inputs, oldest first.
///
/// The sender's connection id is prepended so the packet can be attributed
/// without a per-packet handshake. Records for multiple unacknowledged
/// frames aggregate into one packet up to the transport's maximum payload
/// size; each record drops out of the aggregate once its frame is confirmed
/// authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputPacket {
    /// The sending connection.
    pub connection_id: PeerId,
    /// Pending input records, oldest frame first.
    pub records: Vec<InputRecord>,
}

impl InputPacket {
    /// Builds a packet from pending `(frame, payload)` pairs, taking records
    /// oldest-first until `max_len` encoded bytes would be exceeded.
    ///
    /// Returns `None` if not even the first record fits (or there are no
    /// records at all).
    #[must_use]
    pub fn pack<'a>(
        connection_id: PeerId,
        pending: impl Iterator<Item = (Frame, &'a [u8])>,
        max_len: usize,
    ) -> Option<Self> {
        let mut records = Vec::new();
        let mut encoded_len = INPUT_PACKET_HEADER_LEN;
        for (frame, payload) in pending {
            let record_len = INPUT_RECORD_HEADER_LEN + payload.len();
            if encoded_len + record_len > max_len {
                break;
            }
            encoded_len += record_len;
            records.push(InputRecord {
                frame,
                payload: payload.to_vec(),
            });
        }
        if records.is_empty() {
            return None;
        }
        Some(Self {
            connection_id,
            records,
        })
    }

    /// Encodes the packet: tag, connection id, then each record as
    /// `(frame: i64, payload_len: i32, payload)`, all little-endian.
    pub fn encode(&self) -> Result<Vec<u8>, NetcodeError> {
        let mut buffer = Vec::with_capacity(
            INPUT_PACKET_HEADER_LEN
                + self
                    .records
                    .iter()
                    .map(|r| INPUT_RECORD_HEADER_LEN + r.payload.len())
                    .sum::<usize>(),
        );
        buffer.push(TAG_CLIENT_INPUT);
        buffer.extend_from_slice(&self.connection_id.as_i64().to_le_bytes());
        for record in &self.records {
            let payload_len =
                i32::try_from(record.payload.len()).map_err(|_| NetcodeError::Protocol {
                    context: format!(
                        "input payload of {} bytes exceeds the record size limit",
                        record.payload.len()
                    ),
                })?;
            buffer.extend_from_slice(&record.frame.as_i64().to_le_bytes());
            buffer.extend_from_slice(&payload_len.to_le_bytes());
            buffer.extend_from_slice(&record.payload);
        }
        Ok(buffer)
    }

    /// Decodes a packet, validating the tag and every record length.
    pub fn decode(bytes: &[u8]) -> Result<Self, NetcodeError> {
        if bytes.first() != Some(&TAG_CLIENT_INPUT) {
            return Err(NetcodeError::Protocol {
                context: "not a client input packet".to_owned(),
            });
        }
        if bytes.len() < INPUT_PACKET_HEADER_LEN {
            return Err(NetcodeError::Protocol {
                context: "client input packet shorter than its header".to_owned(),
            });
        }
        let connection_id = PeerId::new(i64::from_le_bytes(
            bytes[1..9].try_into().map_err(|_| NetcodeError::Protocol {
                context: "client input packet shorter than its header".to_owned(),
            })?,
        ));

        let mut records = Vec::new();
        let mut cursor = INPUT_PACKET_HEADER_LEN;
        while cursor < bytes.len() {
            let remaining = bytes.len() - cursor;
            if remaining < INPUT_RECORD_HEADER_LEN {
                return Err(NetcodeError::Protocol {
                    context: format!("truncated input record header ({remaining} bytes left)"),
                });
            }
            let frame = i64::from_le_bytes(
                bytes[cursor..cursor + 8]
                    .try_into()
                    .map_err(|_| truncated_record())?,
            );
            let payload_len = i32::from_le_bytes(
                bytes[cursor + 8..cursor + 12]
                    .try_into()
                    .map_err(|_| truncated_record())?,
            );
            cursor += INPUT_RECORD_HEADER_LEN;

            let payload_len = usize::try_from(payload_len).map_err(|_| NetcodeError::Protocol {
                context: format!("negative input payload length {payload_len}"),
            })?;
            if bytes.len() - cursor < payload_len {
                return Err(NetcodeError::Protocol {
                    context: format!(
                        "input record claims {payload_len} payload bytes, {} remain",
                        bytes.len() - cursor
                    ),
                });
            }
            records.push(InputRecord {
                frame: Frame::new(frame),
                payload: bytes[cursor..cursor + payload_len].to_vec(),
            });
            cursor += payload_len;
        }

        Ok(Self {
            connection_id,
            records,
        })
    }
}

fn truncated_record() -> NetcodeError {
    NetcodeError::Protocol {
        context: "truncated input record header".to_owned(),
    }
}

// #########
// # TESTS #
// #########
