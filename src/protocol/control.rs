//! AppleMIDI session-control PDUs.
//!
//! Every control PDU opens with the two-byte signature `0xFF 0xFF` followed
//! by a two-byte ASCII command tag. Invitation-family PDUs (IN/OK/NO/BY)
//! carry a protocol version, an initiator token, and an ssrc; CK carries the
//! three-way clock-sync timestamps; RS and RL are receiver reports.
//!
//! Decoding is pure: `decode` returns the packet plus the number of bytes
//! consumed and never mutates session state.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Two-byte signature opening every control PDU.
pub const SIGNATURE: [u8; 2] = [0xFF, 0xFF];

/// AppleMIDI protocol version carried by invitation-family PDUs.
pub const PROTOCOL_VERSION: u32 = 2;

/// Invitation payload shared by IN, OK, and NO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    /// Initiator token correlating IN with its OK/NO reply.
    pub token: u32,
    /// Sender's synchronization source.
    pub ssrc: u32,
    /// Sender's session name.
    pub name: String,
}

/// Three-way clock-sync exchange payload (CK).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSyncExchange {
    /// Sender's synchronization source.
    pub ssrc: u32,
    /// Exchange step, 0..=2.
    pub count: u8,
    /// Media-clock timestamps ts0, ts1, ts2.
    pub timestamps: [u64; 3],
}

/// A decoded AppleMIDI control PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    /// `IN` — session invitation.
    Invitation(Invitation),
    /// `OK` — invitation accepted.
    InvitationAccepted(Invitation),
    /// `NO` — invitation rejected.
    InvitationRejected(Invitation),
    /// `BY` — end of session.
    EndSession {
        /// Token from the original invitation.
        token: u32,
        /// Sender's synchronization source.
        ssrc: u32,
    },
    /// `CK` — clock synchronization exchange.
    Synchronization(ClockSyncExchange),
    /// `RS` — receiver feedback acknowledging a sequence number.
    ReceiverFeedback {
        /// Sender's synchronization source.
        ssrc: u32,
        /// Highest sequence number seen by the sender.
        seq: u16,
    },
    /// `RL` — bitrate receive limit.
    BitrateReceiveLimit {
        /// Sender's synchronization source.
        ssrc: u32,
        /// Advertised limit.
        limit: u32,
    },
}

/// Control PDU decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlDecodeError {
    /// The buffer holds the start of a PDU but not all of it yet.
    #[error("need {needed} bytes, have {have}")]
    NotEnoughData {
        /// Minimum length of the PDU being decoded.
        needed: usize,
        /// Bytes available.
        have: usize,
    },

    /// The first two bytes are not the AppleMIDI signature.
    #[error("signature mismatch: {0:02x} {1:02x}")]
    SignatureMismatch(u8, u8),

    /// The signature matched but the command tag is unknown.
    #[error("unknown command tag: {0:02x} {1:02x}")]
    UnknownCommand(u8, u8),

    /// Invitation-family PDU with an unsupported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),
}

impl ControlPacket {
    /// Two-byte ASCII tag of this PDU.
    #[must_use]
    pub fn tag(&self) -> &'static [u8; 2] {
        match self {
            Self::Invitation(_) => b"IN",
            Self::InvitationAccepted(_) => b"OK",
            Self::InvitationRejected(_) => b"NO",
            Self::EndSession { .. } => b"BY",
            Self::Synchronization(_) => b"CK",
            Self::ReceiverFeedback { .. } => b"RS",
            Self::BitrateReceiveLimit { .. } => b"RL",
        }
    }

    /// Decode one PDU from the front of `buf`.
    ///
    /// Returns the packet and the number of bytes consumed. Invitation-family
    /// PDUs consume the whole buffer: the session name runs to the end of the
    /// datagram (a single trailing NUL is not part of the name).
    ///
    /// # Errors
    ///
    /// `NotEnoughData` when the buffer is shorter than the PDU's minimum
    /// length (the caller keeps the bytes and waits for more),
    /// `SignatureMismatch`/`UnknownCommand` on unrecognisable input, and
    /// `UnsupportedVersion` on a protocol-version mismatch.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ControlDecodeError> {
        if buf.len() < 4 {
            return Err(ControlDecodeError::NotEnoughData {
                needed: 4,
                have: buf.len(),
            });
        }
        if buf[0..2] != SIGNATURE {
            return Err(ControlDecodeError::SignatureMismatch(buf[0], buf[1]));
        }

        let tag = [buf[2], buf[3]];
        match &tag {
            b"IN" | b"OK" | b"NO" => {
                let invitation = decode_invitation(buf)?;
                let packet = match &tag {
                    b"IN" => Self::Invitation(invitation),
                    b"OK" => Self::InvitationAccepted(invitation),
                    _ => Self::InvitationRejected(invitation),
                };
                Ok((packet, buf.len()))
            }
            b"BY" => {
                check_len(buf, 16)?;
                let mut body = &buf[4..16];
                let version = body.get_u32();
                if version != PROTOCOL_VERSION {
                    return Err(ControlDecodeError::UnsupportedVersion(version));
                }
                let token = body.get_u32();
                let ssrc = body.get_u32();
                Ok((Self::EndSession { token, ssrc }, 16))
            }
            b"CK" => {
                check_len(buf, 36)?;
                let mut body = &buf[4..36];
                let ssrc = body.get_u32();
                let count = body.get_u8();
                body.advance(3); // padding
                let timestamps = [body.get_u64(), body.get_u64(), body.get_u64()];
                Ok((
                    Self::Synchronization(ClockSyncExchange {
                        ssrc,
                        count,
                        timestamps,
                    }),
                    36,
                ))
            }
            b"RS" => {
                check_len(buf, 12)?;
                let mut body = &buf[4..12];
                let ssrc = body.get_u32();
                let seq = body.get_u16();
                Ok((Self::ReceiverFeedback { ssrc, seq }, 12))
            }
            b"RL" => {
                check_len(buf, 12)?;
                let mut body = &buf[4..12];
                let ssrc = body.get_u32();
                let limit = body.get_u32();
                Ok((Self::BitrateReceiveLimit { ssrc, limit }, 12))
            }
            _ => Err(ControlDecodeError::UnknownCommand(tag[0], tag[1])),
        }
    }

    /// Encode this PDU into a fresh datagram.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(36);
        buf.put_slice(&SIGNATURE);
        buf.put_slice(self.tag());

        match self {
            Self::Invitation(inv) | Self::InvitationAccepted(inv) | Self::InvitationRejected(inv) => {
                buf.put_u32(PROTOCOL_VERSION);
                buf.put_u32(inv.token);
                buf.put_u32(inv.ssrc);
                buf.put_slice(inv.name.as_bytes());
                buf.put_u8(0);
            }
            Self::EndSession { token, ssrc } => {
                buf.put_u32(PROTOCOL_VERSION);
                buf.put_u32(*token);
                buf.put_u32(*ssrc);
            }
            Self::Synchronization(sync) => {
                buf.put_u32(sync.ssrc);
                buf.put_u8(sync.count);
                buf.put_slice(&[0, 0, 0]);
                for ts in sync.timestamps {
                    buf.put_u64(ts);
                }
            }
            Self::ReceiverFeedback { ssrc, seq } => {
                buf.put_u32(*ssrc);
                buf.put_u16(*seq);
                buf.put_u16(0);
            }
            Self::BitrateReceiveLimit { ssrc, limit } => {
                buf.put_u32(*ssrc);
                buf.put_u32(*limit);
            }
        }

        buf
    }
}

fn check_len(buf: &[u8], needed: usize) -> Result<(), ControlDecodeError> {
    if buf.len() < needed {
        Err(ControlDecodeError::NotEnoughData {
            needed,
            have: buf.len(),
        })
    } else {
        Ok(())
    }
}

fn decode_invitation(buf: &[u8]) -> Result<Invitation, ControlDecodeError> {
    check_len(buf, 16)?;
    let mut body = &buf[4..16];
    let version = body.get_u32();
    if version != PROTOCOL_VERSION {
        return Err(ControlDecodeError::UnsupportedVersion(version));
    }
    let token = body.get_u32();
    let ssrc = body.get_u32();

    let mut name_bytes = &buf[16..];
    if let [head @ .., 0] = name_bytes {
        name_bytes = head;
    }
    let name = String::from_utf8_lossy(name_bytes).into_owned();

    Ok(Invitation { token, ssrc, name })
}
