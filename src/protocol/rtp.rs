//! RTP header and RTP-MIDI command-section header.
//!
//! Data-port packets are standard 12-byte RTP headers with payload type 97,
//! followed by the RTP-MIDI command-section header: one flag byte
//! `B J Z P | LEN(4)`, extended by a second length byte when `B = 1`.

use bytes::BufMut;
use thiserror::Error;

/// Fixed RTP payload type for RTP-MIDI streams.
pub const PAYLOAD_TYPE_MIDI: u8 = 97;

/// RTP protocol version.
const RTP_VERSION: u8 = 2;

/// Longest command section a two-byte header can describe.
pub const MAX_COMMAND_SECTION: usize = 0x0FFF;

/// RTP header decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RtpDecodeError {
    /// The buffer is shorter than the structure being decoded.
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        have: usize,
    },

    /// RTP version field is not 2.
    #[error("invalid RTP version: {0}")]
    InvalidVersion(u8),

    /// Payload type is not the RTP-MIDI type (97).
    #[error("wrong payload type: {0}")]
    WrongPayloadType(u8),

    /// The declared command-section length overruns the packet.
    #[error("command section of {declared} bytes overruns packet ({available} left)")]
    SectionOverrun {
        /// Length declared by the section header.
        declared: usize,
        /// Bytes remaining in the packet.
        available: usize,
    },
}

/// The fixed 12-byte RTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Sequence number.
    pub sequence: u16,
    /// Media-clock timestamp (low 32 bits).
    pub timestamp: u32,
    /// Synchronization source of the sender.
    pub ssrc: u32,
}

impl RtpHeader {
    /// Encoded size of the header.
    pub const SIZE: usize = 12;

    /// Encode to the fixed wire layout: `V=2 P=0 X=0 CC=0 | M=0 PT=97`.
    #[must_use]
    pub fn encode(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0] = RTP_VERSION << 6;
        buf[1] = PAYLOAD_TYPE_MIDI;
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        buf
    }

    /// Decode from the front of `buf`, validating version and payload type.
    ///
    /// # Errors
    ///
    /// `BufferTooSmall` when fewer than 12 bytes are available,
    /// `InvalidVersion` / `WrongPayloadType` when the fixed fields do not
    /// match an RTP-MIDI packet.
    pub fn decode(buf: &[u8]) -> Result<Self, RtpDecodeError> {
        if buf.len() < Self::SIZE {
            return Err(RtpDecodeError::BufferTooSmall {
                needed: Self::SIZE,
                have: buf.len(),
            });
        }

        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpDecodeError::InvalidVersion(version));
        }

        let payload_type = buf[1] & 0x7F;
        if payload_type != PAYLOAD_TYPE_MIDI {
            return Err(RtpDecodeError::WrongPayloadType(payload_type));
        }

        Ok(Self {
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

/// The RTP-MIDI command-section header (flag byte + optional length byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// `J`: a recovery journal follows the command list.
    pub journal_present: bool,
    /// `Z`: the first command is preceded by a delta-time.
    pub first_has_delta: bool,
    /// `P`: phantom status flag; carried but not acted on.
    pub phantom: bool,
    /// Command-list length in bytes (0..=4095).
    pub length: u16,
}

impl SectionHeader {
    /// Decode from the front of `buf`, returning the header and its encoded
    /// size (1 or 2 bytes).
    ///
    /// # Errors
    ///
    /// `BufferTooSmall` when the flag byte (or the long-form length byte) is
    /// missing.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), RtpDecodeError> {
        let flags = *buf.first().ok_or(RtpDecodeError::BufferTooSmall {
            needed: 1,
            have: 0,
        })?;

        let long_form = flags & 0x80 != 0;
        let journal_present = flags & 0x40 != 0;
        let first_has_delta = flags & 0x20 != 0;
        let phantom = flags & 0x10 != 0;

        let (length, consumed) = if long_form {
            let low = *buf.get(1).ok_or(RtpDecodeError::BufferTooSmall {
                needed: 2,
                have: 1,
            })?;
            ((u16::from(flags & 0x0F) << 8) | u16::from(low), 2)
        } else {
            (u16::from(flags & 0x0F), 1)
        };

        Ok((
            Self {
                journal_present,
                first_has_delta,
                phantom,
                length,
            },
            consumed,
        ))
    }

    /// Append the encoded header to `out`.
    ///
    /// Lengths below 15 use the short single-byte form; anything longer uses
    /// the two-byte form with `B = 1`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut flags = 0u8;
        if self.journal_present {
            flags |= 0x40;
        }
        if self.first_has_delta {
            flags |= 0x20;
        }
        if self.phantom {
            flags |= 0x10;
        }

        if self.length < 15 {
            out.put_u8(flags | self.length as u8);
        } else {
            out.put_u8(0x80 | flags | ((self.length >> 8) as u8 & 0x0F));
            out.put_u8((self.length & 0xFF) as u8);
        }
    }
}

/// A data-port packet split into its sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiPacket<'a> {
    /// The RTP header.
    pub header: RtpHeader,
    /// The command-section header.
    pub section: SectionHeader,
    /// The MIDI command list, exactly `section.length` bytes.
    pub commands: &'a [u8],
    /// The recovery-journal section, empty when `J = 0`.
    pub journal: &'a [u8],
}

/// Decode a full RTP-MIDI packet into its sections.
///
/// # Errors
///
/// Propagates header errors and reports `SectionOverrun` when the declared
/// command-list length exceeds the packet.
pub fn decode_midi_packet(buf: &[u8]) -> Result<MidiPacket<'_>, RtpDecodeError> {
    let header = RtpHeader::decode(buf)?;
    let rest = &buf[RtpHeader::SIZE..];
    let (section, header_len) = SectionHeader::decode(rest)?;

    let body = &rest[header_len..];
    let length = usize::from(section.length);
    if length > body.len() {
        return Err(RtpDecodeError::SectionOverrun {
            declared: length,
            available: body.len(),
        });
    }

    let (commands, trailer) = body.split_at(length);
    let journal = if section.journal_present { trailer } else { &[] };

    Ok(MidiPacket {
        header,
        section,
        commands,
        journal,
    })
}

/// Frame a complete data-port packet from its parts.
#[must_use]
pub fn encode_midi_packet(header: RtpHeader, commands: &[u8], journal: Option<&[u8]>) -> Vec<u8> {
    let section = SectionHeader {
        journal_present: journal.is_some(),
        first_has_delta: false,
        phantom: false,
        length: commands.len().min(MAX_COMMAND_SECTION) as u16,
    };

    let mut buf = Vec::with_capacity(RtpHeader::SIZE + 2 + commands.len());
    buf.extend_from_slice(&header.encode());
    section.encode(&mut buf);
    buf.extend_from_slice(commands);
    if let Some(journal) = journal {
        buf.extend_from_slice(journal);
    }
    buf
}
