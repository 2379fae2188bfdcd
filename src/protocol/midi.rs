//! RTP-MIDI command-list codec.
//!
//! A command list is a sequence of `(delta-time, MIDI command)` pairs packed
//! into the section described by the flag byte. The first command carries a
//! delta-time only when `Z = 1`; every later command always carries one.
//! Status bytes may be elided under MIDI running status, and a System
//! Exclusive message may be segmented across packets: a segment closed by a
//! nested `F0` continues in the next packet, which resumes it with `F7`.

use thiserror::Error;

/// Largest encodable delta-time (four varlen bytes).
pub const MAX_DELTA_TIME: u32 = 0x0FFF_FFFF;

/// A decoded MIDI command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiCommand {
    /// Note off.
    NoteOff {
        /// Channel 0..=15.
        channel: u8,
        /// Key number.
        note: u8,
        /// Release velocity.
        velocity: u8,
    },
    /// Note on.
    NoteOn {
        /// Channel 0..=15.
        channel: u8,
        /// Key number.
        note: u8,
        /// Strike velocity.
        velocity: u8,
    },
    /// Polyphonic key pressure.
    PolyAftertouch {
        /// Channel 0..=15.
        channel: u8,
        /// Key number.
        note: u8,
        /// Pressure value.
        pressure: u8,
    },
    /// Control change.
    ControlChange {
        /// Channel 0..=15.
        channel: u8,
        /// Controller number.
        control: u8,
        /// Controller value.
        value: u8,
    },
    /// Program change.
    ProgramChange {
        /// Channel 0..=15.
        channel: u8,
        /// Program number.
        program: u8,
    },
    /// Channel pressure.
    ChannelAftertouch {
        /// Channel 0..=15.
        channel: u8,
        /// Pressure value.
        pressure: u8,
    },
    /// Pitch wheel, 14-bit centre 8192.
    PitchBend {
        /// Channel 0..=15.
        channel: u8,
        /// Wheel position 0..=16383.
        value: u16,
    },
    /// System Exclusive; `data` holds the framed bytes including `F0`/`F7`.
    SystemExclusive {
        /// Framed message bytes.
        data: Vec<u8>,
    },
    /// MIDI time code quarter frame.
    TimeCodeQuarterFrame {
        /// Message-type and value nibbles.
        value: u8,
    },
    /// Song position pointer, 14-bit beat count.
    SongPosition {
        /// Position 0..=16383 in MIDI beats.
        beats: u16,
    },
    /// Song select.
    SongSelect {
        /// Song number.
        song: u8,
    },
    /// Tune request.
    TuneRequest,
    /// Realtime timing clock.
    TimingClock,
    /// Realtime start.
    Start,
    /// Realtime continue.
    Continue,
    /// Realtime stop.
    Stop,
    /// Realtime active sensing.
    ActiveSensing,
    /// Realtime system reset.
    Reset,
}

impl MidiCommand {
    /// The status byte this command is emitted with.
    #[must_use]
    pub fn status_byte(&self) -> u8 {
        match self {
            Self::NoteOff { channel, .. } => 0x80 | (channel & 0x0F),
            Self::NoteOn { channel, .. } => 0x90 | (channel & 0x0F),
            Self::PolyAftertouch { channel, .. } => 0xA0 | (channel & 0x0F),
            Self::ControlChange { channel, .. } => 0xB0 | (channel & 0x0F),
            Self::ProgramChange { channel, .. } => 0xC0 | (channel & 0x0F),
            Self::ChannelAftertouch { channel, .. } => 0xD0 | (channel & 0x0F),
            Self::PitchBend { channel, .. } => 0xE0 | (channel & 0x0F),
            Self::SystemExclusive { .. } => 0xF0,
            Self::TimeCodeQuarterFrame { .. } => 0xF1,
            Self::SongPosition { .. } => 0xF2,
            Self::SongSelect { .. } => 0xF3,
            Self::TuneRequest => 0xF6,
            Self::TimingClock => 0xF8,
            Self::Start => 0xFA,
            Self::Continue => 0xFB,
            Self::Stop => 0xFC,
            Self::ActiveSensing => 0xFE,
            Self::Reset => 0xFF,
        }
    }

    /// True for one-byte realtime commands (status `0xF8..=0xFF`).
    #[must_use]
    pub fn is_realtime(&self) -> bool {
        self.status_byte() >= 0xF8
    }

    /// Append the raw MIDI bytes of this command, data bytes masked to
    /// seven bits.
    pub fn write(&self, out: &mut Vec<u8>) {
        match self {
            Self::NoteOff { note, velocity, .. }
            | Self::NoteOn { note, velocity, .. } => {
                out.push(self.status_byte());
                out.push(note & 0x7F);
                out.push(velocity & 0x7F);
            }
            Self::PolyAftertouch { note, pressure, .. } => {
                out.push(self.status_byte());
                out.push(note & 0x7F);
                out.push(pressure & 0x7F);
            }
            Self::ControlChange { control, value, .. } => {
                out.push(self.status_byte());
                out.push(control & 0x7F);
                out.push(value & 0x7F);
            }
            Self::ProgramChange { program, .. } => {
                out.push(self.status_byte());
                out.push(program & 0x7F);
            }
            Self::ChannelAftertouch { pressure, .. } => {
                out.push(self.status_byte());
                out.push(pressure & 0x7F);
            }
            Self::PitchBend { value, .. } => {
                out.push(self.status_byte());
                out.push((value & 0x7F) as u8);
                out.push(((value >> 7) & 0x7F) as u8);
            }
            Self::SystemExclusive { data } => {
                out.extend_from_slice(data);
            }
            Self::TimeCodeQuarterFrame { value } => {
                out.push(self.status_byte());
                out.push(value & 0x7F);
            }
            Self::SongPosition { beats } => {
                out.push(self.status_byte());
                out.push((beats & 0x7F) as u8);
                out.push(((beats >> 7) & 0x7F) as u8);
            }
            Self::SongSelect { song } => {
                out.push(self.status_byte());
                out.push(song & 0x7F);
            }
            Self::TuneRequest
            | Self::TimingClock
            | Self::Start
            | Self::Continue
            | Self::Stop
            | Self::ActiveSensing
            | Self::Reset => {
                out.push(self.status_byte());
            }
        }
    }

    /// The raw MIDI bytes of this command.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3);
        self.write(&mut out);
        out
    }
}

/// Command-list decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandDecodeError {
    /// The section ended in the middle of a delta-time or command.
    #[error("truncated command list")]
    Truncated,

    /// A data byte appeared with no running status to interpret it under.
    #[error("data byte {0:02x} with no running status")]
    OrphanDataByte(u8),

    /// A status byte this codec does not decode (`F4`/`F5`).
    #[error("unsupported status byte: {0:02x}")]
    UnsupportedStatus(u8),

    /// A delta-time ran past its four-byte limit.
    #[error("delta-time exceeds four bytes")]
    DeltaTimeOverflow,
}

/// Append a variable-length delta-time (1–4 bytes, 7 bits per byte).
pub fn encode_delta_time(value: u32, out: &mut Vec<u8>) {
    let value = value.min(MAX_DELTA_TIME);
    let mut shifted = [0u8; 4];
    let mut count = 0;
    let mut v = value;
    loop {
        shifted[count] = (v & 0x7F) as u8;
        count += 1;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    for i in (0..count).rev() {
        let continuation = if i == 0 { 0 } else { 0x80 };
        out.push(shifted[i] | continuation);
    }
}

/// Decode a variable-length delta-time from the front of `buf`.
///
/// # Errors
///
/// `Truncated` when the buffer ends before a terminating byte,
/// `DeltaTimeOverflow` when four bytes pass without one.
pub fn decode_delta_time(buf: &[u8]) -> Result<(u32, usize), CommandDecodeError> {
    let mut value: u32 = 0;
    for (i, &byte) in buf.iter().take(4).enumerate() {
        value = (value << 7) | u32::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() < 4 {
        Err(CommandDecodeError::Truncated)
    } else {
        Err(CommandDecodeError::DeltaTimeOverflow)
    }
}

/// A command paired with the delta-time that preceded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedCommand {
    /// Media-clock ticks since the previous command (0 for the first command
    /// of a packet with `Z = 0`).
    pub delta_time: u32,
    /// The decoded command.
    pub command: MidiCommand,
}

/// Stateful command-list decoder.
///
/// Running status and SysEx-continuation state survive across packets, so a
/// session keeps one decoder per participant.
#[derive(Debug, Default)]
pub struct CommandDecoder {
    running_status: Option<u8>,
    in_sysex: bool,
}

impl CommandDecoder {
    /// Fresh decoder with no running status.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a segmented SysEx is waiting for its continuation.
    #[must_use]
    pub fn awaiting_sysex_continuation(&self) -> bool {
        self.in_sysex
    }

    /// Decode one packet's command section.
    ///
    /// `first_has_delta` is the packet's `Z` flag. Consumes the whole
    /// section; a SysEx cut off by the end of the section is emitted with a
    /// synthetic terminating `F7` and resumed by the next call.
    ///
    /// # Errors
    ///
    /// Any [`CommandDecodeError`]; the caller should drop the rest of the
    /// section.
    pub fn decode_section(
        &mut self,
        section: &[u8],
        first_has_delta: bool,
    ) -> Result<Vec<TimedCommand>, CommandDecodeError> {
        let mut out = Vec::new();
        let mut pos = 0;
        let mut first = true;

        while pos < section.len() {
            let delta_time = if first && !first_has_delta {
                0
            } else {
                let (delta, used) = decode_delta_time(&section[pos..])?;
                pos += used;
                delta
            };
            first = false;

            if pos >= section.len() {
                return Err(CommandDecodeError::Truncated);
            }

            if self.in_sysex {
                let (command, used) = self.continue_sysex(&section[pos..]);
                pos += used;
                out.push(TimedCommand {
                    delta_time,
                    command,
                });
                continue;
            }

            let byte = section[pos];
            let (status, status_len) = if byte & 0x80 == 0 {
                match self.running_status {
                    Some(status) => (status, 0),
                    None => return Err(CommandDecodeError::OrphanDataByte(byte)),
                }
            } else {
                (byte, 1)
            };
            pos += status_len;

            // Running status: channel voice replaces, system common clears,
            // realtime leaves it untouched.
            match status {
                0x80..=0xEF => self.running_status = Some(status),
                0xF0..=0xF7 => self.running_status = None,
                _ => {}
            }

            match self.decode_command(status, &section[pos..])? {
                (Some(command), used) => {
                    pos += used;
                    out.push(TimedCommand {
                        delta_time,
                        command,
                    });
                }
                (None, used) => pos += used,
            }
        }

        Ok(out)
    }

    fn decode_command(
        &mut self,
        status: u8,
        data: &[u8],
    ) -> Result<(Option<MidiCommand>, usize), CommandDecodeError> {
        let channel = status & 0x0F;
        match status & 0xF0 {
            0x80 => {
                let [note, velocity] = take::<2>(data)?;
                return Ok((
                    Some(MidiCommand::NoteOff {
                        channel,
                        note,
                        velocity,
                    }),
                    2,
                ));
            }
            0x90 => {
                let [note, velocity] = take::<2>(data)?;
                return Ok((
                    Some(MidiCommand::NoteOn {
                        channel,
                        note,
                        velocity,
                    }),
                    2,
                ));
            }
            0xA0 => {
                let [note, pressure] = take::<2>(data)?;
                return Ok((
                    Some(MidiCommand::PolyAftertouch {
                        channel,
                        note,
                        pressure,
                    }),
                    2,
                ));
            }
            0xB0 => {
                let [control, value] = take::<2>(data)?;
                return Ok((
                    Some(MidiCommand::ControlChange {
                        channel,
                        control,
                        value,
                    }),
                    2,
                ));
            }
            0xC0 => {
                let [program] = take::<1>(data)?;
                return Ok((Some(MidiCommand::ProgramChange { channel, program }), 1));
            }
            0xD0 => {
                let [pressure] = take::<1>(data)?;
                return Ok((
                    Some(MidiCommand::ChannelAftertouch { channel, pressure }),
                    1,
                ));
            }
            0xE0 => {
                let [lsb, msb] = take::<2>(data)?;
                let value = u16::from(lsb & 0x7F) | (u16::from(msb & 0x7F) << 7);
                return Ok((Some(MidiCommand::PitchBend { channel, value }), 2));
            }
            _ => {}
        }

        match status {
            0xF0 => {
                let (command, used) = self.start_sysex(data);
                Ok((Some(command), used))
            }
            0xF1 => {
                let [value] = take::<1>(data)?;
                Ok((Some(MidiCommand::TimeCodeQuarterFrame { value }), 1))
            }
            0xF2 => {
                let [lsb, msb] = take::<2>(data)?;
                let beats = u16::from(lsb & 0x7F) | (u16::from(msb & 0x7F) << 7);
                Ok((Some(MidiCommand::SongPosition { beats }), 2))
            }
            0xF3 => {
                let [song] = take::<1>(data)?;
                Ok((Some(MidiCommand::SongSelect { song }), 1))
            }
            0xF6 => Ok((Some(MidiCommand::TuneRequest), 0)),
            // Stray end-of-exclusive outside a segmented message: skip.
            0xF7 => Ok((None, 0)),
            0xF8 => Ok((Some(MidiCommand::TimingClock), 0)),
            0xFA => Ok((Some(MidiCommand::Start), 0)),
            0xFB => Ok((Some(MidiCommand::Continue), 0)),
            0xFC => Ok((Some(MidiCommand::Stop), 0)),
            0xFE => Ok((Some(MidiCommand::ActiveSensing), 0)),
            0xFF => Ok((Some(MidiCommand::Reset), 0)),
            // Undefined realtime: consume without desynchronizing the stream.
            0xF9 | 0xFD => Ok((None, 0)),
            other => Err(CommandDecodeError::UnsupportedStatus(other)),
        }
    }

    /// Scan a SysEx body starting after its `F0`. A nested `F0` or the end
    /// of the section splits the message: the partial body is emitted with a
    /// synthetic `F7` and the decoder waits for the continuation.
    fn start_sysex(&mut self, data: &[u8]) -> (MidiCommand, usize) {
        self.collect_sysex(data, 0)
    }

    /// Resume a split SysEx. The encoder opens continuation segments with
    /// `F7`; that marker is skipped before collecting.
    fn continue_sysex(&mut self, data: &[u8]) -> (MidiCommand, usize) {
        let skip = usize::from(data.first() == Some(&0xF7));
        let (command, used) = self.collect_sysex(&data[skip..], skip);
        (command, used)
    }

    fn collect_sysex(&mut self, data: &[u8], already_consumed: usize) -> (MidiCommand, usize) {
        let mut body = Vec::with_capacity(data.len() + 2);
        body.push(0xF0);

        for (i, &byte) in data.iter().enumerate() {
            match byte {
                0xF7 => {
                    body.push(0xF7);
                    self.in_sysex = false;
                    return (
                        MidiCommand::SystemExclusive { data: body },
                        already_consumed + i + 1,
                    );
                }
                0xF0 => {
                    body.push(0xF7);
                    self.in_sysex = true;
                    return (
                        MidiCommand::SystemExclusive { data: body },
                        already_consumed + i + 1,
                    );
                }
                _ => body.push(byte),
            }
        }

        body.push(0xF7);
        self.in_sysex = true;
        (
            MidiCommand::SystemExclusive { data: body },
            already_consumed + data.len(),
        )
    }
}

fn take<const N: usize>(data: &[u8]) -> Result<[u8; N], CommandDecodeError> {
    data.get(..N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(CommandDecodeError::Truncated)
}
