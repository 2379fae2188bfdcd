//! RFC 6295 recovery journal.
//!
//! The journal summarizes session state since the last acknowledged
//! sequence number so a receiver can repair loss without retransmission.
//! Channel chapters: P (program), C (control change), W (pitch wheel),
//! N (notes), T (channel aftertouch), A (poly aftertouch). System chapters:
//! D (simple commands), V (active sensing), Q (sequencer state).
//!
//! Every chapter list is length-prefixed, so a decoder that does not care
//! about a chapter can advance past it.

use std::collections::{BTreeMap, BTreeSet};

use bytes::BufMut;
use thiserror::Error;

use super::midi::MidiCommand;

/// Journal decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JournalDecodeError {
    /// The journal section ended inside a header or chapter.
    #[error("truncated journal section")]
    Truncated,

    /// A length field disagrees with the bytes actually present.
    #[error("journal length field overruns section")]
    LengthOverrun,
}

/// Per-participant outbound journal state.
///
/// The session records every emitted command here and clears the state when
/// the peer's receiver feedback acknowledges it.
#[derive(Debug, Default)]
pub struct JournalState {
    channels: BTreeMap<u8, ChannelState>,
    system: SystemState,
}

#[derive(Debug, Default)]
struct ChannelState {
    program: Option<u8>,
    bank_msb: Option<u8>,
    bank_lsb: Option<u8>,
    controllers: BTreeMap<u8, u8>,
    pitch_wheel: Option<u16>,
    note_ons: BTreeMap<u8, u8>,
    note_offs: BTreeSet<u8>,
    channel_pressure: Option<u8>,
    poly_pressure: BTreeMap<u8, u8>,
}

#[derive(Debug, Default)]
struct SystemState {
    reset_count: u8,
    tune_request_count: u8,
    song_select: Option<u8>,
    active_sense_count: u8,
    song_position: Option<u16>,
    running: Option<bool>,
}

impl ChannelState {
    fn is_empty(&self) -> bool {
        self.program.is_none()
            && self.controllers.is_empty()
            && self.pitch_wheel.is_none()
            && self.note_ons.is_empty()
            && self.note_offs.is_empty()
            && self.channel_pressure.is_none()
            && self.poly_pressure.is_empty()
    }
}

impl SystemState {
    fn is_empty(&self) -> bool {
        self.reset_count == 0
            && self.tune_request_count == 0
            && self.song_select.is_none()
            && self.active_sense_count == 0
            && self.song_position.is_none()
            && self.running.is_none()
    }
}

impl JournalState {
    /// Fresh, empty journal state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing has been recorded since the last acknowledgement.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.values().all(ChannelState::is_empty) && self.system.is_empty()
    }

    /// Record an emitted command.
    pub fn record(&mut self, command: &MidiCommand) {
        match command {
            MidiCommand::NoteOn {
                channel,
                note,
                velocity,
            } if *velocity > 0 => {
                let ch = self.channel(*channel);
                ch.note_offs.remove(note);
                ch.note_ons.insert(*note, *velocity);
            }
            MidiCommand::NoteOn { channel, note, .. }
            | MidiCommand::NoteOff { channel, note, .. } => {
                let ch = self.channel(*channel);
                ch.note_ons.remove(note);
                ch.note_offs.insert(*note);
            }
            MidiCommand::PolyAftertouch {
                channel,
                note,
                pressure,
            } => {
                self.channel(*channel).poly_pressure.insert(*note, *pressure);
            }
            MidiCommand::ControlChange {
                channel,
                control,
                value,
            } => {
                let ch = self.channel(*channel);
                match control {
                    0 => ch.bank_msb = Some(*value),
                    32 => ch.bank_lsb = Some(*value),
                    _ => {
                        ch.controllers.insert(*control, *value);
                    }
                }
            }
            MidiCommand::ProgramChange { channel, program } => {
                self.channel(*channel).program = Some(*program);
            }
            MidiCommand::ChannelAftertouch { channel, pressure } => {
                self.channel(*channel).channel_pressure = Some(*pressure);
            }
            MidiCommand::PitchBend { channel, value } => {
                self.channel(*channel).pitch_wheel = Some(*value);
            }
            MidiCommand::Reset => {
                self.system.reset_count = (self.system.reset_count + 1) & 0x7F;
            }
            MidiCommand::TuneRequest => {
                self.system.tune_request_count = (self.system.tune_request_count + 1) & 0x7F;
            }
            MidiCommand::SongSelect { song } => self.system.song_select = Some(*song),
            MidiCommand::ActiveSensing => {
                self.system.active_sense_count = (self.system.active_sense_count + 1) & 0x7F;
            }
            MidiCommand::SongPosition { beats } => self.system.song_position = Some(*beats),
            MidiCommand::Start | MidiCommand::Continue => self.system.running = Some(true),
            MidiCommand::Stop => self.system.running = Some(false),
            // SysEx, time code, and timing clock have no recovery chapter.
            _ => {}
        }
    }

    /// Drop all recorded state; the peer has acknowledged through `seq`.
    pub fn acknowledge(&mut self, _seq: u16) {
        self.channels.clear();
        self.system = SystemState::default();
    }

    /// Encode the journal section, or `None` when there is nothing to
    /// protect.
    ///
    /// `checkpoint_seq` is the earliest sequence number the journal covers.
    #[must_use]
    pub fn encode(&self, checkpoint_seq: u16) -> Option<Vec<u8>> {
        let system = encode_system_journal(&self.system);
        let channels: Vec<(u8, Vec<u8>)> = self
            .channels
            .iter()
            .filter(|(_, state)| !state.is_empty())
            .map(|(&number, state)| (number, encode_channel_journal(number, state)))
            .collect();

        if system.is_none() && channels.is_empty() {
            return None;
        }

        let mut out = Vec::with_capacity(32);
        let mut flags = 0u8;
        if system.is_some() {
            flags |= 0x40; // Y
        }
        if !channels.is_empty() {
            flags |= 0x20; // A
            flags |= (channels.len() as u8 - 1) & 0x0F; // TOTCHAN
        }
        out.put_u8(flags);
        out.put_u16(checkpoint_seq);

        if let Some(system) = system {
            out.extend_from_slice(&system);
        }
        for (_, body) in channels {
            out.extend_from_slice(&body);
        }
        Some(out)
    }
}

impl JournalState {
    fn channel(&mut self, number: u8) -> &mut ChannelState {
        self.channels.entry(number & 0x0F).or_default()
    }
}

fn encode_system_journal(state: &SystemState) -> Option<Vec<u8>> {
    if state.is_empty() {
        return None;
    }

    let mut chapters = Vec::with_capacity(8);
    let mut flags = 0u16;

    // Chapter D: reset / tune-request counters, song select.
    if state.reset_count > 0 || state.tune_request_count > 0 || state.song_select.is_some() {
        flags |= 0x4000;
        let mut head = 0u8;
        let mut fields = Vec::with_capacity(3);
        if state.reset_count > 0 {
            head |= 0x40; // B
            fields.push(state.reset_count & 0x7F);
        }
        if state.tune_request_count > 0 {
            head |= 0x20; // G
            fields.push(state.tune_request_count & 0x7F);
        }
        if let Some(song) = state.song_select {
            head |= 0x10; // H
            fields.push(song & 0x7F);
        }
        chapters.push(head);
        chapters.extend_from_slice(&fields);
    }

    // Chapter V: active-sensing counter.
    if state.active_sense_count > 0 {
        flags |= 0x2000;
        chapters.push(state.active_sense_count & 0x7F);
    }

    // Chapter Q: sequencer run state and song position.
    if state.running.is_some() || state.song_position.is_some() {
        flags |= 0x1000;
        let mut head = 0u8;
        if state.running == Some(true) {
            head |= 0x40; // N
        }
        if state.song_position.is_some() {
            head |= 0x10; // C
        }
        chapters.push(head);
        if let Some(beats) = state.song_position {
            chapters.put_u16(beats & 0x3FFF);
        }
    }

    let length = (chapters.len() + 2) as u16 & 0x03FF;
    let mut out = Vec::with_capacity(chapters.len() + 2);
    out.put_u16(flags | length);
    out.extend_from_slice(&chapters);
    Some(out)
}

fn encode_channel_journal(number: u8, state: &ChannelState) -> Vec<u8> {
    let mut chapters = Vec::with_capacity(16);
    let mut flags = 0u8;

    // Chapter P.
    if let Some(program) = state.program {
        flags |= 0x80;
        chapters.push(program & 0x7F);
        let bank_present = state.bank_msb.is_some() || state.bank_lsb.is_some();
        let b = if bank_present { 0x80 } else { 0 };
        chapters.push(b | (state.bank_msb.unwrap_or(0) & 0x7F));
        chapters.push(state.bank_lsb.unwrap_or(0) & 0x7F);
    }

    // Chapter C.
    if !state.controllers.is_empty() {
        flags |= 0x40;
        chapters.push((state.controllers.len() as u8 - 1) & 0x7F);
        for (&control, &value) in &state.controllers {
            chapters.push(control & 0x7F);
            chapters.push(value & 0x7F);
        }
    }

    // Chapter W.
    if let Some(wheel) = state.pitch_wheel {
        flags |= 0x10;
        chapters.push(((wheel >> 7) & 0x7F) as u8);
        chapters.push((wheel & 0x7F) as u8);
    }

    // Chapter N.
    if !state.note_ons.is_empty() || !state.note_offs.is_empty() {
        flags |= 0x08;
        chapters.push(state.note_ons.len() as u8 & 0x7F);
        let (low, high) = match (state.note_offs.first(), state.note_offs.last()) {
            (Some(&first), Some(&last)) => (first / 8, last / 8),
            // LOW > HIGH signals that no offbit octets follow.
            _ => (15, 0),
        };
        chapters.push((low << 4) | (high & 0x0F));
        for (&note, &velocity) in &state.note_ons {
            chapters.push(note & 0x7F);
            chapters.push(0x80 | (velocity & 0x7F)); // Y: safe to play
        }
        if low <= high {
            let mut octets = vec![0u8; usize::from(high - low) + 1];
            for &note in &state.note_offs {
                let octet = usize::from(note / 8 - low);
                octets[octet] |= 1 << (7 - (note % 8));
            }
            chapters.extend_from_slice(&octets);
        }
    }

    // Chapter T.
    if let Some(pressure) = state.channel_pressure {
        flags |= 0x02;
        chapters.push(pressure & 0x7F);
    }

    // Chapter A.
    if !state.poly_pressure.is_empty() {
        flags |= 0x01;
        chapters.push((state.poly_pressure.len() as u8 - 1) & 0x7F);
        for (&note, &pressure) in &state.poly_pressure {
            chapters.push(note & 0x7F);
            chapters.push(pressure & 0x7F);
        }
    }

    let length = (chapters.len() + 3) as u16 & 0x03FF;
    let mut out = Vec::with_capacity(chapters.len() + 3);
    out.put_u16((u16::from(number & 0x0F) << 11) | length);
    out.put_u8(flags);
    out.extend_from_slice(&chapters);
    out
}

/// A decoded journal section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryJournal {
    /// Earliest sequence number the journal covers.
    pub checkpoint_seq: u16,
    /// System journal, when `Y = 1`.
    pub system: Option<SystemJournal>,
    /// Channel journals in ascending channel order, when `A = 1`.
    pub channels: Vec<ChannelJournal>,
}

/// Decoded system chapters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemJournal {
    /// Chapter D reset counter.
    pub reset_count: Option<u8>,
    /// Chapter D tune-request counter.
    pub tune_request_count: Option<u8>,
    /// Chapter D song-select value.
    pub song_select: Option<u8>,
    /// Chapter V active-sensing counter.
    pub active_sense_count: Option<u8>,
    /// Chapter Q run state.
    pub running: Option<bool>,
    /// Chapter Q song position.
    pub song_position: Option<u16>,
}

/// Decoded chapters for one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelJournal {
    /// Channel number 0..=15.
    pub channel: u8,
    /// Chapter P: program and optional bank.
    pub program: Option<ProgramEntry>,
    /// Chapter C entries.
    pub controllers: Vec<(u8, u8)>,
    /// Chapter W value.
    pub pitch_wheel: Option<u16>,
    /// Chapter N note-on logs.
    pub note_ons: Vec<(u8, u8)>,
    /// Chapter N note-off numbers.
    pub note_offs: Vec<u8>,
    /// Chapter T value.
    pub channel_pressure: Option<u8>,
    /// Chapter A entries.
    pub poly_pressure: Vec<(u8, u8)>,
}

/// Chapter P contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramEntry {
    /// Program number.
    pub program: u8,
    /// Bank select, when the B bit was set.
    pub bank: Option<(u8, u8)>,
}

/// Decode a journal section, returning the journal and bytes consumed.
///
/// # Errors
///
/// `Truncated` or `LengthOverrun` on malformed input.
pub fn decode_journal(buf: &[u8]) -> Result<(RecoveryJournal, usize), JournalDecodeError> {
    if buf.len() < 3 {
        return Err(JournalDecodeError::Truncated);
    }
    let flags = buf[0];
    let checkpoint_seq = u16::from_be_bytes([buf[1], buf[2]]);
    let mut pos = 3;

    let mut journal = RecoveryJournal {
        checkpoint_seq,
        ..RecoveryJournal::default()
    };

    if flags & 0x40 != 0 {
        let (system, used) = decode_system_journal(&buf[pos..])?;
        journal.system = Some(system);
        pos += used;
    }

    if flags & 0x20 != 0 {
        let count = usize::from(flags & 0x0F) + 1;
        for _ in 0..count {
            let (channel, used) = decode_channel_journal(&buf[pos..])?;
            journal.channels.push(channel);
            pos += used;
        }
    }

    Ok((journal, pos))
}

fn decode_system_journal(buf: &[u8]) -> Result<(SystemJournal, usize), JournalDecodeError> {
    if buf.len() < 2 {
        return Err(JournalDecodeError::Truncated);
    }
    let head = u16::from_be_bytes([buf[0], buf[1]]);
    let length = usize::from(head & 0x03FF);
    if length < 2 || length > buf.len() {
        return Err(JournalDecodeError::LengthOverrun);
    }

    let mut journal = SystemJournal::default();
    let mut pos = 2;
    let body = &buf[..length];

    if head & 0x4000 != 0 {
        // Chapter D.
        let dhead = *body.get(pos).ok_or(JournalDecodeError::Truncated)?;
        pos += 1;
        if dhead & 0x40 != 0 {
            journal.reset_count = Some(*body.get(pos).ok_or(JournalDecodeError::Truncated)? & 0x7F);
            pos += 1;
        }
        if dhead & 0x20 != 0 {
            journal.tune_request_count =
                Some(*body.get(pos).ok_or(JournalDecodeError::Truncated)? & 0x7F);
            pos += 1;
        }
        if dhead & 0x10 != 0 {
            journal.song_select = Some(*body.get(pos).ok_or(JournalDecodeError::Truncated)? & 0x7F);
            pos += 1;
        }
    }

    if head & 0x2000 != 0 {
        // Chapter V.
        journal.active_sense_count =
            Some(*body.get(pos).ok_or(JournalDecodeError::Truncated)? & 0x7F);
        pos += 1;
    }

    if head & 0x1000 != 0 {
        // Chapter Q.
        let qhead = *body.get(pos).ok_or(JournalDecodeError::Truncated)?;
        pos += 1;
        journal.running = Some(qhead & 0x40 != 0);
        if qhead & 0x10 != 0 {
            let bytes = body.get(pos..pos + 2).ok_or(JournalDecodeError::Truncated)?;
            journal.song_position = Some(u16::from_be_bytes([bytes[0], bytes[1]]) & 0x3FFF);
            pos += 2;
        }
    }

    Ok((journal, length))
}

fn decode_channel_journal(buf: &[u8]) -> Result<(ChannelJournal, usize), JournalDecodeError> {
    if buf.len() < 3 {
        return Err(JournalDecodeError::Truncated);
    }
    let head = u16::from_be_bytes([buf[0], buf[1]]);
    let channel = ((head >> 11) & 0x0F) as u8;
    let length = usize::from(head & 0x03FF);
    if length < 3 || length > buf.len() {
        return Err(JournalDecodeError::LengthOverrun);
    }
    let flags = buf[2];

    let mut journal = ChannelJournal {
        channel,
        ..ChannelJournal::default()
    };
    let body = &buf[..length];
    let mut pos = 3;

    if flags & 0x80 != 0 {
        // Chapter P.
        let bytes = body.get(pos..pos + 3).ok_or(JournalDecodeError::Truncated)?;
        let bank = if bytes[1] & 0x80 != 0 {
            Some((bytes[1] & 0x7F, bytes[2] & 0x7F))
        } else {
            None
        };
        journal.program = Some(ProgramEntry {
            program: bytes[0] & 0x7F,
            bank,
        });
        pos += 3;
    }

    if flags & 0x40 != 0 {
        // Chapter C.
        let count = usize::from(*body.get(pos).ok_or(JournalDecodeError::Truncated)? & 0x7F) + 1;
        pos += 1;
        for _ in 0..count {
            let bytes = body.get(pos..pos + 2).ok_or(JournalDecodeError::Truncated)?;
            journal.controllers.push((bytes[0] & 0x7F, bytes[1] & 0x7F));
            pos += 2;
        }
    }

    if flags & 0x10 != 0 {
        // Chapter W.
        let bytes = body.get(pos..pos + 2).ok_or(JournalDecodeError::Truncated)?;
        journal.pitch_wheel =
            Some((u16::from(bytes[0] & 0x7F) << 7) | u16::from(bytes[1] & 0x7F));
        pos += 2;
    }

    if flags & 0x08 != 0 {
        // Chapter N.
        let bytes = body.get(pos..pos + 2).ok_or(JournalDecodeError::Truncated)?;
        let log_count = usize::from(bytes[0] & 0x7F);
        let low = bytes[1] >> 4;
        let high = bytes[1] & 0x0F;
        pos += 2;
        for _ in 0..log_count {
            let log = body.get(pos..pos + 2).ok_or(JournalDecodeError::Truncated)?;
            journal.note_ons.push((log[0] & 0x7F, log[1] & 0x7F));
            pos += 2;
        }
        if low <= high {
            for octet_index in 0..=(high - low) {
                let octet = *body.get(pos).ok_or(JournalDecodeError::Truncated)?;
                pos += 1;
                for bit in 0..8u8 {
                    if octet & (1 << (7 - bit)) != 0 {
                        journal.note_offs.push((low + octet_index) * 8 + bit);
                    }
                }
            }
        }
    }

    if flags & 0x02 != 0 {
        // Chapter T.
        journal.channel_pressure =
            Some(*body.get(pos).ok_or(JournalDecodeError::Truncated)? & 0x7F);
        pos += 1;
    }

    if flags & 0x01 != 0 {
        // Chapter A.
        let count = usize::from(*body.get(pos).ok_or(JournalDecodeError::Truncated)? & 0x7F) + 1;
        pos += 1;
        for _ in 0..count {
            let bytes = body.get(pos..pos + 2).ok_or(JournalDecodeError::Truncated)?;
            journal.poly_pressure.push((bytes[0] & 0x7F, bytes[1] & 0x7F));
            pos += 2;
        }
    }

    Ok((journal, length))
}
