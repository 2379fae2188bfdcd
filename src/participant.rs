//! Per-peer session state.
//!
//! A participant tracks one remote peer: its endpoints, invitation progress,
//! sequence counters, clock-sync bookkeeping, and the bounded byte queues
//! between the host API and the wire.

use std::collections::VecDeque;
use std::net::SocketAddr;

use rand::Rng;
use tokio::time::Instant;

#[cfg(feature = "journal")]
use crate::protocol::journal::JournalState;
use crate::protocol::midi::{self, MidiCommand, TimedCommand};
use crate::protocol::rtp::{self, RtpHeader};

/// Bound on every per-participant queue.
pub(crate) const MAX_BUFFER: usize = 64;

/// Which side of the handshake this participant is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantKind {
    /// We invited the peer.
    Initiator,
    /// The peer invited us.
    Listener,
}

/// Invitation handshake progress for initiator participants.
///
/// Listener participants jump straight to `Connected` once the data-port
/// invitation is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteState {
    /// Created; no invitation sent yet.
    Initiating,
    /// IN sent on the control port, waiting for OK.
    AwaitingControlOk,
    /// Control-port OK received.
    ControlAccepted,
    /// IN sent on the data port, waiting for OK.
    AwaitingDataOk,
    /// Data-port OK received.
    DataAccepted,
    /// Handshake complete; sync and feedback apply.
    Connected,
}

/// Counter snapshot for one participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParticipantStats {
    /// Data packets accepted from the peer.
    pub packets_received: u64,
    /// Packets the sequence tracker saw skipped.
    pub packets_lost: u64,
    /// Receiver-feedback reports emitted for this peer.
    pub feedback_sent: u64,
    /// Clock offset from the last completed CK exchange, in media-clock
    /// ticks, when one has completed.
    pub offset_estimate: Option<i64>,
}

/// State for one remote peer.
#[derive(Debug)]
pub(crate) struct Participant {
    pub kind: ParticipantKind,
    /// Peer ssrc; 0 until learned from the first accepted handshake.
    pub ssrc: u32,
    pub control_addr: SocketAddr,
    pub data_addr: SocketAddr,
    pub invite_state: InviteState,
    pub initiator_token: u32,
    /// Next sequence number to emit.
    pub send_seq: u16,
    /// Last sequence number observed from the peer.
    pub recv_seq: u16,
    awaiting_first_packet: bool,
    pub lost_packet_count: u32,
    pub offset_estimate: Option<i64>,
    pub synchronizing: bool,
    /// CK0 sends without progress while synchronizing.
    pub sync_count: u8,
    /// Completed heartbeat rounds, for the warm-up cadence.
    pub sync_heartbeats: u8,
    pub last_invite: Instant,
    pub last_sync_exchange: Instant,
    pub last_ck0: Instant,
    pub feedback_pending: bool,
    pub feedback_start: Instant,
    pub connection_attempts: u8,
    pub session_name: String,
    pub receive_limit: Option<u32>,

    /// Raw data-port datagrams awaiting parse.
    pub inbound: VecDeque<Vec<u8>>,
    /// Decoded commands awaiting dispatch to the host.
    pub decoded: VecDeque<TimedCommand>,
    /// Open outbound MIDI buffer; closed into a packet at flush.
    outbound: Vec<u8>,
    /// Framed packets awaiting the tick's socket pass.
    pub pending_datagrams: VecDeque<Vec<u8>>,

    pub decoder: midi::CommandDecoder,
    #[cfg(feature = "journal")]
    pub journal: JournalState,
    journal_checkpoint: u16,

    pub packets_received: u64,
    pub packets_lost: u64,
    pub feedback_sent: u64,
}

impl Participant {
    /// Create an initiator-side participant for an outbound invitation.
    pub fn new_initiator(control_addr: SocketAddr, now: Instant) -> Self {
        let mut rng = rand::thread_rng();
        Self::new(
            ParticipantKind::Initiator,
            0,
            rng.gen(),
            rng.gen_range(1..0x8000),
            control_addr,
            String::new(),
            now,
        )
    }

    /// Create a listener-side participant from a received invitation.
    pub fn new_listener(
        ssrc: u32,
        token: u32,
        name: String,
        control_addr: SocketAddr,
        now: Instant,
    ) -> Self {
        let send_seq = rand::thread_rng().gen_range(1..0x8000);
        let mut participant = Self::new(
            ParticipantKind::Listener,
            ssrc,
            token,
            send_seq,
            control_addr,
            name,
            now,
        );
        participant.invite_state = InviteState::ControlAccepted;
        participant
    }

    fn new(
        kind: ParticipantKind,
        ssrc: u32,
        initiator_token: u32,
        send_seq: u16,
        control_addr: SocketAddr,
        session_name: String,
        now: Instant,
    ) -> Self {
        let data_addr = SocketAddr::new(control_addr.ip(), control_addr.port() + 1);
        Self {
            kind,
            ssrc,
            control_addr,
            data_addr,
            invite_state: InviteState::Initiating,
            initiator_token,
            send_seq,
            recv_seq: 0,
            awaiting_first_packet: true,
            lost_packet_count: 0,
            offset_estimate: None,
            synchronizing: false,
            sync_count: 0,
            sync_heartbeats: 0,
            last_invite: now,
            last_sync_exchange: now,
            last_ck0: now,
            feedback_pending: false,
            feedback_start: now,
            connection_attempts: 0,
            session_name,
            receive_limit: None,
            inbound: VecDeque::new(),
            decoded: VecDeque::new(),
            outbound: Vec::new(),
            pending_datagrams: VecDeque::new(),
            decoder: midi::CommandDecoder::new(),
            #[cfg(feature = "journal")]
            journal: JournalState::new(),
            journal_checkpoint: send_seq,
            packets_received: 0,
            packets_lost: 0,
            feedback_sent: 0,
        }
    }

    /// Host-visible handle: `RtpMidi:{listen_port}:{ssrc}`.
    pub fn device_id(&self, listen_port: u16) -> String {
        format!("RtpMidi:{listen_port}:{}", self.ssrc)
    }

    /// Queue a raw data-port datagram for the parse pass. `false` when the
    /// queue is at its bound and the datagram was dropped.
    #[must_use]
    pub fn push_datagram(&mut self, datagram: Vec<u8>) -> bool {
        if self.inbound.len() >= MAX_BUFFER {
            return false;
        }
        self.inbound.push_back(datagram);
        true
    }

    /// Queue a decoded command for dispatch. `false` on overflow.
    #[must_use]
    pub fn push_decoded(&mut self, command: TimedCommand) -> bool {
        if self.decoded.len() >= MAX_BUFFER {
            return false;
        }
        self.decoded.push_back(command);
        true
    }

    /// Track an accepted sequence number; returns the gap size when packets
    /// were skipped. The first packet is accepted silently.
    pub fn record_received_seq(&mut self, seq: u16) -> Option<u16> {
        self.packets_received += 1;
        if self.awaiting_first_packet {
            self.awaiting_first_packet = false;
            self.recv_seq = seq;
            return None;
        }

        let gap = seq.wrapping_sub(self.recv_seq).wrapping_sub(1) as i16;
        self.recv_seq = seq;
        if gap > 0 {
            let lost = gap as u16;
            self.lost_packet_count = u32::from(lost);
            self.packets_lost += u64::from(lost);
            Some(lost)
        } else {
            None
        }
    }

    /// True when the peer's feedback acknowledges a sequence number ahead of
    /// anything we have emitted.
    pub fn feedback_ahead_of_sent(&self, acked: u16) -> bool {
        // send_seq is the next number to emit, so send_seq - 1 is the newest
        // packet on the wire. Compare with 16-bit wrap.
        let newest = self.send_seq.wrapping_sub(1);
        (acked.wrapping_sub(newest) as i16) > 0
    }

    /// Acknowledge receiver feedback: journal state through `seq` can go.
    pub fn acknowledge_feedback(&mut self, seq: u16) {
        #[cfg(feature = "journal")]
        self.journal.acknowledge(seq);
        self.journal_checkpoint = seq.wrapping_add(1);
    }

    /// Whether a sync heartbeat is due, per the warm-up ladder: two rounds at
    /// 500 ms, five at 1.5 s, then every 10 s.
    pub fn sync_heartbeat_due(&self, now: Instant, heartbeat_interval_ms: u64) -> bool {
        let since = now.saturating_duration_since(self.last_ck0).as_millis() as u64;
        let required = match self.sync_heartbeats {
            0..=1 => 500,
            2..=6 => 1500,
            _ => heartbeat_interval_ms,
        };
        since >= required
    }

    /// Append one command to the open outbound buffer, spilling full buffers
    /// into framed packets. Returns `false` when the pending-packet queue
    /// overflowed and bytes were dropped.
    #[must_use]
    pub fn queue_command(
        &mut self,
        command: &MidiCommand,
        timestamp: u32,
        local_ssrc: u32,
    ) -> bool {
        #[cfg(feature = "journal")]
        self.journal.record(command);

        let bytes = command.to_bytes();
        if let MidiCommand::SystemExclusive { .. } = command {
            return self.queue_sysex(&bytes, timestamp, local_ssrc);
        }

        let separator = usize::from(!self.outbound.is_empty());
        if self.outbound.len() + separator + bytes.len() > MAX_BUFFER {
            if !self.flush(timestamp, local_ssrc) {
                return false;
            }
        } else if separator == 1 {
            self.outbound.push(0x00);
        }
        self.outbound.extend_from_slice(&bytes);
        true
    }

    /// SysEx spill: close an over-full buffer with `F0` (continuation),
    /// frame it, and resume the next buffer with `F7`.
    fn queue_sysex(&mut self, bytes: &[u8], timestamp: u32, local_ssrc: u32) -> bool {
        if !self.outbound.is_empty() {
            if self.outbound.len() + 2 > MAX_BUFFER {
                if !self.flush(timestamp, local_ssrc) {
                    return false;
                }
            } else {
                self.outbound.push(0x00);
            }
        }

        for &byte in bytes {
            if self.outbound.len() + 2 > MAX_BUFFER {
                self.outbound.push(0xF0);
                if !self.flush(timestamp, local_ssrc) {
                    return false;
                }
                self.outbound.push(0xF7);
            }
            self.outbound.push(byte);
        }
        true
    }

    /// Close the open buffer into a framed RTP-MIDI packet on the pending
    /// queue. Returns `false` when the queue is full (the buffer is dropped).
    #[must_use]
    pub fn flush(&mut self, timestamp: u32, local_ssrc: u32) -> bool {
        if self.outbound.is_empty() {
            return true;
        }

        let commands = std::mem::take(&mut self.outbound);
        if self.pending_datagrams.len() >= MAX_BUFFER {
            return false;
        }

        let header = RtpHeader {
            sequence: self.send_seq,
            timestamp,
            ssrc: local_ssrc,
        };
        self.send_seq = self.send_seq.wrapping_add(1);

        #[cfg(feature = "journal")]
        let journal = self.journal.encode(self.journal_checkpoint);
        #[cfg(not(feature = "journal"))]
        let journal: Option<Vec<u8>> = None;

        let packet = rtp::encode_midi_packet(header, &commands, journal.as_deref());
        self.pending_datagrams.push_back(packet);
        true
    }

    /// True when the open buffer holds bytes to flush.
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ParticipantStats {
        ParticipantStats {
            packets_received: self.packets_received,
            packets_lost: self.packets_lost,
            feedback_sent: self.feedback_sent,
            offset_estimate: self.offset_estimate,
        }
    }
}
