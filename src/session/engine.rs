//! The session engine: socket ownership, the participant table, and the
//! per-tick protocol passes.
//!
//! The engine is pumped by the driver at a fixed cadence. Every pass that
//! wants to transmit queues datagrams on a tick-local outbox which is sent
//! in one batch at the end of the tick, so socket I/O stays on the driver
//! task and no borrows are held across await points.

use std::io;
use std::net::SocketAddr;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::MediaClock;
use crate::error::{ErrorKind, Result, RtpMidiError};
use crate::event::Listeners;
use crate::participant::{InviteState, Participant, ParticipantKind, ParticipantStats};
use crate::protocol::control::{
    ClockSyncExchange, ControlDecodeError, ControlPacket, Invitation, SIGNATURE,
};
use crate::protocol::midi::MidiCommand;
use crate::protocol::rtp::{decode_midi_packet, RtpHeader};

use super::config::SessionConfig;

/// Bound on the participant table.
pub(crate) const MAX_PARTICIPANTS: usize = 64;

const MAX_DATAGRAM: usize = 2048;
const INVITE_RETRY_MS: u64 = 1_000;
const MAX_INVITE_ATTEMPTS: u8 = 13;
const SYNC_HEARTBEAT_MS: u64 = 10_000;
const SYNC_RETRY_MS: u64 = 10_000;
const MAX_CK0_ATTEMPTS: u8 = 5;
const CK_MAX_TIMEOUT_MS: u64 = 61_000;
const FEEDBACK_DELAY_MS: u64 = 1_000;

/// A connected peer as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Opaque handle used by the send API.
    pub device_id: String,
    /// Peer's session name.
    pub name: String,
    /// Peer's synchronization source.
    pub ssrc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Port {
    Control,
    Data,
}

struct Outgoing {
    port: Port,
    addr: SocketAddr,
    bytes: Vec<u8>,
}

impl Outgoing {
    fn control(addr: SocketAddr, packet: &ControlPacket) -> Self {
        Self {
            port: Port::Control,
            addr,
            bytes: packet.encode(),
        }
    }

    fn data(addr: SocketAddr, packet: &ControlPacket) -> Self {
        Self {
            port: Port::Data,
            addr,
            bytes: packet.encode(),
        }
    }

    fn midi(addr: SocketAddr, bytes: Vec<u8>) -> Self {
        Self {
            port: Port::Data,
            addr,
            bytes,
        }
    }
}

pub(crate) struct Engine {
    config: SessionConfig,
    local_ssrc: u32,
    clock: MediaClock,
    control_socket: UdpSocket,
    data_socket: UdpSocket,
    participants: Vec<Participant>,
    listeners: Listeners,
}

impl Engine {
    /// Bind both sockets and allocate the session ssrc.
    pub async fn bind(config: SessionConfig, listeners: Listeners) -> io::Result<Self> {
        let control_socket = UdpSocket::bind((config.bind_address, config.port)).await?;
        let data_socket = UdpSocket::bind((config.bind_address, config.port + 1)).await?;
        let local_ssrc: u32 = rand::thread_rng().gen();

        info!(
            name = %config.name,
            port = config.port,
            ssrc = local_ssrc,
            "session started"
        );

        Ok(Self {
            clock: MediaClock::new(config.clock_rate),
            config,
            local_ssrc,
            control_socket,
            data_socket,
            participants: Vec::new(),
            listeners,
        })
    }

    pub fn local_ssrc(&self) -> u32 {
        self.local_ssrc
    }

    /// One engine iteration: drain, parse, dispatch, invite, sync, feedback,
    /// flush.
    pub async fn tick(&mut self) {
        let now = Instant::now();
        let mut out = Vec::new();

        self.drain_sockets(now, &mut out);
        self.parse_participant_inbound(now);
        self.dispatch_decoded();
        self.invitation_pass(now, &mut out);
        self.sync_pass(now, &mut out);
        self.feedback_pass(now, &mut out);
        self.flush_outbound(&mut out);

        self.send_all(out).await;
    }

    /// Send BY to every peer and empty the table.
    pub async fn end(&mut self) {
        let mut out = Vec::new();
        for i in (0..self.participants.len()).rev() {
            let bye = ControlPacket::EndSession {
                token: self.participants[i].initiator_token,
                ssrc: self.local_ssrc,
            };
            out.push(Outgoing::control(self.participants[i].control_addr, &bye));
            self.remove_participant(i, None);
        }
        self.send_all(out).await;
        info!(port = self.config.port, "session ended");
    }

    // ---- host API --------------------------------------------------------

    /// Register an outbound invitation; the next tick starts the handshake.
    pub fn connect_to_listener(&mut self, addr: SocketAddr) -> Result<()> {
        if self.participants.len() >= MAX_PARTICIPANTS {
            return Err(RtpMidiError::TooManyParticipants);
        }
        let participant = Participant::new_initiator(addr, Instant::now());
        debug!(peer = %addr, token = participant.initiator_token, "invitation queued");
        self.participants.push(participant);
        Ok(())
    }

    /// Append a command to a participant's outbound buffer.
    pub fn queue_midi(&mut self, device_id: &str, command: &MidiCommand) -> Result<()> {
        let index = self
            .resolve_device(device_id)
            .ok_or_else(|| RtpMidiError::UnknownDevice {
                device_id: device_id.to_string(),
            })?;
        let timestamp = self.clock.rtp_timestamp();
        let local_ssrc = self.local_ssrc;

        if self.participants[index].queue_command(command, timestamp, local_ssrc) {
            Ok(())
        } else {
            self.listeners.error(ErrorKind::BufferFull);
            Err(RtpMidiError::BufferFull {
                device_id: device_id.to_string(),
            })
        }
    }

    /// Peer name and ssrc for a device id.
    pub fn device_name(&self, device_id: &str) -> Option<(String, u32)> {
        let index = self.resolve_device(device_id)?;
        let participant = &self.participants[index];
        Some((participant.session_name.clone(), participant.ssrc))
    }

    /// Snapshot of every participant.
    pub fn participants(&self) -> Vec<DeviceInfo> {
        self.participants
            .iter()
            .map(|p| DeviceInfo {
                device_id: p.device_id(self.config.port),
                name: p.session_name.clone(),
                ssrc: p.ssrc,
            })
            .collect()
    }

    /// Counter snapshot for one participant.
    pub fn participant_stats(&self, device_id: &str) -> Option<ParticipantStats> {
        self.resolve_device(device_id)
            .map(|index| self.participants[index].stats())
    }

    fn resolve_device(&self, device_id: &str) -> Option<usize> {
        let ssrc = self.parse_device_id(device_id)?;
        self.participants.iter().position(|p| p.ssrc == ssrc)
    }

    fn parse_device_id(&self, device_id: &str) -> Option<u32> {
        let mut parts = device_id.split(':');
        if parts.next() != Some("RtpMidi") {
            return None;
        }
        let port: u16 = parts.next()?.parse().ok()?;
        if port != self.config.port {
            return None;
        }
        let ssrc: u32 = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(ssrc)
    }

    // ---- receive path ----------------------------------------------------

    fn drain_sockets(&mut self, now: Instant, out: &mut Vec<Outgoing>) {
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            match self.control_socket.try_recv_from(&mut buf) {
                Ok((len, src)) => {
                    let datagram = buf[..len].to_vec();
                    self.parse_control_stream(&datagram, src, Port::Control, now, out);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("control socket receive failed: {e}");
                    break;
                }
            }
        }

        loop {
            match self.data_socket.try_recv_from(&mut buf) {
                Ok((len, src)) => {
                    let datagram = buf[..len].to_vec();
                    self.process_data_datagram(&datagram, src, now, out);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("data socket receive failed: {e}");
                    break;
                }
            }
        }
    }

    /// Parse as many control PDUs as the datagram holds. A bad byte is
    /// skipped and parsing resumes; a truncated PDU drops the remainder.
    fn parse_control_stream(
        &mut self,
        datagram: &[u8],
        src: SocketAddr,
        port: Port,
        now: Instant,
        out: &mut Vec<Outgoing>,
    ) {
        let kind = match port {
            Port::Control => ErrorKind::Parse,
            Port::Data => ErrorKind::UnexpectedParse,
        };
        let mut data = &datagram[..];
        let mut reported = false;

        while !data.is_empty() {
            match ControlPacket::decode(data) {
                Ok((packet, consumed)) => {
                    data = &data[consumed..];
                    self.handle_control(packet, src, port, now, out);
                }
                Err(ControlDecodeError::NotEnoughData { .. }) => {
                    debug!(peer = %src, "truncated control PDU");
                    self.listeners.error(kind);
                    break;
                }
                Err(ControlDecodeError::UnsupportedVersion(version)) => {
                    debug!(peer = %src, version, "protocol version mismatch");
                    self.listeners.error(kind);
                    break;
                }
                Err(_) => {
                    if !reported {
                        self.listeners.error(kind);
                        reported = true;
                    }
                    data = &data[1..];
                }
            }
        }
    }

    /// Data-port datagram: AppleMIDI PDUs are handled directly; anything
    /// else must look like RTP and is fanned out to every participant's
    /// buffer (peers are told apart by the ssrc inside the header).
    fn process_data_datagram(
        &mut self,
        datagram: &[u8],
        src: SocketAddr,
        now: Instant,
        out: &mut Vec<Outgoing>,
    ) {
        if datagram.len() >= 2 && datagram[0..2] == SIGNATURE {
            self.parse_control_stream(datagram, src, Port::Data, now, out);
            return;
        }

        let mut slice = &datagram[..];
        let mut reported = false;
        while RtpHeader::decode(slice).is_err() {
            if !reported {
                debug!(peer = %src, "unparseable data-port bytes");
                self.listeners.error(ErrorKind::UnexpectedParse);
                reported = true;
            }
            if slice.len() <= 1 {
                return;
            }
            slice = &slice[1..];
        }

        let validated = slice.to_vec();
        let listeners = self.listeners.clone();
        for participant in &mut self.participants {
            if !participant.push_datagram(validated.clone()) {
                listeners.error(ErrorKind::BufferFull);
            }
        }
    }

    fn parse_participant_inbound(&mut self, now: Instant) {
        let listeners = self.listeners.clone();

        for participant in &mut self.participants {
            while let Some(datagram) = participant.inbound.pop_front() {
                let packet = match decode_midi_packet(&datagram) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!("dropping malformed data packet: {e}");
                        listeners.error(ErrorKind::UnexpectedParse);
                        continue;
                    }
                };

                if participant.ssrc == 0 || packet.header.ssrc != participant.ssrc {
                    continue;
                }

                if let Some(lost) = participant.record_received_seq(packet.header.sequence) {
                    warn!(
                        ssrc = participant.ssrc,
                        lost, "sequence gap in incoming stream"
                    );
                    listeners.error(ErrorKind::ReceivedPacketsDropped);
                }

                if !participant.feedback_pending {
                    participant.feedback_pending = true;
                    participant.feedback_start = now;
                }

                match participant
                    .decoder
                    .decode_section(packet.commands, packet.section.first_has_delta)
                {
                    Ok(commands) => {
                        for command in commands {
                            if !participant.push_decoded(command) {
                                listeners.error(ErrorKind::BufferFull);
                            }
                        }
                    }
                    Err(e) => {
                        debug!(ssrc = participant.ssrc, "command list rejected: {e}");
                        listeners.error(ErrorKind::UnexpectedParse);
                    }
                }
            }
        }
    }

    fn dispatch_decoded(&mut self) {
        let listeners = self.listeners.clone();
        let port = self.config.port;

        for participant in &mut self.participants {
            if participant.decoded.is_empty() {
                continue;
            }
            let device_id = participant.device_id(port);
            while let Some(timed) = participant.decoded.pop_front() {
                listeners.midi(&device_id, &timed.command);
            }
        }
    }

    // ---- control handling ------------------------------------------------

    fn handle_control(
        &mut self,
        packet: ControlPacket,
        src: SocketAddr,
        port: Port,
        now: Instant,
        out: &mut Vec<Outgoing>,
    ) {
        match packet {
            ControlPacket::Invitation(invitation) => match port {
                Port::Control => self.handle_control_invitation(invitation, src, now, out),
                Port::Data => self.handle_data_invitation(&invitation, src, out),
            },
            ControlPacket::InvitationAccepted(invitation) => {
                self.handle_accept(&invitation, port, now);
            }
            ControlPacket::InvitationRejected(invitation) => {
                if let Some(index) = self.find_by_token(invitation.token) {
                    info!(peer = %src, "invitation rejected by peer");
                    self.remove_participant(index, None);
                }
            }
            ControlPacket::EndSession { ssrc, .. } => {
                if let Some(index) = self.find_by_ssrc(ssrc) {
                    info!(ssrc, "peer ended session");
                    self.remove_participant(index, None);
                }
            }
            ControlPacket::Synchronization(sync) => self.handle_sync(sync, now, out),
            ControlPacket::ReceiverFeedback { ssrc, seq } => {
                let Some(index) = self.find_by_ssrc(ssrc) else {
                    self.listeners.error(ErrorKind::ParticipantNotFound);
                    return;
                };
                if self.participants[index].feedback_ahead_of_sent(seq) {
                    warn!(ssrc, seq, "peer acknowledged packets we never sent");
                    self.listeners.error(ErrorKind::SendPacketsDropped);
                }
                self.participants[index].acknowledge_feedback(seq);
            }
            ControlPacket::BitrateReceiveLimit { ssrc, limit } => {
                if let Some(index) = self.find_by_ssrc(ssrc) {
                    debug!(ssrc, limit, "peer advertised receive limit");
                    self.participants[index].receive_limit = Some(limit);
                }
            }
        }
    }

    fn handle_control_invitation(
        &mut self,
        invitation: Invitation,
        src: SocketAddr,
        now: Instant,
        out: &mut Vec<Outgoing>,
    ) {
        if self.find_by_ssrc(invitation.ssrc).is_some() {
            debug!(ssrc = invitation.ssrc, "duplicate invitation ignored");
            return;
        }

        if self.participants.len() >= MAX_PARTICIPANTS {
            warn!(peer = %src, "participant table full, rejecting invitation");
            out.push(Outgoing::control(src, &self.reply(invitation.token, false)));
            self.listeners.error(ErrorKind::TooManyParticipants);
            return;
        }

        info!(peer = %src, ssrc = invitation.ssrc, name = %invitation.name, "invitation accepted");
        out.push(Outgoing::control(src, &self.reply(invitation.token, true)));
        self.participants.push(Participant::new_listener(
            invitation.ssrc,
            invitation.token,
            invitation.name,
            src,
            now,
        ));
    }

    fn handle_data_invitation(
        &mut self,
        invitation: &Invitation,
        src: SocketAddr,
        out: &mut Vec<Outgoing>,
    ) {
        let Some(index) = self.find_by_ssrc(invitation.ssrc) else {
            warn!(peer = %src, ssrc = invitation.ssrc, "data invitation from unknown ssrc");
            out.push(Outgoing::data(src, &self.reply(invitation.token, false)));
            self.listeners.error(ErrorKind::ParticipantNotFound);
            return;
        };

        out.push(Outgoing::data(src, &self.reply(invitation.token, true)));
        let participant = &mut self.participants[index];
        if participant.invite_state != InviteState::Connected {
            participant.invite_state = InviteState::Connected;
            let device_id = participant.device_id(self.config.port);
            info!(device_id = %device_id, "participant attached");
            self.listeners.attached(&device_id);
        }
    }

    fn handle_accept(&mut self, invitation: &Invitation, port: Port, now: Instant) {
        let Some(index) = self.find_by_token(invitation.token) else {
            debug!(token = invitation.token, "acceptance with unknown token");
            return;
        };
        let participant = &mut self.participants[index];

        match (port, participant.invite_state) {
            (Port::Control, InviteState::AwaitingControlOk) => {
                participant.ssrc = invitation.ssrc;
                participant.session_name = invitation.name.clone();
                participant.invite_state = InviteState::ControlAccepted;
                participant.last_invite = now;
                debug!(ssrc = invitation.ssrc, "control invitation accepted");
            }
            (Port::Data, InviteState::AwaitingDataOk) => {
                participant.invite_state = InviteState::DataAccepted;
                participant.last_invite = now;
                debug!(ssrc = participant.ssrc, "data invitation accepted");
            }
            _ => debug!("acceptance out of order, ignored"),
        }
    }

    fn handle_sync(&mut self, sync: ClockSyncExchange, now: Instant, out: &mut Vec<Outgoing>) {
        let Some(index) = self.find_by_ssrc(sync.ssrc) else {
            self.listeners.error(ErrorKind::ParticipantNotFound);
            return;
        };

        let local_now = self.clock.now().max(0) as u64;
        let local_ssrc = self.local_ssrc;
        let participant = &mut self.participants[index];
        participant.last_sync_exchange = now;

        let [ts0, ts1, ts2] = sync.timestamps;
        match sync.count {
            0 => {
                let reply = ControlPacket::Synchronization(ClockSyncExchange {
                    ssrc: local_ssrc,
                    count: 1,
                    timestamps: [ts0, local_now, 0],
                });
                out.push(Outgoing::data(participant.data_addr, &reply));
            }
            1 => {
                let reply = ControlPacket::Synchronization(ClockSyncExchange {
                    ssrc: local_ssrc,
                    count: 2,
                    timestamps: [ts0, ts1, local_now],
                });
                out.push(Outgoing::data(participant.data_addr, &reply));
                participant.synchronizing = false;
                participant.sync_count = 0;
            }
            2 => {
                let offset = (ts2 as i64 + ts0 as i64) / 2 - ts1 as i64;
                participant.offset_estimate = Some(offset);
                debug!(ssrc = sync.ssrc, offset, "clock offset updated");
            }
            other => debug!(count = other, "sync exchange with bad count ignored"),
        }
    }

    // ---- periodic passes -------------------------------------------------

    fn invitation_pass(&mut self, now: Instant, out: &mut Vec<Outgoing>) {
        let listeners = self.listeners.clone();
        let port = self.config.port;
        let local_ssrc = self.local_ssrc;
        let name = self.config.name.clone();
        let mut expired = Vec::new();

        for (i, participant) in self.participants.iter_mut().enumerate() {
            if participant.kind != ParticipantKind::Initiator {
                continue;
            }

            let invitation = ControlPacket::Invitation(Invitation {
                token: participant.initiator_token,
                ssrc: local_ssrc,
                name: name.clone(),
            });

            match participant.invite_state {
                InviteState::Initiating => {
                    out.push(Outgoing::control(participant.control_addr, &invitation));
                    participant.invite_state = InviteState::AwaitingControlOk;
                    participant.connection_attempts = 1;
                    participant.last_invite = now;
                }
                InviteState::ControlAccepted => {
                    out.push(Outgoing::data(participant.data_addr, &invitation));
                    participant.invite_state = InviteState::AwaitingDataOk;
                    participant.connection_attempts = 1;
                    participant.last_invite = now;
                }
                InviteState::AwaitingControlOk | InviteState::AwaitingDataOk => {
                    let elapsed =
                        now.saturating_duration_since(participant.last_invite).as_millis() as u64;
                    if elapsed < INVITE_RETRY_MS {
                        continue;
                    }
                    if participant.connection_attempts >= MAX_INVITE_ATTEMPTS {
                        expired.push(i);
                        continue;
                    }
                    if participant.invite_state == InviteState::AwaitingControlOk {
                        out.push(Outgoing::control(participant.control_addr, &invitation));
                    } else {
                        out.push(Outgoing::data(participant.data_addr, &invitation));
                    }
                    participant.connection_attempts += 1;
                    participant.last_invite = now;
                }
                InviteState::DataAccepted => {
                    participant.invite_state = InviteState::Connected;
                    participant.last_ck0 = now;
                    let device_id = participant.device_id(port);
                    info!(device_id = %device_id, "participant attached");
                    listeners.attached(&device_id);
                }
                InviteState::Connected => {}
            }
        }

        for i in expired.into_iter().rev() {
            warn!(
                peer = %self.participants[i].control_addr,
                "no response after {MAX_INVITE_ATTEMPTS} invitations"
            );
            let bye = ControlPacket::EndSession {
                token: self.participants[i].initiator_token,
                ssrc: self.local_ssrc,
            };
            out.push(Outgoing::control(self.participants[i].control_addr, &bye));
            self.remove_participant(i, Some(ErrorKind::NoResponseFromConnectionRequest));
        }
    }

    fn sync_pass(&mut self, now: Instant, out: &mut Vec<Outgoing>) {
        let local_ssrc = self.local_ssrc;
        let local_now = self.clock.now().max(0) as u64;
        let mut removals = Vec::new();

        for (i, participant) in self.participants.iter_mut().enumerate() {
            match participant.kind {
                ParticipantKind::Initiator => {
                    if participant.invite_state != InviteState::Connected || participant.ssrc == 0 {
                        continue;
                    }
                    let ck0 = ControlPacket::Synchronization(ClockSyncExchange {
                        ssrc: local_ssrc,
                        count: 0,
                        timestamps: [local_now, 0, 0],
                    });

                    if participant.synchronizing {
                        let stalled = now
                            .saturating_duration_since(participant.last_ck0)
                            .as_millis() as u64
                            >= SYNC_RETRY_MS;
                        if !stalled {
                            continue;
                        }
                        if participant.sync_count >= MAX_CK0_ATTEMPTS {
                            removals.push((i, ErrorKind::MaxAttempts));
                            continue;
                        }
                        out.push(Outgoing::data(participant.data_addr, &ck0));
                        participant.sync_count += 1;
                        participant.last_ck0 = now;
                    } else if participant.sync_heartbeat_due(now, SYNC_HEARTBEAT_MS) {
                        out.push(Outgoing::data(participant.data_addr, &ck0));
                        participant.synchronizing = true;
                        participant.sync_count = 1;
                        participant.last_ck0 = now;
                        participant.sync_heartbeats = participant.sync_heartbeats.saturating_add(1);
                    }
                }
                ParticipantKind::Listener => {
                    let silent = now
                        .saturating_duration_since(participant.last_sync_exchange)
                        .as_millis() as u64;
                    if silent > CK_MAX_TIMEOUT_MS {
                        removals.push((i, ErrorKind::ListenerTimeOut));
                    }
                }
            }
        }

        for (i, kind) in removals.into_iter().rev() {
            warn!(ssrc = self.participants[i].ssrc, ?kind, "removing unresponsive participant");
            let bye = ControlPacket::EndSession {
                token: self.participants[i].initiator_token,
                ssrc: self.local_ssrc,
            };
            out.push(Outgoing::control(self.participants[i].control_addr, &bye));
            self.remove_participant(i, Some(kind));
        }
    }

    fn feedback_pass(&mut self, now: Instant, out: &mut Vec<Outgoing>) {
        let local_ssrc = self.local_ssrc;

        for participant in &mut self.participants {
            if !participant.feedback_pending {
                continue;
            }
            let waited = now
                .saturating_duration_since(participant.feedback_start)
                .as_millis() as u64;
            if waited <= FEEDBACK_DELAY_MS {
                continue;
            }

            let feedback = ControlPacket::ReceiverFeedback {
                ssrc: local_ssrc,
                seq: participant.recv_seq,
            };
            out.push(Outgoing::control(participant.control_addr, &feedback));
            participant.feedback_pending = false;
            participant.feedback_sent += 1;
        }
    }

    fn flush_outbound(&mut self, out: &mut Vec<Outgoing>) {
        let timestamp = self.clock.rtp_timestamp();
        let local_ssrc = self.local_ssrc;
        let listeners = self.listeners.clone();

        for participant in &mut self.participants {
            if participant.invite_state != InviteState::Connected {
                continue;
            }
            if participant.has_outbound() && !participant.flush(timestamp, local_ssrc) {
                listeners.error(ErrorKind::BufferFull);
            }
            while let Some(datagram) = participant.pending_datagrams.pop_front() {
                out.push(Outgoing::midi(participant.data_addr, datagram));
            }
        }
    }

    // ---- helpers ---------------------------------------------------------

    fn reply(&self, token: u32, accept: bool) -> ControlPacket {
        let invitation = Invitation {
            token,
            ssrc: self.local_ssrc,
            name: self.config.name.clone(),
        };
        if accept {
            ControlPacket::InvitationAccepted(invitation)
        } else {
            ControlPacket::InvitationRejected(invitation)
        }
    }

    fn find_by_ssrc(&self, ssrc: u32) -> Option<usize> {
        if ssrc == 0 {
            return None;
        }
        self.participants.iter().position(|p| p.ssrc == ssrc)
    }

    fn find_by_token(&self, token: u32) -> Option<usize> {
        self.participants
            .iter()
            .position(|p| p.initiator_token == token)
    }

    fn remove_participant(&mut self, index: usize, kind: Option<ErrorKind>) {
        let participant = self.participants.remove(index);
        let device_id = participant.device_id(self.config.port);
        info!(device_id = %device_id, "participant detached");
        if let Some(kind) = kind {
            self.listeners.error(kind);
        }
        self.listeners.detached(&device_id);
    }

    async fn send_all(&self, out: Vec<Outgoing>) {
        for message in out {
            let socket = match message.port {
                Port::Control => &self.control_socket,
                Port::Data => &self.data_socket,
            };
            if let Err(e) = socket.send_to(&message.bytes, message.addr).await {
                warn!(peer = %message.addr, "send failed: {e}");
            }
        }
    }
}
