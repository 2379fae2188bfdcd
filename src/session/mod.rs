//! The public session: builder, lifecycle, and the per-type send helpers.
//!
//! [`RtpMidiSession`] wraps the engine behind a mutex and a driver task.
//! Send and connect calls only enqueue work; all socket I/O happens on the
//! driver's tick, so the public API is safe to call from any task.

mod config;
pub(crate) mod engine;

#[cfg(test)]
mod tests;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

pub use config::SessionConfig;
pub use engine::DeviceInfo;

use crate::driver;
use crate::error::Result;
use crate::event::{ConnectionListener, ExceptionListener, Listeners, MidiListener};
use crate::participant::ParticipantStats;
use crate::protocol::midi::MidiCommand;
use engine::Engine;

/// An AppleMIDI / RTP-MIDI session bound to one control/data port pair.
pub struct RtpMidiSession {
    inner: Arc<Mutex<Engine>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Configures and starts an [`RtpMidiSession`].
pub struct SessionBuilder {
    config: SessionConfig,
    listeners: Listeners,
}

impl RtpMidiSession {
    /// Start building a session with the given name and control port.
    #[must_use]
    pub fn builder(name: impl Into<String>, port: u16) -> SessionBuilder {
        SessionBuilder {
            config: SessionConfig::new(name, port),
            listeners: Listeners::default(),
        }
    }

    /// True until `stop()` has been called.
    pub fn is_started(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the session: the driver sends BY to every peer, closes the
    /// sockets, and exits. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();
        if let Some(handle) = self.driver.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Invite a remote listener at its control endpoint. The handshake runs
    /// on the next ticks; `on_attached` fires when it completes.
    ///
    /// # Errors
    ///
    /// [`crate::RtpMidiError::NotStarted`] after `stop()`, or
    /// [`crate::RtpMidiError::TooManyParticipants`] when the table is full.
    pub async fn connect_to_listener(&self, endpoint: SocketAddr) -> Result<()> {
        self.ensure_started()?;
        self.inner.lock().await.connect_to_listener(endpoint)
    }

    /// Peer name and ssrc for a device id, when it resolves.
    pub async fn device_name(&self, device_id: &str) -> Option<(String, u32)> {
        self.inner.lock().await.device_name(device_id)
    }

    /// Snapshot of every participant.
    pub async fn participants(&self) -> Vec<DeviceInfo> {
        self.inner.lock().await.participants()
    }

    /// Counter snapshot for one participant.
    pub async fn participant_stats(&self, device_id: &str) -> Option<ParticipantStats> {
        self.inner.lock().await.participant_stats(device_id)
    }

    /// Our session ssrc.
    pub async fn local_ssrc(&self) -> u32 {
        self.inner.lock().await.local_ssrc()
    }

    // ---- send helpers ----------------------------------------------------

    /// Send a note-on.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_note_on(
        &self,
        device_id: &str,
        channel: u8,
        note: u8,
        velocity: u8,
    ) -> Result<()> {
        self.send_command(
            device_id,
            MidiCommand::NoteOn {
                channel,
                note,
                velocity,
            },
        )
        .await
    }

    /// Send a note-off.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_note_off(
        &self,
        device_id: &str,
        channel: u8,
        note: u8,
        velocity: u8,
    ) -> Result<()> {
        self.send_command(
            device_id,
            MidiCommand::NoteOff {
                channel,
                note,
                velocity,
            },
        )
        .await
    }

    /// Send polyphonic key pressure.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_poly_aftertouch(
        &self,
        device_id: &str,
        channel: u8,
        note: u8,
        pressure: u8,
    ) -> Result<()> {
        self.send_command(
            device_id,
            MidiCommand::PolyAftertouch {
                channel,
                note,
                pressure,
            },
        )
        .await
    }

    /// Send a control change.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_control_change(
        &self,
        device_id: &str,
        channel: u8,
        control: u8,
        value: u8,
    ) -> Result<()> {
        self.send_command(
            device_id,
            MidiCommand::ControlChange {
                channel,
                control,
                value,
            },
        )
        .await
    }

    /// Send a program change.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_program_change(
        &self,
        device_id: &str,
        channel: u8,
        program: u8,
    ) -> Result<()> {
        self.send_command(device_id, MidiCommand::ProgramChange { channel, program })
            .await
    }

    /// Send channel pressure.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_channel_aftertouch(
        &self,
        device_id: &str,
        channel: u8,
        pressure: u8,
    ) -> Result<()> {
        self.send_command(device_id, MidiCommand::ChannelAftertouch { channel, pressure })
            .await
    }

    /// Send a pitch-wheel position, 0..=16383 with centre 8192.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_pitch_wheel(&self, device_id: &str, channel: u8, amount: u16) -> Result<()> {
        self.send_command(
            device_id,
            MidiCommand::PitchBend {
                channel,
                value: amount & 0x3FFF,
            },
        )
        .await
    }

    /// Send a System Exclusive message. Framing `F0`/`F7` bytes are added
    /// when `data` does not already carry them. Long messages are segmented
    /// across packets automatically.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_system_exclusive(&self, device_id: &str, data: &[u8]) -> Result<()> {
        let mut framed = Vec::with_capacity(data.len() + 2);
        if data.first() != Some(&0xF0) {
            framed.push(0xF0);
        }
        framed.extend_from_slice(data);
        if framed.last() != Some(&0xF7) {
            framed.push(0xF7);
        }
        self.send_command(device_id, MidiCommand::SystemExclusive { data: framed })
            .await
    }

    /// Send a time-code quarter frame.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_time_code_quarter_frame(&self, device_id: &str, value: u8) -> Result<()> {
        self.send_command(device_id, MidiCommand::TimeCodeQuarterFrame { value })
            .await
    }

    /// Send a song select.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_song_select(&self, device_id: &str, song: u8) -> Result<()> {
        self.send_command(device_id, MidiCommand::SongSelect { song })
            .await
    }

    /// Send a song position pointer, 0..=16383 MIDI beats.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_song_position_pointer(&self, device_id: &str, beats: u16) -> Result<()> {
        self.send_command(
            device_id,
            MidiCommand::SongPosition {
                beats: beats & 0x3FFF,
            },
        )
        .await
    }

    /// Send a tune request.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_tune_request(&self, device_id: &str) -> Result<()> {
        self.send_command(device_id, MidiCommand::TuneRequest).await
    }

    /// Send a realtime timing clock.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_timing_clock(&self, device_id: &str) -> Result<()> {
        self.send_command(device_id, MidiCommand::TimingClock).await
    }

    /// Send a realtime start.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_start(&self, device_id: &str) -> Result<()> {
        self.send_command(device_id, MidiCommand::Start).await
    }

    /// Send a realtime continue.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_continue(&self, device_id: &str) -> Result<()> {
        self.send_command(device_id, MidiCommand::Continue).await
    }

    /// Send a realtime stop.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_stop(&self, device_id: &str) -> Result<()> {
        self.send_command(device_id, MidiCommand::Stop).await
    }

    /// Send a realtime active-sensing.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_active_sensing(&self, device_id: &str) -> Result<()> {
        self.send_command(device_id, MidiCommand::ActiveSensing).await
    }

    /// Send a realtime system reset.
    ///
    /// # Errors
    ///
    /// See [`RtpMidiSession::send_command`].
    pub async fn send_reset(&self, device_id: &str) -> Result<()> {
        self.send_command(device_id, MidiCommand::Reset).await
    }

    /// Queue any command for the participant behind `device_id`; the next
    /// tick frames and transmits it.
    ///
    /// # Errors
    ///
    /// [`crate::RtpMidiError::NotStarted`] after `stop()`,
    /// [`crate::RtpMidiError::UnknownDevice`] when the id does not resolve,
    /// or [`crate::RtpMidiError::BufferFull`] when the outbound queue
    /// overflowed and the bytes were dropped.
    pub async fn send_command(&self, device_id: &str, command: MidiCommand) -> Result<()> {
        self.ensure_started()?;
        self.inner.lock().await.queue_midi(device_id, &command)
    }

    fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(crate::RtpMidiError::NotStarted)
        }
    }
}

impl SessionBuilder {
    /// Local address the sockets bind to (default `0.0.0.0`).
    #[must_use]
    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.config.bind_address = address;
        self
    }

    /// Media-clock rate in Hz (default 10 kHz).
    #[must_use]
    pub fn clock_rate(mut self, rate: u32) -> Self {
        self.config.clock_rate = rate;
        self
    }

    /// Register the participant lifecycle listener.
    #[must_use]
    pub fn connection_listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.listeners.connection = Some(listener);
        self
    }

    /// Register the MIDI event listener.
    #[must_use]
    pub fn midi_listener(mut self, listener: Arc<dyn MidiListener>) -> Self {
        self.listeners.midi = Some(listener);
        self
    }

    /// Register the exception listener.
    #[must_use]
    pub fn exception_listener(mut self, listener: Arc<dyn ExceptionListener>) -> Self {
        self.listeners.exception = Some(listener);
        self
    }

    /// Bind the sockets and spawn the driver.
    ///
    /// # Errors
    ///
    /// [`crate::RtpMidiError::Io`] when either port cannot be bound.
    pub async fn start(self) -> Result<RtpMidiSession> {
        let engine = Engine::bind(self.config, self.listeners).await?;
        let inner = Arc::new(Mutex::new(engine));
        let running = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());

        let handle = driver::spawn(inner.clone(), running.clone(), shutdown.clone());

        Ok(RtpMidiSession {
            inner,
            running,
            shutdown,
            driver: Mutex::new(Some(handle)),
        })
    }
}
