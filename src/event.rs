//! Host-facing callbacks.
//!
//! Listeners are plain synchronous traits invoked from the driver task
//! inside `tick()`. Implementations must return promptly and must not call
//! back into the session's send API; hand the event to a channel or queue if
//! real work has to happen.

use std::sync::Arc;

use crate::error::ErrorKind;
use crate::protocol::midi::MidiCommand;

/// Participant lifecycle callbacks.
pub trait ConnectionListener: Send + Sync {
    /// A participant completed its handshake.
    fn on_attached(&self, device_id: &str);
    /// A participant was removed (BY, NO, timeout, retry exhaustion, or
    /// session end).
    fn on_detached(&self, device_id: &str);
}

/// Per-type MIDI event callbacks.
///
/// Every method has an empty default body; hosts implement only the events
/// they care about.
#[allow(unused_variables)]
pub trait MidiListener: Send + Sync {
    /// Note off.
    fn on_note_off(&self, device_id: &str, channel: u8, note: u8, velocity: u8) {}
    /// Note on.
    fn on_note_on(&self, device_id: &str, channel: u8, note: u8, velocity: u8) {}
    /// Polyphonic key pressure.
    fn on_poly_aftertouch(&self, device_id: &str, channel: u8, note: u8, pressure: u8) {}
    /// Control change.
    fn on_control_change(&self, device_id: &str, channel: u8, control: u8, value: u8) {}
    /// Program change.
    fn on_program_change(&self, device_id: &str, channel: u8, program: u8) {}
    /// Channel pressure.
    fn on_channel_aftertouch(&self, device_id: &str, channel: u8, pressure: u8) {}
    /// Pitch wheel, 0..=16383 with centre 8192.
    fn on_pitch_wheel(&self, device_id: &str, channel: u8, amount: u16) {}
    /// System Exclusive; `data` holds the framed bytes including `F0`/`F7`.
    fn on_system_exclusive(&self, device_id: &str, data: &[u8]) {}
    /// MIDI time code quarter frame.
    fn on_time_code_quarter_frame(&self, device_id: &str, value: u8) {}
    /// Song position pointer in MIDI beats.
    fn on_song_position_pointer(&self, device_id: &str, beats: u16) {}
    /// Song select.
    fn on_song_select(&self, device_id: &str, song: u8) {}
    /// Tune request.
    fn on_tune_request(&self, device_id: &str) {}
    /// Realtime timing clock.
    fn on_timing_clock(&self, device_id: &str) {}
    /// Realtime start.
    fn on_start(&self, device_id: &str) {}
    /// Realtime continue.
    fn on_continue(&self, device_id: &str) {}
    /// Realtime stop.
    fn on_stop(&self, device_id: &str) {}
    /// Realtime active sensing.
    fn on_active_sensing(&self, device_id: &str) {}
    /// Realtime system reset.
    fn on_reset(&self, device_id: &str) {}
}

/// Non-fatal protocol error callback.
pub trait ExceptionListener: Send + Sync {
    /// A recoverable protocol condition occurred.
    fn on_error(&self, kind: ErrorKind);
}

/// The session's registered listeners.
#[derive(Clone, Default)]
pub(crate) struct Listeners {
    pub connection: Option<Arc<dyn ConnectionListener>>,
    pub midi: Option<Arc<dyn MidiListener>>,
    pub exception: Option<Arc<dyn ExceptionListener>>,
}

impl Listeners {
    pub fn attached(&self, device_id: &str) {
        if let Some(listener) = &self.connection {
            listener.on_attached(device_id);
        }
    }

    pub fn detached(&self, device_id: &str) {
        if let Some(listener) = &self.connection {
            listener.on_detached(device_id);
        }
    }

    pub fn error(&self, kind: ErrorKind) {
        if let Some(listener) = &self.exception {
            listener.on_error(kind);
        }
    }

    /// Fan a decoded command out to the per-type callback.
    pub fn midi(&self, device_id: &str, command: &MidiCommand) {
        let Some(listener) = &self.midi else {
            return;
        };
        match command {
            MidiCommand::NoteOff {
                channel,
                note,
                velocity,
            } => listener.on_note_off(device_id, *channel, *note, *velocity),
            MidiCommand::NoteOn {
                channel,
                note,
                velocity,
            } => listener.on_note_on(device_id, *channel, *note, *velocity),
            MidiCommand::PolyAftertouch {
                channel,
                note,
                pressure,
            } => listener.on_poly_aftertouch(device_id, *channel, *note, *pressure),
            MidiCommand::ControlChange {
                channel,
                control,
                value,
            } => listener.on_control_change(device_id, *channel, *control, *value),
            MidiCommand::ProgramChange { channel, program } => {
                listener.on_program_change(device_id, *channel, *program);
            }
            MidiCommand::ChannelAftertouch { channel, pressure } => {
                listener.on_channel_aftertouch(device_id, *channel, *pressure);
            }
            MidiCommand::PitchBend { channel, value } => {
                listener.on_pitch_wheel(device_id, *channel, *value);
            }
            MidiCommand::SystemExclusive { data } => {
                listener.on_system_exclusive(device_id, data);
            }
            MidiCommand::TimeCodeQuarterFrame { value } => {
                listener.on_time_code_quarter_frame(device_id, *value);
            }
            MidiCommand::SongPosition { beats } => {
                listener.on_song_position_pointer(device_id, *beats);
            }
            MidiCommand::SongSelect { song } => listener.on_song_select(device_id, *song),
            MidiCommand::TuneRequest => listener.on_tune_request(device_id),
            MidiCommand::TimingClock => listener.on_timing_clock(device_id),
            MidiCommand::Start => listener.on_start(device_id),
            MidiCommand::Continue => listener.on_continue(device_id),
            MidiCommand::Stop => listener.on_stop(device_id),
            MidiCommand::ActiveSensing => listener.on_active_sensing(device_id),
            MidiCommand::Reset => listener.on_reset(device_id),
        }
    }
}
