use std::io;
use thiserror::Error;

/// Non-fatal protocol conditions reported through the exception listener.
///
/// None of these end the session; the engine recovers by dropping the
/// offending bytes or removing the offending participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An inbound or outbound byte buffer would exceed its bound; the new
    /// bytes were dropped.
    BufferFull,
    /// A control-port PDU was unrecognised or its signature did not match;
    /// one byte was discarded and parsing resumed.
    Parse,
    /// Data-port bytes parsed as neither RTP-MIDI nor AppleMIDI; one byte
    /// was discarded and parsing resumed.
    UnexpectedParse,
    /// An incoming invitation was rejected because the participant table is
    /// full.
    TooManyParticipants,
    /// A CK, RS, or data-port invitation referenced an unknown ssrc.
    ParticipantNotFound,
    /// A listener participant went silent past the sync timeout and was
    /// removed.
    ListenerTimeOut,
    /// An initiator exhausted its clock-sync retries and was removed.
    MaxAttempts,
    /// An initiator exhausted its invitation retries and was removed.
    NoResponseFromConnectionRequest,
    /// Receiver feedback acknowledged a sequence number ahead of ours; the
    /// peer observed loss on packets we sent.
    SendPacketsDropped,
    /// An incoming sequence number skipped one or more packets.
    ReceivedPacketsDropped,
}

/// Errors returned by the public session API.
#[derive(Debug, Error)]
pub enum RtpMidiError {
    /// Socket I/O failed.
    #[error("network error: {0}")]
    Io(#[from] io::Error),

    /// The session has not been started or has already been stopped.
    #[error("session not started")]
    NotStarted,

    /// No participant matches the given device id.
    #[error("unknown device: {device_id}")]
    UnknownDevice {
        /// The device id that failed to resolve.
        device_id: String,
    },

    /// The participant's outbound buffer cannot accept more bytes.
    #[error("outbound buffer full for {device_id}")]
    BufferFull {
        /// The device the write was addressed to.
        device_id: String,
    },

    /// The participant table already holds the maximum number of peers.
    #[error("participant table full")]
    TooManyParticipants,
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, RtpMidiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RtpMidiError::UnknownDevice {
            device_id: "RtpMidi:5004:1234".to_string(),
        };
        assert_eq!(err.to_string(), "unknown device: RtpMidi:5004:1234");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "in use");
        let err: RtpMidiError = io_err.into();
        assert!(matches!(err, RtpMidiError::Io(_)));
    }

    #[test]
    fn test_error_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RtpMidiError>();
        assert_send_sync::<ErrorKind>();
    }
}
