//! Wire formats: AppleMIDI control PDUs, RTP-MIDI packets, and the MIDI
//! command-list codec.

pub mod control;
#[cfg(feature = "journal")]
pub mod journal;
pub mod midi;
pub mod rtp;

#[cfg(all(test, feature = "journal"))]
mod journal_tests;
