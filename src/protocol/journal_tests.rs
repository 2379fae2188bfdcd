use super::journal::{decode_journal, JournalDecodeError, JournalState, ProgramEntry};
use super::midi::MidiCommand;

fn note_on(channel: u8, note: u8, velocity: u8) -> MidiCommand {
    MidiCommand::NoteOn {
        channel,
        note,
        velocity,
    }
}

#[test]
fn test_empty_state_encodes_nothing() {
    let state = JournalState::new();
    assert!(state.is_empty());
    assert!(state.encode(1).is_none());
}

#[test]
fn test_acknowledge_clears_state() {
    let mut state = JournalState::new();
    state.record(&note_on(0, 60, 100));
    assert!(!state.is_empty());

    state.acknowledge(10);
    assert!(state.is_empty());
    assert!(state.encode(11).is_none());
}

#[test]
fn test_checkpoint_seq_carried() {
    let mut state = JournalState::new();
    state.record(&note_on(0, 60, 100));
    let bytes = state.encode(0xBEEF).unwrap();

    let (journal, consumed) = decode_journal(&bytes).unwrap();
    assert_eq!(journal.checkpoint_seq, 0xBEEF);
    assert_eq!(consumed, bytes.len());
}

#[test]
fn test_note_chapter_roundtrip() {
    let mut state = JournalState::new();
    state.record(&note_on(3, 60, 100));
    state.record(&note_on(3, 64, 90));
    state.record(&MidiCommand::NoteOff {
        channel: 3,
        note: 62,
        velocity: 0,
    });

    let bytes = state.encode(7).unwrap();
    let (journal, _) = decode_journal(&bytes).unwrap();

    assert!(journal.system.is_none());
    assert_eq!(journal.channels.len(), 1);
    let channel = &journal.channels[0];
    assert_eq!(channel.channel, 3);
    assert_eq!(channel.note_ons, vec![(60, 100), (64, 90)]);
    assert_eq!(channel.note_offs, vec![62]);
}

#[test]
fn test_note_on_then_off_moves_to_offbits() {
    let mut state = JournalState::new();
    state.record(&note_on(0, 60, 100));
    state.record(&MidiCommand::NoteOff {
        channel: 0,
        note: 60,
        velocity: 0,
    });

    let bytes = state.encode(1).unwrap();
    let (journal, _) = decode_journal(&bytes).unwrap();
    let channel = &journal.channels[0];
    assert!(channel.note_ons.is_empty());
    assert_eq!(channel.note_offs, vec![60]);
}

#[test]
fn test_note_on_velocity_zero_is_off() {
    let mut state = JournalState::new();
    state.record(&note_on(0, 72, 0));

    let bytes = state.encode(1).unwrap();
    let (journal, _) = decode_journal(&bytes).unwrap();
    assert_eq!(journal.channels[0].note_offs, vec![72]);
}

#[test]
fn test_program_and_bank_chapter() {
    let mut state = JournalState::new();
    state.record(&MidiCommand::ControlChange {
        channel: 2,
        control: 0,
        value: 1,
    });
    state.record(&MidiCommand::ControlChange {
        channel: 2,
        control: 32,
        value: 5,
    });
    state.record(&MidiCommand::ProgramChange {
        channel: 2,
        program: 40,
    });

    let bytes = state.encode(1).unwrap();
    let (journal, _) = decode_journal(&bytes).unwrap();
    assert_eq!(
        journal.channels[0].program,
        Some(ProgramEntry {
            program: 40,
            bank: Some((1, 5)),
        })
    );
    // Bank selects are folded into chapter P, not chapter C.
    assert!(journal.channels[0].controllers.is_empty());
}

#[test]
fn test_controller_and_wheel_chapters() {
    let mut state = JournalState::new();
    state.record(&MidiCommand::ControlChange {
        channel: 0,
        control: 7,
        value: 100,
    });
    state.record(&MidiCommand::ControlChange {
        channel: 0,
        control: 64,
        value: 127,
    });
    state.record(&MidiCommand::PitchBend {
        channel: 0,
        value: 12345,
    });

    let bytes = state.encode(1).unwrap();
    let (journal, _) = decode_journal(&bytes).unwrap();
    let channel = &journal.channels[0];
    assert_eq!(channel.controllers, vec![(7, 100), (64, 127)]);
    assert_eq!(channel.pitch_wheel, Some(12345));
}

#[test]
fn test_aftertouch_chapters() {
    let mut state = JournalState::new();
    state.record(&MidiCommand::ChannelAftertouch {
        channel: 5,
        pressure: 77,
    });
    state.record(&MidiCommand::PolyAftertouch {
        channel: 5,
        note: 61,
        pressure: 44,
    });

    let bytes = state.encode(1).unwrap();
    let (journal, _) = decode_journal(&bytes).unwrap();
    let channel = &journal.channels[0];
    assert_eq!(channel.channel_pressure, Some(77));
    assert_eq!(channel.poly_pressure, vec![(61, 44)]);
}

#[test]
fn test_system_chapters_roundtrip() {
    let mut state = JournalState::new();
    state.record(&MidiCommand::Reset);
    state.record(&MidiCommand::TuneRequest);
    state.record(&MidiCommand::TuneRequest);
    state.record(&MidiCommand::SongSelect { song: 4 });
    state.record(&MidiCommand::ActiveSensing);
    state.record(&MidiCommand::SongPosition { beats: 320 });
    state.record(&MidiCommand::Start);

    let bytes = state.encode(1).unwrap();
    let (journal, _) = decode_journal(&bytes).unwrap();
    let system = journal.system.expect("system journal present");

    assert_eq!(system.reset_count, Some(1));
    assert_eq!(system.tune_request_count, Some(2));
    assert_eq!(system.song_select, Some(4));
    assert_eq!(system.active_sense_count, Some(1));
    assert_eq!(system.running, Some(true));
    assert_eq!(system.song_position, Some(320));
}

#[test]
fn test_stop_clears_running() {
    let mut state = JournalState::new();
    state.record(&MidiCommand::Start);
    state.record(&MidiCommand::Stop);

    let bytes = state.encode(1).unwrap();
    let (journal, _) = decode_journal(&bytes).unwrap();
    assert_eq!(journal.system.unwrap().running, Some(false));
}

#[test]
fn test_multiple_channels_ascending() {
    let mut state = JournalState::new();
    state.record(&note_on(9, 36, 120));
    state.record(&note_on(1, 60, 80));
    state.record(&note_on(4, 62, 70));

    let bytes = state.encode(1).unwrap();
    let (journal, _) = decode_journal(&bytes).unwrap();
    let channels: Vec<u8> = journal.channels.iter().map(|c| c.channel).collect();
    assert_eq!(channels, vec![1, 4, 9]);
}

#[test]
fn test_sysex_and_clock_not_journaled() {
    let mut state = JournalState::new();
    state.record(&MidiCommand::SystemExclusive {
        data: vec![0xF0, 0x01, 0xF7],
    });
    state.record(&MidiCommand::TimingClock);
    state.record(&MidiCommand::TimeCodeQuarterFrame { value: 3 });
    assert!(state.is_empty());
}

#[test]
fn test_truncated_journal() {
    assert_eq!(
        decode_journal(&[0x20]).unwrap_err(),
        JournalDecodeError::Truncated
    );
}

#[test]
fn test_length_overrun() {
    let mut state = JournalState::new();
    state.record(&note_on(0, 60, 100));
    let mut bytes = state.encode(1).unwrap();
    bytes.truncate(bytes.len() - 2);
    assert_eq!(
        decode_journal(&bytes).unwrap_err(),
        JournalDecodeError::LengthOverrun
    );
}
