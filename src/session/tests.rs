use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::advance;

use super::config::SessionConfig;
use super::engine::Engine;
use crate::error::ErrorKind;
use crate::event::{ConnectionListener, ExceptionListener, Listeners, MidiListener};
use crate::protocol::control::{ClockSyncExchange, ControlPacket, Invitation};
use crate::protocol::rtp::{encode_midi_packet, RtpHeader};

const PEER_SSRC: u32 = 0x2222_2222;

#[derive(Default)]
struct Recorder {
    attached: StdMutex<Vec<String>>,
    detached: StdMutex<Vec<String>>,
    errors: StdMutex<Vec<ErrorKind>>,
    notes: StdMutex<Vec<(String, u8, u8, u8)>>,
    sysex: StdMutex<Vec<Vec<u8>>>,
}

impl ConnectionListener for Recorder {
    fn on_attached(&self, device_id: &str) {
        self.attached.lock().unwrap().push(device_id.to_string());
    }
    fn on_detached(&self, device_id: &str) {
        self.detached.lock().unwrap().push(device_id.to_string());
    }
}

impl MidiListener for Recorder {
    fn on_note_on(&self, device_id: &str, channel: u8, note: u8, velocity: u8) {
        self.notes
            .lock()
            .unwrap()
            .push((device_id.to_string(), channel, note, velocity));
    }
    fn on_system_exclusive(&self, _device_id: &str, data: &[u8]) {
        self.sysex.lock().unwrap().push(data.to_vec());
    }
}

impl ExceptionListener for Recorder {
    fn on_error(&self, kind: ErrorKind) {
        self.errors.lock().unwrap().push(kind);
    }
}

fn listeners(recorder: &Arc<Recorder>) -> Listeners {
    Listeners {
        connection: Some(recorder.clone() as Arc<dyn ConnectionListener>),
        midi: Some(recorder.clone() as Arc<dyn MidiListener>),
        exception: Some(recorder.clone() as Arc<dyn ExceptionListener>),
    }
}

/// Bind an engine on a free even/odd port pair on loopback.
async fn bind_engine(listeners: Listeners) -> (Engine, u16) {
    for _ in 0..50 {
        let port: u16 = rand::thread_rng().gen_range(20_000..60_000);
        let config = SessionConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            ..SessionConfig::new("local", port)
        };
        if let Ok(engine) = Engine::bind(config, listeners.clone()).await {
            return (engine, port);
        }
    }
    panic!("no free port pair for engine");
}

/// Bind a fake remote peer: adjacent control and data sockets.
async fn bind_peer() -> (UdpSocket, UdpSocket, u16) {
    for _ in 0..50 {
        let port: u16 = rand::thread_rng().gen_range(20_000..60_000);
        let Ok(control) = UdpSocket::bind(("127.0.0.1", port)).await else {
            continue;
        };
        let Ok(data) = UdpSocket::bind(("127.0.0.1", port + 1)).await else {
            continue;
        };
        return (control, data, port);
    }
    panic!("no free port pair for peer");
}

/// Drain one datagram, polling briefly; loopback delivery completes during
/// the sender's syscall so a short spin is enough even under paused time.
fn recv_now(socket: &UdpSocket) -> Option<(Vec<u8>, SocketAddr)> {
    let mut buf = [0u8; 2048];
    for _ in 0..200 {
        match socket.try_recv_from(&mut buf) {
            Ok((len, src)) => return Some((buf[..len].to_vec(), src)),
            Err(_) => std::thread::sleep(Duration::from_millis(1)),
        }
    }
    None
}

fn recv_control(socket: &UdpSocket) -> ControlPacket {
    let (bytes, _) = recv_now(socket).expect("expected a datagram");
    ControlPacket::decode(&bytes).expect("expected a control PDU").0
}

fn drain(socket: &UdpSocket) -> Vec<Vec<u8>> {
    let mut buf = [0u8; 2048];
    let mut out = Vec::new();
    while let Ok((len, _)) = socket.try_recv_from(&mut buf) {
        out.push(buf[..len].to_vec());
    }
    out
}

/// Run the full initiator handshake against a fake peer; returns everything
/// a steady-state test needs.
async fn connected_pair(
    recorder: &Arc<Recorder>,
) -> (Engine, UdpSocket, UdpSocket, u16, String) {
    let (mut engine, port) = bind_engine(listeners(recorder)).await;
    let (peer_control, peer_data, peer_port) = bind_peer().await;

    engine
        .connect_to_listener(format!("127.0.0.1:{peer_port}").parse().unwrap())
        .unwrap();
    engine.tick().await;

    let ControlPacket::Invitation(invitation) = recv_control(&peer_control) else {
        panic!("expected control-port invitation");
    };
    let reply = ControlPacket::InvitationAccepted(Invitation {
        token: invitation.token,
        ssrc: PEER_SSRC,
        name: "peer".to_string(),
    });
    peer_control
        .send_to(&reply.encode(), ("127.0.0.1", port))
        .await
        .unwrap();
    engine.tick().await;

    let ControlPacket::Invitation(_) = recv_control(&peer_data) else {
        panic!("expected data-port invitation");
    };
    peer_data
        .send_to(&reply.encode(), ("127.0.0.1", port + 1))
        .await
        .unwrap();
    engine.tick().await;

    let device_id = format!("RtpMidi:{port}:{PEER_SSRC}");
    assert_eq!(*recorder.attached.lock().unwrap(), vec![device_id.clone()]);
    (engine, peer_control, peer_data, port, device_id)
}

#[tokio::test]
async fn test_invitation_roundtrip() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, port) = bind_engine(listeners(&recorder)).await;
    let (peer_control, peer_data, peer_port) = bind_peer().await;

    engine
        .connect_to_listener(format!("127.0.0.1:{peer_port}").parse().unwrap())
        .unwrap();
    engine.tick().await;

    // Control-port invitation carries our ssrc and name; token correlates.
    let ControlPacket::Invitation(invitation) = recv_control(&peer_control) else {
        panic!("expected invitation");
    };
    assert_eq!(invitation.ssrc, engine.local_ssrc());
    assert_eq!(invitation.name, "local");

    let ok = ControlPacket::InvitationAccepted(Invitation {
        token: invitation.token,
        ssrc: PEER_SSRC,
        name: "peer".to_string(),
    });
    peer_control
        .send_to(&ok.encode(), ("127.0.0.1", port))
        .await
        .unwrap();
    engine.tick().await;

    // Peer ssrc is learned from the control acceptance, and the same tick
    // moves the handshake to the data port.
    let info = engine.participants();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].ssrc, PEER_SSRC);
    assert_eq!(info[0].name, "peer");
    assert!(recorder.attached.lock().unwrap().is_empty());

    let ControlPacket::Invitation(data_invitation) = recv_control(&peer_data) else {
        panic!("expected data-port invitation");
    };
    assert_eq!(data_invitation.token, invitation.token);

    peer_data
        .send_to(&ok.encode(), ("127.0.0.1", port + 1))
        .await
        .unwrap();
    engine.tick().await;

    let expected = format!("RtpMidi:{port}:{PEER_SSRC}");
    assert_eq!(*recorder.attached.lock().unwrap(), vec![expected.clone()]);
    assert_eq!(engine.device_name(&expected), Some(("peer".to_string(), PEER_SSRC)));
}

#[tokio::test]
async fn test_note_on_encode() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, _peer_control, peer_data, _port, device_id) =
        connected_pair(&recorder).await;

    engine
        .queue_midi(
            &device_id,
            &crate::protocol::midi::MidiCommand::NoteOn {
                channel: 1,
                note: 64,
                velocity: 127,
            },
        )
        .unwrap();
    engine.tick().await;

    let (bytes, _) = recv_now(&peer_data).expect("expected a data packet");
    let header = RtpHeader::decode(&bytes).unwrap();
    assert_eq!(header.ssrc, engine.local_ssrc());

    // 12-byte RTP header, 1-byte command-section header, then the command
    // with no leading delta-time.
    assert_eq!(bytes[12] & 0x0F, 3);
    assert_eq!(bytes[12] & 0x80, 0);
    assert_eq!(&bytes[13..16], &[0x91, 0x40, 0x7F]);
}

#[tokio::test]
async fn test_sequence_increments_per_packet() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, _peer_control, peer_data, _port, device_id) =
        connected_pair(&recorder).await;

    let note = crate::protocol::midi::MidiCommand::NoteOn {
        channel: 0,
        note: 60,
        velocity: 1,
    };
    engine.queue_midi(&device_id, &note).unwrap();
    engine.tick().await;
    engine.queue_midi(&device_id, &note).unwrap();
    engine.tick().await;

    let (first, _) = recv_now(&peer_data).unwrap();
    let (second, _) = recv_now(&peer_data).unwrap();
    let first_seq = RtpHeader::decode(&first).unwrap().sequence;
    let second_seq = RtpHeader::decode(&second).unwrap().sequence;
    assert_eq!(second_seq, first_seq.wrapping_add(1));
}

#[tokio::test]
async fn test_incoming_note_dispatched() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, _peer_control, peer_data, port, device_id) =
        connected_pair(&recorder).await;

    let packet = encode_midi_packet(
        RtpHeader {
            sequence: 100,
            timestamp: 5000,
            ssrc: PEER_SSRC,
        },
        &[0x91, 0x40, 0x7F],
        None,
    );
    peer_data
        .send_to(&packet, ("127.0.0.1", port + 1))
        .await
        .unwrap();
    engine.tick().await;

    assert_eq!(
        *recorder.notes.lock().unwrap(),
        vec![(device_id, 1, 64, 127)]
    );
}

#[tokio::test]
async fn test_foreign_ssrc_ignored() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, _peer_control, peer_data, port, _device_id) =
        connected_pair(&recorder).await;

    let packet = encode_midi_packet(
        RtpHeader {
            sequence: 1,
            timestamp: 0,
            ssrc: 0x5555_5555,
        },
        &[0x90, 0x40, 0x7F],
        None,
    );
    peer_data
        .send_to(&packet, ("127.0.0.1", port + 1))
        .await
        .unwrap();
    engine.tick().await;

    assert!(recorder.notes.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sequence_gap_raises_and_processes() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, _peer_control, peer_data, port, _device_id) =
        connected_pair(&recorder).await;

    for seq in [100u16, 103] {
        let packet = encode_midi_packet(
            RtpHeader {
                sequence: seq,
                timestamp: 0,
                ssrc: PEER_SSRC,
            },
            &[0x90, 0x40, 0x7F],
            None,
        );
        peer_data
            .send_to(&packet, ("127.0.0.1", port + 1))
            .await
            .unwrap();
        engine.tick().await;
    }

    // The gap is reported and the packet is still processed.
    assert!(recorder
        .errors
        .lock()
        .unwrap()
        .contains(&ErrorKind::ReceivedPacketsDropped));
    assert_eq!(recorder.notes.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_receiver_feedback_after_delay() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, peer_control, peer_data, port, _device_id) =
        connected_pair(&recorder).await;
    drain(&peer_control);

    let packet = encode_midi_packet(
        RtpHeader {
            sequence: 321,
            timestamp: 0,
            ssrc: PEER_SSRC,
        },
        &[0x90, 0x40, 0x7F],
        None,
    );
    peer_data
        .send_to(&packet, ("127.0.0.1", port + 1))
        .await
        .unwrap();
    engine.tick().await;

    // No feedback inside the 1 s window.
    advance(Duration::from_millis(500)).await;
    engine.tick().await;
    assert!(drain(&peer_control).is_empty());

    advance(Duration::from_millis(600)).await;
    engine.tick().await;

    let feedback = recv_control(&peer_control);
    assert_eq!(
        feedback,
        ControlPacket::ReceiverFeedback {
            ssrc: engine.local_ssrc(),
            seq: 321,
        }
    );
}

#[tokio::test]
async fn test_feedback_ahead_raises_send_packets_dropped() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, peer_control, _peer_data, port, _device_id) =
        connected_pair(&recorder).await;

    let feedback = ControlPacket::ReceiverFeedback {
        ssrc: PEER_SSRC,
        seq: 0x7000,
    };
    peer_control
        .send_to(&feedback.encode(), ("127.0.0.1", port))
        .await
        .unwrap();
    engine.tick().await;

    assert!(recorder
        .errors
        .lock()
        .unwrap()
        .contains(&ErrorKind::SendPacketsDropped));
}

#[tokio::test]
async fn test_ck_responder_reflects_ts0() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, _peer_control, peer_data, port, _device_id) =
        connected_pair(&recorder).await;

    let ck0 = ControlPacket::Synchronization(ClockSyncExchange {
        ssrc: PEER_SSRC,
        count: 0,
        timestamps: [1000, 0, 0],
    });
    peer_data
        .send_to(&ck0.encode(), ("127.0.0.1", port + 1))
        .await
        .unwrap();
    engine.tick().await;

    let ControlPacket::Synchronization(reply) = recv_control(&peer_data) else {
        panic!("expected CK reply");
    };
    assert_eq!(reply.count, 1);
    assert_eq!(reply.ssrc, engine.local_ssrc());
    assert_eq!(reply.timestamps[0], 1000);
}

#[tokio::test]
async fn test_ck2_offset_estimate() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, _peer_control, peer_data, port, device_id) =
        connected_pair(&recorder).await;

    let ck2 = ControlPacket::Synchronization(ClockSyncExchange {
        ssrc: PEER_SSRC,
        count: 2,
        timestamps: [1000, 2500, 3000],
    });
    peer_data
        .send_to(&ck2.encode(), ("127.0.0.1", port + 1))
        .await
        .unwrap();
    engine.tick().await;

    let stats = engine.participant_stats(&device_id).unwrap();
    assert_eq!(stats.offset_estimate, Some(-500));
}

#[tokio::test]
async fn test_ck_unknown_ssrc() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, _peer_control, peer_data, port, _device_id) =
        connected_pair(&recorder).await;

    let ck = ControlPacket::Synchronization(ClockSyncExchange {
        ssrc: 0x9999_9999,
        count: 0,
        timestamps: [0, 0, 0],
    });
    peer_data
        .send_to(&ck.encode(), ("127.0.0.1", port + 1))
        .await
        .unwrap();
    engine.tick().await;

    assert!(recorder
        .errors
        .lock()
        .unwrap()
        .contains(&ErrorKind::ParticipantNotFound));
}

#[tokio::test(start_paused = true)]
async fn test_invite_retry_exhaustion() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, _port) = bind_engine(listeners(&recorder)).await;
    let (peer_control, _peer_data, peer_port) = bind_peer().await;

    engine
        .connect_to_listener(format!("127.0.0.1:{peer_port}").parse().unwrap())
        .unwrap();
    engine.tick().await;

    for _ in 0..12 {
        advance(Duration::from_millis(1001)).await;
        engine.tick().await;
    }
    advance(Duration::from_millis(1001)).await;
    engine.tick().await;

    let datagrams = drain(&peer_control);
    let invitations = datagrams
        .iter()
        .filter(|d| matches!(ControlPacket::decode(d), Ok((ControlPacket::Invitation(_), _))))
        .count();
    let byes = datagrams
        .iter()
        .filter(|d| matches!(ControlPacket::decode(d), Ok((ControlPacket::EndSession { .. }, _))))
        .count();

    assert_eq!(invitations, 13);
    assert_eq!(byes, 1);
    assert_eq!(recorder.detached.lock().unwrap().len(), 1);
    assert!(recorder
        .errors
        .lock()
        .unwrap()
        .contains(&ErrorKind::NoResponseFromConnectionRequest));
    assert!(engine.participants().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_listener_timeout() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, port) = bind_engine(listeners(&recorder)).await;
    let (peer_control, peer_data, _peer_port) = bind_peer().await;

    // Peer invites us on both ports.
    let invitation = ControlPacket::Invitation(Invitation {
        token: 7,
        ssrc: PEER_SSRC,
        name: "peer".to_string(),
    });
    peer_control
        .send_to(&invitation.encode(), ("127.0.0.1", port))
        .await
        .unwrap();
    engine.tick().await;
    assert!(matches!(
        recv_control(&peer_control),
        ControlPacket::InvitationAccepted(_)
    ));

    peer_data
        .send_to(&invitation.encode(), ("127.0.0.1", port + 1))
        .await
        .unwrap();
    engine.tick().await;
    assert_eq!(recorder.attached.lock().unwrap().len(), 1);

    // Just inside the timeout nothing happens.
    advance(Duration::from_millis(60_900)).await;
    engine.tick().await;
    assert_eq!(recorder.detached.lock().unwrap().len(), 0);

    advance(Duration::from_millis(200)).await;
    engine.tick().await;

    let byes = drain(&peer_control)
        .iter()
        .filter(|d| matches!(ControlPacket::decode(d), Ok((ControlPacket::EndSession { .. }, _))))
        .count();
    assert_eq!(byes, 1);
    assert_eq!(
        *recorder.detached.lock().unwrap(),
        vec![format!("RtpMidi:{port}:{PEER_SSRC}")]
    );
    assert!(recorder
        .errors
        .lock()
        .unwrap()
        .contains(&ErrorKind::ListenerTimeOut));
}

#[tokio::test]
async fn test_listener_handshake_accepts_and_attaches_once() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, port) = bind_engine(listeners(&recorder)).await;
    let (peer_control, peer_data, _peer_port) = bind_peer().await;

    let invitation = ControlPacket::Invitation(Invitation {
        token: 9,
        ssrc: PEER_SSRC,
        name: "peer".to_string(),
    });
    peer_control
        .send_to(&invitation.encode(), ("127.0.0.1", port))
        .await
        .unwrap();
    engine.tick().await;

    let ControlPacket::InvitationAccepted(reply) = recv_control(&peer_control) else {
        panic!("expected acceptance");
    };
    assert_eq!(reply.token, 9);
    assert_eq!(reply.ssrc, engine.local_ssrc());
    assert_eq!(reply.name, "local");

    // A duplicate control-port invitation for a known ssrc is ignored.
    peer_control
        .send_to(&invitation.encode(), ("127.0.0.1", port))
        .await
        .unwrap();
    engine.tick().await;
    assert!(drain(&peer_control).is_empty());

    peer_data
        .send_to(&invitation.encode(), ("127.0.0.1", port + 1))
        .await
        .unwrap();
    engine.tick().await;
    assert!(matches!(
        recv_control(&peer_data),
        ControlPacket::InvitationAccepted(_)
    ));
    assert_eq!(recorder.attached.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_data_invitation_for_unknown_ssrc_rejected() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, port) = bind_engine(listeners(&recorder)).await;
    let (_peer_control, peer_data, _peer_port) = bind_peer().await;

    let invitation = ControlPacket::Invitation(Invitation {
        token: 5,
        ssrc: 0x4444_4444,
        name: "peer".to_string(),
    });
    peer_data
        .send_to(&invitation.encode(), ("127.0.0.1", port + 1))
        .await
        .unwrap();
    engine.tick().await;

    assert!(matches!(
        recv_control(&peer_data),
        ControlPacket::InvitationRejected(_)
    ));
    assert!(recorder
        .errors
        .lock()
        .unwrap()
        .contains(&ErrorKind::ParticipantNotFound));
}

#[tokio::test]
async fn test_table_full_rejects_invitation() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, port) = bind_engine(listeners(&recorder)).await;
    let (peer_control, _peer_data, _peer_port) = bind_peer().await;

    for i in 0..super::engine::MAX_PARTICIPANTS {
        let addr: SocketAddr = format!("127.0.0.1:{}", 40_000 + i * 2).parse().unwrap();
        engine.connect_to_listener(addr).unwrap();
    }
    assert!(engine
        .connect_to_listener("127.0.0.1:39000".parse().unwrap())
        .is_err());

    let invitation = ControlPacket::Invitation(Invitation {
        token: 11,
        ssrc: PEER_SSRC,
        name: "peer".to_string(),
    });
    peer_control
        .send_to(&invitation.encode(), ("127.0.0.1", port))
        .await
        .unwrap();
    engine.tick().await;

    assert!(matches!(
        recv_control(&peer_control),
        ControlPacket::InvitationRejected(_)
    ));
    assert!(recorder
        .errors
        .lock()
        .unwrap()
        .contains(&ErrorKind::TooManyParticipants));
}

#[tokio::test]
async fn test_bye_detaches_participant() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, peer_control, _peer_data, port, device_id) =
        connected_pair(&recorder).await;

    let bye = ControlPacket::EndSession {
        token: 1,
        ssrc: PEER_SSRC,
    };
    peer_control
        .send_to(&bye.encode(), ("127.0.0.1", port))
        .await
        .unwrap();
    engine.tick().await;

    assert_eq!(*recorder.detached.lock().unwrap(), vec![device_id]);
    assert!(engine.participants().is_empty());
}

#[tokio::test]
async fn test_end_sends_bye_to_every_peer() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, peer_control, _peer_data, _port, _device_id) =
        connected_pair(&recorder).await;
    drain(&peer_control);

    engine.end().await;

    assert!(matches!(
        recv_control(&peer_control),
        ControlPacket::EndSession { .. }
    ));
    assert_eq!(recorder.detached.lock().unwrap().len(), 1);
    assert!(engine.participants().is_empty());
}

#[tokio::test]
async fn test_garbage_on_control_port() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, port) = bind_engine(listeners(&recorder)).await;
    let (peer_control, _peer_data, _peer_port) = bind_peer().await;

    peer_control
        .send_to(&[0x01, 0x02, 0x03, 0x04, 0x05], ("127.0.0.1", port))
        .await
        .unwrap();
    engine.tick().await;

    assert!(recorder.errors.lock().unwrap().contains(&ErrorKind::Parse));
}

#[tokio::test]
async fn test_garbage_on_data_port() {
    let recorder = Arc::new(Recorder::default());
    let (mut engine, port) = bind_engine(listeners(&recorder)).await;
    let (_peer_control, peer_data, _peer_port) = bind_peer().await;

    peer_data
        .send_to(&[0x01, 0x02, 0x03], ("127.0.0.1", port + 1))
        .await
        .unwrap();
    engine.tick().await;

    assert!(recorder
        .errors
        .lock()
        .unwrap()
        .contains(&ErrorKind::UnexpectedParse));
}

#[tokio::test]
async fn test_device_id_rejects_wrong_port() {
    let recorder = Arc::new(Recorder::default());
    let (engine, _peer_control, _peer_data, port, _device_id) =
        connected_pair(&recorder).await;

    let wrong = format!("RtpMidi:{}:{PEER_SSRC}", port.wrapping_add(2));
    assert!(engine.device_name(&wrong).is_none());
    assert!(engine.device_name("not-a-device-id").is_none());
}
