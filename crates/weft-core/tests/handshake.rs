//! End-to-end key exchange scenarios.

mod common;

use std::time::Duration;

use common::{is_channel_packet, is_hello, TestNet};
use weft_core::host::HostEvent;

#[test]
fn handshake_establishes_channel() {
    let mut net = TestNet::new();
    let (b_handle, a_handle) = net.connect();

    let a_events = TestNet::drain(&mut net.a_events);
    assert!(
        a_events.iter().any(|e| matches!(
            e,
            HostEvent::KexCompleted { success: true, peer } if *peer == b_handle
        )),
        "initiator never completed: {a_events:?}"
    );
    assert!(a_events
        .iter()
        .any(|e| matches!(e, HostEvent::ChannelConnected { .. })));

    let b_events = TestNet::drain(&mut net.b_events);
    assert!(b_events
        .iter()
        .any(|e| matches!(e, HostEvent::ChannelConnected { peer } if *peer == a_handle)));

    // Both sides agree on the binding: channel 1 on each socket.
    assert_eq!(net.a.channel_for(net.b_ep, 1), Some(b_handle));
    assert_eq!(net.b.channel_for(net.a_ep, 1), Some(a_handle));
}

#[test]
fn hello_loss_retransmits_until_cookie() {
    let mut net = TestNet::new();
    let b_handle = net.a.connect(net.b_pk, net.b_ep, net.now);
    let mut hellos_seen = 0;

    // First hello: dropped.
    for (bytes, _) in net.a.outgoing() {
        if is_hello(&bytes) {
            hellos_seen += 1;
        }
    }
    assert_eq!(hellos_seen, 1);

    // Second hello after ~1s backoff: dropped too.
    net.now += Duration::from_millis(1100);
    net.a.poll_timers(net.now);
    for (bytes, _) in net.a.outgoing() {
        if is_hello(&bytes) {
            hellos_seen += 1;
        }
    }
    assert_eq!(hellos_seen, 2);

    // Third hello after the doubled backoff: delivered.
    net.now += Duration::from_millis(2100);
    net.a.poll_timers(net.now);
    let out = net.a.outgoing();
    for (bytes, _) in &out {
        if is_hello(bytes) {
            hellos_seen += 1;
        }
    }
    assert_eq!(hellos_seen, 3);
    for (bytes, dest) in out {
        if dest == net.b_ep {
            net.b.handle_datagram(&bytes, net.a_ep, net.now);
        }
    }
    net.pump();

    let a_events = TestNet::drain(&mut net.a_events);
    assert!(
        a_events.iter().any(|e| matches!(
            e,
            HostEvent::KexCompleted { success: true, peer } if *peer == b_handle
        )),
        "handshake did not recover from hello loss"
    );
}

#[test]
fn initiator_gives_up_after_deadline() {
    let mut net = TestNet::new();
    let b_handle = net.a.connect(net.b_pk, net.b_ep, net.now);
    net.a.outgoing(); // blackhole

    let mut failed = false;
    for _ in 0..600 {
        let Some(deadline) = net.a.next_deadline() else {
            break;
        };
        net.now = net.now.max(deadline);
        net.a.poll_timers(net.now);
        net.a.outgoing(); // keep blackholing retransmissions

        if TestNet::drain(&mut net.a_events).iter().any(|e| {
            matches!(e, HostEvent::KexCompleted { success: false, peer } if *peer == b_handle)
        }) {
            failed = true;
            break;
        }
    }
    assert!(failed, "initiator never reported failure");
}

#[test]
fn probe_triggers_immediate_hello_retransmit() {
    let mut net = TestNet::new();
    net.a.connect(net.b_pk, net.b_ep, net.now);
    // Drop the first hello.
    assert!(net.a.outgoing().iter().any(|(b, _)| is_hello(b)));

    // b probes a (no exchange in progress on b's side, so not refused).
    net.b.send_probe(net.a_ep);
    for (bytes, dest) in net.b.outgoing() {
        if dest == net.a_ep {
            net.a.handle_datagram(&bytes, net.b_ep, net.now);
        }
    }

    // The probe makes a retransmit its hello without waiting for backoff.
    assert!(
        net.a.outgoing().iter().any(|(b, _)| is_hello(b)),
        "probe did not trigger hello retransmission"
    );
}

#[test]
fn probe_suppressed_while_exchanging() {
    let mut net = TestNet::new();
    // a is mid-exchange toward b.
    net.a.connect(net.b_pk, net.b_ep, net.now);
    net.a.outgoing();

    // a now asked to probe the same endpoint: refused.
    net.a.send_probe(net.b_ep);
    assert!(
        net.a.outgoing().is_empty(),
        "probe should be suppressed during key exchange"
    );
}

#[test]
fn replayed_initiate_is_ignored_silently() {
    let mut net = TestNet::new();
    net.a.connect(net.b_pk, net.b_ep, net.now);

    // Run the handshake by hand, capturing the initiate.
    let mut captured_initiate = None;
    for _ in 0..20 {
        let from_a = net.a.outgoing();
        let from_b = net.b.outgoing();
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
        for (bytes, _) in from_a {
            if common::is_initiate(&bytes) {
                captured_initiate = Some(bytes.clone());
            }
            net.b.handle_datagram(&bytes, net.a_ep, net.now);
        }
        for (bytes, _) in from_b {
            net.a.handle_datagram(&bytes, net.b_ep, net.now);
        }
    }
    let initiate = captured_initiate.expect("no initiate observed");
    TestNet::drain(&mut net.b_events);

    // Replay: the responder must neither answer nor create state.
    net.b.handle_datagram(&initiate, net.a_ep, net.now);
    assert!(net.b.outgoing().is_empty(), "responder answered a replay");
    assert!(
        TestNet::drain(&mut net.b_events).is_empty(),
        "replay produced events"
    );
}

#[test]
fn channel_traffic_is_encrypted_and_demuxable() {
    let mut net = TestNet::new();
    let (b_handle, _) = net.connect();

    let stream = net.a.open_stream(b_handle).unwrap();
    let secret = b"attack at dawn over the weft";
    net.a
        .write(b_handle, stream, secret, weft_core::frame::FLAG_DATA_PUSH, net.now)
        .unwrap();

    // Every channel packet leads with a nonzero channel number and never
    // carries the plaintext.
    for (bytes, _) in net.a.outgoing() {
        if is_channel_packet(&bytes) {
            assert_eq!(bytes[0], 1);
            assert!(!bytes
                .windows(secret.len())
                .any(|w| w == &secret[..]));
        }
    }
}
