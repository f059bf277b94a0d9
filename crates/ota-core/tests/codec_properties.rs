//! Property tests for the wire codec and session liveness.

use std::time::{Duration, Instant};

use ota_core::{
    Address, Config, ConnectionState, Event, Message, MessageKind, Session, StationSession,
    TestConfig,
};
use proptest::prelude::*;

fn kind() -> impl Strategy<Value = MessageKind> {
    proptest::sample::select(MessageKind::ALL.to_vec())
}

fn device() -> impl Strategy<Value = Address> {
    (1u16..=u16::MAX).prop_map(|n| Address::new(n).unwrap())
}

prop_compose! {
    fn message()(
        sender in device(),
        kind in kind(),
        body in proptest::option::of("\\PC{0,60}"),
        rssi in proptest::option::of(any::<i16>()),
        snr in proptest::option::of(any::<i16>()),
    ) -> Message {
        let mut msg = Message::new(sender, Address::new(1).unwrap(), kind).with_signal(rssi, snr);
        msg.body = body;
        msg
    }
}

proptest! {
    #[test]
    fn received_lines_decode_to_the_sent_message(msg in message()) {
        let line = msg.encode_received();
        prop_assert_eq!(Message::decode(&line, msg.receiver), Ok(msg));
    }

    #[test]
    fn outbound_length_matches_payload(msg in message()) {
        let line = msg.encode();
        let mut fields = line.splitn(3, ',');
        let receiver = fields.next().unwrap();
        let declared: usize = fields.next().unwrap().parse().unwrap();
        let payload = fields.next().unwrap();
        prop_assert_eq!(receiver, msg.receiver.to_string());
        prop_assert_eq!(declared, payload.len());
        prop_assert_eq!(msg.exceeds_radio_limit(), declared > ota_core::MAX_PAYLOAD_LEN);
    }

    #[test]
    fn decode_never_panics(line in "\\PC{0,80}") {
        let _ = Message::decode(&line, Address::new(1).unwrap());
    }

    #[test]
    fn test_config_survives_the_wire(id in any::<u32>(), role in any::<u32>(), start in any::<u64>()) {
        let config = TestConfig::new(id, role, start);
        prop_assert_eq!(config.to_string().parse::<TestConfig>(), Ok(config));
    }

    #[test]
    fn regular_pings_keep_a_session_alive(gaps in proptest::collection::vec(0u64..3000, 1..40)) {
        let station = Address::new(10).unwrap();
        let unit = Address::new(5).unwrap();
        let config = Config::new(station).with_ping_interval(Duration::from_secs(1));
        let t0 = Instant::now();
        let mut session = StationSession::accept(
            config,
            &Message::new(unit, Address::BROADCAST, MessageKind::Req),
            t0,
        );
        session.handle(&Event::Received { now: t0, msg: Message::new(unit, station, MessageKind::Ack) });

        let mut now = t0;
        for gap in gaps {
            now += Duration::from_millis(gap);
            session.handle(&Event::Keepalive { now });
            prop_assert_eq!(session.connection_state(), ConnectionState::Connected);
            session.handle(&Event::Received { now, msg: Message::new(unit, station, MessageKind::Ping) });
        }

        session.handle(&Event::Keepalive { now: now + Duration::from_secs(3) });
        prop_assert!(session.is_closed());
    }
}
