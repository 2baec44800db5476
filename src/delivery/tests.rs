use super::*;
use crate::payload::PayloadShard;
use crate::persistence::Journal;
use crate::protocol::AckPhase;
use crate::session::{Envelope, OpenOptions, SessionLimits};
use parking_lot::Mutex;

const NOW: u64 = 1_700_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
    Publish(OutboundPublish),
    Release(u16),
}

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<(String, Sent)>>,
}

impl RecordingSink {
    fn take(&self) -> Vec<Sent> {
        self.sent.lock().drain(..).map(|(_, s)| s).collect()
    }
}

impl ConnectionSink for RecordingSink {
    fn deliver(&self, client_id: &str, publish: OutboundPublish) {
        self.sent
            .lock()
            .push((client_id.to_string(), Sent::Publish(publish)));
    }

    fn release(&self, client_id: &str, packet_id: u16) {
        self.sent
            .lock()
            .push((client_id.to_string(), Sent::Release(packet_id)));
    }
}

struct Fixture {
    sink: Arc<RecordingSink>,
    engine: DeliveryEngine,
    sessions: SessionStore,
    payloads: PayloadShard,
}

fn fixture(config: DeliveryConfig) -> Fixture {
    let sink = Arc::new(RecordingSink::default());
    let bytes = PayloadBytes::new();
    let engine = DeliveryEngine::new(
        sink.clone(),
        bytes.clone(),
        config,
        Arc::new(Metrics::new().unwrap()),
    );
    let mut sessions = SessionStore::new(Journal::disabled(), SessionLimits::default());
    sessions
        .open(
            &Arc::from("dev-1"),
            OpenOptions {
                clean_start: false,
                expiry_interval: 3600,
                will: None,
            },
        )
        .unwrap();
    Fixture {
        sink,
        engine,
        sessions,
        payloads: PayloadShard::new(bytes, Journal::disabled()),
    }
}

impl Fixture {
    fn enqueue(&mut self, body: &'static [u8], qos: QoS, expiry: Option<u32>) {
        let payload = self.payloads.intern(bytes::Bytes::from_static(body)).unwrap();
        self.sessions
            .enqueue(
                "dev-1",
                Envelope {
                    message: Arc::new(Message {
                        topic: Arc::from("sensors/room1/temp"),
                        payload,
                        qos,
                        retain: false,
                        expiry_interval: expiry,
                        publisher: None,
                        created_at_ms: NOW,
                    }),
                    qos,
                    retain: false,
                    subscription_ids: SmallVec::from_slice(&[7]),
                },
                NOW,
            )
            .unwrap();
    }
}

fn publishes(sent: Vec<Sent>) -> Vec<OutboundPublish> {
    sent.into_iter()
        .filter_map(|s| match s {
            Sent::Publish(p) => Some(p),
            Sent::Release(_) => None,
        })
        .collect()
}

#[test]
fn test_pump_sends_in_order_and_fills_window() {
    let mut f = fixture(DeliveryConfig {
        max_inflight: 2,
        retry_interval: Duration::from_secs(30),
    });
    f.enqueue(b"1", QoS::AtLeastOnce, None);
    f.enqueue(b"2", QoS::AtLeastOnce, None);
    f.enqueue(b"3", QoS::AtLeastOnce, None);

    let outcome = f.engine.pump(&mut f.sessions, "dev-1", NOW);
    assert_eq!(outcome.sent, 2);
    assert_eq!(outcome.armed.len(), 2);
    assert!(outcome.release.is_empty());

    let sent = publishes(f.sink.take());
    assert_eq!(&sent[0].payload[..], b"1");
    assert_eq!(&sent[1].payload[..], b"2");
    assert!(sent.iter().all(|p| !p.dup && p.packet_id.is_some()));
    assert_eq!(sent[0].subscription_ids.as_slice(), &[7]);

    let first = sent[0].packet_id.unwrap();
    f.sessions
        .ack("dev-1", first, AckPhase::PubAck, NOW)
        .unwrap();
    let outcome = f.engine.pump(&mut f.sessions, "dev-1", NOW);
    assert_eq!(outcome.sent, 1);
    assert_eq!(&publishes(f.sink.take())[0].payload[..], b"3");
}

#[test]
fn test_qos0_releases_after_send() {
    let mut f = fixture(DeliveryConfig::default());
    f.enqueue(b"fire", QoS::AtMostOnce, None);

    let outcome = f.engine.pump(&mut f.sessions, "dev-1", NOW);
    assert_eq!(outcome.sent, 1);
    assert!(outcome.armed.is_empty());
    assert_eq!(outcome.release, vec![PayloadId::of(b"fire")]);
    assert_eq!(publishes(f.sink.take())[0].packet_id, None);
}

#[test]
fn test_expired_messages_are_not_sent() {
    let mut f = fixture(DeliveryConfig::default());
    f.enqueue(b"stale", QoS::AtLeastOnce, Some(1));
    f.enqueue(b"fresh", QoS::AtLeastOnce, Some(60));

    let outcome = f.engine.pump(&mut f.sessions, "dev-1", NOW + 2_000);
    assert_eq!(outcome.release, vec![PayloadId::of(b"stale")]);
    let sent = publishes(f.sink.take());
    assert_eq!(sent.len(), 1);
    assert_eq!(&sent[0].payload[..], b"fresh");
    assert_eq!(sent[0].message_expiry, Some(58));
}

#[test]
fn test_offline_session_is_not_pumped() {
    let mut f = fixture(DeliveryConfig::default());
    f.sessions.disconnect("dev-1", true, NOW).unwrap();
    f.enqueue(b"later", QoS::AtLeastOnce, None);

    let outcome = f.engine.pump(&mut f.sessions, "dev-1", NOW);
    assert_eq!(outcome.sent, 0);
    assert!(f.sink.take().is_empty());
    assert_eq!(f.sessions.get("dev-1").unwrap().queue.len(), 1);
}

#[test]
fn test_zero_retry_interval_arms_nothing() {
    let mut f = fixture(DeliveryConfig {
        max_inflight: 0,
        retry_interval: Duration::ZERO,
    });
    f.enqueue(b"x", QoS::ExactlyOnce, None);
    let outcome = f.engine.pump(&mut f.sessions, "dev-1", NOW);
    assert_eq!(outcome.sent, 1);
    assert!(outcome.armed.is_empty());
}

#[test]
fn test_retransmit_resends_with_dup() {
    let mut f = fixture(DeliveryConfig::default());
    f.enqueue(b"x", QoS::AtLeastOnce, None);
    f.engine.pump(&mut f.sessions, "dev-1", NOW);
    let packet_id = publishes(f.sink.take())[0].packet_id.unwrap();
    let epoch = f.sessions.get("dev-1").unwrap().epoch();

    assert_eq!(
        f.engine
            .retransmit(&mut f.sessions, "dev-1", packet_id, epoch, NOW + 30_000),
        Retransmit::Resent
    );
    let resent = publishes(f.sink.take());
    assert_eq!(resent.len(), 1);
    assert!(resent[0].dup);
    assert_eq!(resent[0].packet_id, Some(packet_id));
    assert_eq!(
        f.sessions
            .get("dev-1")
            .unwrap()
            .in_flight
            .get(&packet_id)
            .unwrap()
            .retry_count,
        1
    );

    // Stale epoch
    assert_eq!(
        f.engine
            .retransmit(&mut f.sessions, "dev-1", packet_id, epoch + 1, NOW),
        Retransmit::Stale
    );

    f.sessions
        .ack("dev-1", packet_id, AckPhase::PubAck, NOW)
        .unwrap();
    assert_eq!(
        f.engine
            .retransmit(&mut f.sessions, "dev-1", packet_id, epoch, NOW),
        Retransmit::Stale
    );
}

#[test]
fn test_retransmit_in_received_phase_sends_pubrel() {
    let mut f = fixture(DeliveryConfig::default());
    f.enqueue(b"x", QoS::ExactlyOnce, None);
    f.engine.pump(&mut f.sessions, "dev-1", NOW);
    let packet_id = publishes(f.sink.take())[0].packet_id.unwrap();
    f.sessions
        .ack("dev-1", packet_id, AckPhase::PubRec, NOW)
        .unwrap();

    let epoch = f.sessions.get("dev-1").unwrap().epoch();
    f.engine
        .retransmit(&mut f.sessions, "dev-1", packet_id, epoch, NOW);
    assert_eq!(f.sink.take(), vec![Sent::Release(packet_id)]);
}

#[test]
fn test_resume_redelivers_in_send_order() {
    let mut f = fixture(DeliveryConfig {
        max_inflight: 3,
        retry_interval: Duration::from_secs(30),
    });
    for body in [b"a" as &[u8], b"b", b"c"] {
        f.enqueue(body, QoS::ExactlyOnce, None);
    }
    f.engine.pump(&mut f.sessions, "dev-1", NOW);
    let ids: Vec<u16> = publishes(f.sink.take())
        .iter()
        .filter_map(|p| p.packet_id)
        .collect();
    f.sessions
        .ack("dev-1", ids[1], AckPhase::PubRec, NOW)
        .unwrap();
    f.enqueue(b"d", QoS::AtLeastOnce, None);

    f.sessions.disconnect("dev-1", true, NOW).unwrap();
    f.sessions
        .open(
            &Arc::from("dev-1"),
            OpenOptions {
                clean_start: false,
                expiry_interval: 3600,
                will: None,
            },
        )
        .unwrap();

    let outcome = f.engine.resume(&mut f.sessions, "dev-1", NOW);
    assert_eq!(outcome.armed.len(), 3);
    let sent = f.sink.take();
    assert_eq!(sent.len(), 3);
    match &sent[0] {
        Sent::Publish(p) => {
            assert_eq!(&p.payload[..], b"a");
            assert!(p.dup);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(sent[1], Sent::Release(ids[1]));
    match &sent[2] {
        Sent::Publish(p) => {
            assert_eq!(&p.payload[..], b"c");
            assert!(p.dup);
        }
        other => panic!("unexpected {:?}", other),
    }
    // Window is full until something is acknowledged
    assert_eq!(f.sessions.get("dev-1").unwrap().queue.len(), 1);
}
