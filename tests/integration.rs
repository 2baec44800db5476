//! Integration tests for the BucketMQ engine
//!
//! These drive the public broker facade the way a transport would and
//! check the packets handed to the connection sink.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use bucketmq::delivery::{ConnectionSink, DeliveryConfig};
use bucketmq::hooks::{DefaultHooks, Hooks};
use bucketmq::persistence::{FjallStore, KvStore};
use bucketmq::protocol::{AckObligation, OutboundPublish, QoS, SubscriptionOptions};
use bucketmq::session::WillMessage;
use bucketmq::{Broker, BrokerConfig, ConnectOptions, PayloadId, PublishRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Packet {
    Publish {
        topic: String,
        payload: Bytes,
        packet_id: Option<u16>,
        dup: bool,
    },
    PubRel(u16),
}

/// Collects outgoing packets per client
#[derive(Default)]
struct TestSink {
    packets: Mutex<Vec<(String, Packet)>>,
}

impl TestSink {
    fn for_client(&self, client_id: &str) -> Vec<Packet> {
        self.packets
            .lock()
            .iter()
            .filter(|(c, _)| c == client_id)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn clear(&self) {
        self.packets.lock().clear();
    }

    async fn wait_for(&self, client_id: &str, count: usize) -> Vec<Packet> {
        for _ in 0..300 {
            let packets = self.for_client(client_id);
            if packets.len() >= count {
                return packets;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.for_client(client_id)
    }
}

impl ConnectionSink for TestSink {
    fn deliver(&self, client_id: &str, publish: OutboundPublish) {
        self.packets.lock().push((
            client_id.to_string(),
            Packet::Publish {
                topic: publish.topic.to_string(),
                payload: publish.payload,
                packet_id: publish.packet_id,
                dup: publish.dup,
            },
        ));
    }

    fn release(&self, client_id: &str, packet_id: u16) {
        self.packets
            .lock()
            .push((client_id.to_string(), Packet::PubRel(packet_id)));
    }
}

fn publish(topic: &str, payload: &'static str, packet_id: Option<u16>, dup: bool) -> Packet {
    Packet::Publish {
        topic: topic.to_string(),
        payload: Bytes::from_static(payload.as_bytes()),
        packet_id,
        dup,
    }
}

fn config() -> BrokerConfig {
    BrokerConfig {
        buckets: 4,
        ..Default::default()
    }
}

async fn start(config: BrokerConfig, store: Option<Arc<dyn KvStore>>) -> (Broker, Arc<TestSink>) {
    let sink = Arc::new(TestSink::default());
    let hooks: Arc<dyn Hooks> = Arc::new(DefaultHooks);
    let broker = Broker::start(config, store, sink.clone(), hooks)
        .await
        .unwrap();
    (broker, sink)
}

fn session(expiry_interval: u32) -> ConnectOptions {
    ConnectOptions {
        clean_start: false,
        expiry_interval,
        will: None,
    }
}

fn qos1(filter: &str) -> Vec<(String, SubscriptionOptions)> {
    vec![(
        filter.to_string(),
        SubscriptionOptions::with_qos(QoS::AtLeastOnce),
    )]
}

#[tokio::test]
async fn test_dev1_queued_then_acknowledged() {
    let (broker, sink) = start(config(), None).await;
    broker.on_connect("dev-1", session(3600)).await.unwrap();
    broker
        .on_subscribe("dev-1", qos1("sensors/+/temp"))
        .await
        .unwrap();
    broker.on_disconnect("dev-1", false).await.unwrap();

    broker.on_connect("pub", session(0)).await.unwrap();
    let ack = broker
        .on_publish(
            "pub",
            PublishRequest::new("sensors/room1/temp", "21.5", QoS::AtLeastOnce).with_packet_id(1),
        )
        .await
        .unwrap();
    assert_eq!(ack, AckObligation::PubAck(1));
    assert_eq!(broker.session_info("dev-1").await.unwrap().unwrap().queued, 1);

    broker.on_connect("dev-1", session(3600)).await.unwrap();
    assert_eq!(
        sink.for_client("dev-1"),
        vec![publish("sensors/room1/temp", "21.5", Some(1), false)]
    );

    broker.on_puback("dev-1", 1).await.unwrap();
    let info = broker.session_info("dev-1").await.unwrap().unwrap();
    assert_eq!(info.in_flight, 0);
    assert_eq!(info.queued, 0);
    assert_eq!(
        broker.payload_refcount(PayloadId::of(b"21.5")).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_resume_redelivers_window_before_queue() {
    let config = BrokerConfig {
        delivery: DeliveryConfig {
            max_inflight: 2,
            retry_interval: Duration::ZERO,
        },
        ..config()
    };
    let (broker, sink) = start(config, None).await;
    broker.on_connect("dev", session(3600)).await.unwrap();
    broker.on_subscribe("dev", qos1("feed")).await.unwrap();

    for body in ["m1", "m2", "m3"] {
        broker
            .publish("feed", Bytes::from(body), QoS::AtLeastOnce, false)
            .await
            .unwrap();
    }
    // The window holds two; the third waits
    assert_eq!(
        sink.for_client("dev"),
        vec![
            publish("feed", "m1", Some(1), false),
            publish("feed", "m2", Some(2), false),
        ]
    );

    broker.on_disconnect("dev", true).await.unwrap();
    broker
        .publish("feed", Bytes::from("m4"), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    sink.clear();

    assert!(broker.on_connect("dev", session(3600)).await.unwrap());
    assert_eq!(
        sink.for_client("dev"),
        vec![
            publish("feed", "m1", Some(1), true),
            publish("feed", "m2", Some(2), true),
        ]
    );

    sink.clear();
    broker.on_puback("dev", 1).await.unwrap();
    broker.on_puback("dev", 2).await.unwrap();
    assert_eq!(
        sink.for_client("dev"),
        vec![
            publish("feed", "m3", Some(3), false),
            publish("feed", "m4", Some(4), false),
        ]
    );
}

#[tokio::test]
async fn test_retransmission_keeps_packet_ids_and_order() {
    let config = BrokerConfig {
        delivery: DeliveryConfig {
            max_inflight: 10,
            retry_interval: Duration::from_millis(100),
        },
        ..config()
    };
    let (broker, sink) = start(config, None).await;
    broker.on_connect("dev", session(60)).await.unwrap();
    broker.on_subscribe("dev", qos1("t/#")).await.unwrap();

    for (topic, body) in [("t/a", "1"), ("t/b", "2"), ("t/c", "3")] {
        broker
            .publish(topic, Bytes::from(body), QoS::AtLeastOnce, false)
            .await
            .unwrap();
    }

    let packets = sink.wait_for("dev", 6).await;
    assert_eq!(
        packets[..3].to_vec(),
        vec![
            publish("t/a", "1", Some(1), false),
            publish("t/b", "2", Some(2), false),
            publish("t/c", "3", Some(3), false),
        ]
    );
    for packet in &packets[3..] {
        match packet {
            Packet::Publish { dup, packet_id, .. } => {
                assert!(*dup);
                assert!(matches!(packet_id, Some(1..=3)));
            }
            Packet::PubRel(_) => panic!("unexpected PUBREL"),
        }
    }

    for packet_id in 1..=3 {
        broker.on_puback("dev", packet_id).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = sink.for_client("dev").len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sink.for_client("dev").len(), settled);
}

#[tokio::test]
async fn test_retransmit_precedes_later_first_send() {
    let config = BrokerConfig {
        delivery: DeliveryConfig {
            max_inflight: 2,
            retry_interval: Duration::from_millis(150),
        },
        ..config()
    };
    let (broker, sink) = start(config, None).await;
    broker.on_connect("dev", session(60)).await.unwrap();
    broker.on_subscribe("dev", qos1("t/#")).await.unwrap();

    for (topic, body) in [("t/a", "A"), ("t/b", "B"), ("t/c", "C")] {
        broker
            .publish(topic, Bytes::from(body), QoS::AtLeastOnce, false)
            .await
            .unwrap();
    }

    // The window holds A and B; C waits in the queue until B has timed out
    let dup_b = publish("t/b", "B", Some(2), true);
    for _ in 0..300 {
        if sink.for_client("dev").contains(&dup_b) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!sink
        .for_client("dev")
        .contains(&publish("t/c", "C", Some(3), false)));

    broker.on_puback("dev", 1).await.unwrap();
    let packets = sink.for_client("dev");

    let first_sends: Vec<Packet> = packets
        .iter()
        .filter(|p| matches!(p, Packet::Publish { dup: false, .. }))
        .cloned()
        .collect();
    assert_eq!(
        first_sends,
        vec![
            publish("t/a", "A", Some(1), false),
            publish("t/b", "B", Some(2), false),
            publish("t/c", "C", Some(3), false),
        ]
    );

    let position = |packet: &Packet| packets.iter().position(|p| p == packet).unwrap();
    let first_c = position(&publish("t/c", "C", Some(3), false));
    assert!(position(&dup_b) < first_c);

    // Retransmissions keep their packet ids, and A stops once acknowledged
    for packet in &packets {
        if let Packet::Publish {
            topic,
            packet_id,
            dup: true,
            ..
        } = packet
        {
            let expected = match packet_id {
                Some(1) => "t/a",
                Some(2) => "t/b",
                other => panic!("unexpected retransmission {:?}", other),
            };
            assert_eq!(topic, expected);
        }
    }
    tokio::time::sleep(Duration::from_millis(400)).await;
    let later = sink.for_client("dev");
    assert!(later[first_c..]
        .iter()
        .all(|p| !matches!(p, Packet::Publish { packet_id: Some(1), .. })));

    broker.on_puback("dev", 2).await.unwrap();
    broker.on_puback("dev", 3).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = sink.for_client("dev").len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sink.for_client("dev").len(), settled);
}

#[tokio::test]
async fn test_expired_message_is_not_delivered() {
    let (broker, sink) = start(config(), None).await;
    broker.on_connect("dev", session(3600)).await.unwrap();
    broker.on_subscribe("dev", qos1("alerts")).await.unwrap();
    broker.on_disconnect("dev", false).await.unwrap();

    broker.on_connect("pub", session(0)).await.unwrap();
    broker
        .on_publish(
            "pub",
            PublishRequest::new("alerts", "short-lived", QoS::AtLeastOnce)
                .with_packet_id(5)
                .with_expiry(1),
        )
        .await
        .unwrap();
    broker
        .on_publish(
            "pub",
            PublishRequest::new("alerts", "durable", QoS::AtLeastOnce).with_packet_id(6),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    broker.on_connect("dev", session(3600)).await.unwrap();

    assert_eq!(
        sink.for_client("dev"),
        vec![publish("alerts", "durable", Some(1), false)]
    );
    assert_eq!(
        broker
            .payload_refcount(PayloadId::of(b"short-lived"))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_retained_round_trip() {
    let (broker, sink) = start(config(), None).await;
    broker.on_connect("pub", session(0)).await.unwrap();
    broker
        .on_publish(
            "pub",
            PublishRequest::new("home/hall/light", "on", QoS::AtLeastOnce)
                .with_packet_id(1)
                .with_retain(true),
        )
        .await
        .unwrap();
    broker
        .on_publish(
            "pub",
            PublishRequest::new("home/porch/light", "off", QoS::AtMostOnce).with_retain(true),
        )
        .await
        .unwrap();

    broker.on_connect("app", session(60)).await.unwrap();
    broker
        .on_subscribe("app", qos1("home/hall/light"))
        .await
        .unwrap();
    assert_eq!(
        sink.for_client("app"),
        vec![publish("home/hall/light", "on", Some(1), false)]
    );

    sink.clear();
    broker.on_subscribe("app", qos1("home/+/light")).await.unwrap();
    let mut topics: Vec<String> = sink
        .for_client("app")
        .into_iter()
        .filter_map(|p| match p {
            Packet::Publish { topic, .. } => Some(topic),
            Packet::PubRel(_) => None,
        })
        .collect();
    topics.sort();
    assert_eq!(topics, vec!["home/hall/light", "home/porch/light"]);

    // Clearing removes the entry and its payload reference
    broker
        .publish("home/porch/light", Bytes::new(), QoS::AtMostOnce, true)
        .await
        .unwrap();
    assert_eq!(broker.retained_count().await.unwrap(), 1);
    assert_eq!(
        broker.payload_refcount(PayloadId::of(b"off")).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_will_delivery_and_cancellation() {
    let (broker, sink) = start(config(), None).await;
    broker.on_connect("monitor", session(60)).await.unwrap();
    broker
        .on_subscribe("monitor", qos1("status/+"))
        .await
        .unwrap();

    let with_will = |delay_interval| ConnectOptions {
        will: Some(WillMessage {
            topic: Arc::from("status/dev"),
            payload: Bytes::from("lost"),
            qos: QoS::AtLeastOnce,
            retain: false,
            delay_interval,
            expiry_interval: None,
        }),
        ..session(60)
    };

    // Delayed will, cancelled by reconnecting in time
    broker.on_connect("dev", with_will(1)).await.unwrap();
    broker.on_disconnect("dev", true).await.unwrap();
    broker.on_connect("dev", session(60)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(sink.for_client("monitor").is_empty());

    // Delayed will that comes due
    broker.on_connect("dev", with_will(1)).await.unwrap();
    broker.on_disconnect("dev", true).await.unwrap();
    assert!(sink.for_client("monitor").is_empty());
    let packets = sink.wait_for("monitor", 1).await;
    assert_eq!(packets, vec![publish("status/dev", "lost", Some(1), false)]);
}

#[tokio::test]
async fn test_will_fires_when_session_ends() {
    let (broker, sink) = start(config(), None).await;
    broker.on_connect("monitor", session(60)).await.unwrap();
    broker
        .on_subscribe("monitor", qos1("status/dev"))
        .await
        .unwrap();

    // The will delay outlasts a session that ends with its connection
    let options = ConnectOptions {
        will: Some(WillMessage {
            topic: Arc::from("status/dev"),
            payload: Bytes::from("gone"),
            qos: QoS::AtMostOnce,
            retain: false,
            delay_interval: 300,
            expiry_interval: None,
        }),
        ..session(0)
    };
    broker.on_connect("dev", options).await.unwrap();
    broker.on_disconnect("dev", true).await.unwrap();

    let packets = sink.wait_for("monitor", 1).await;
    assert_eq!(packets, vec![publish("status/dev", "gone", None, false)]);
    assert_eq!(broker.session_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_qos2_inbound_dedupe() {
    let (broker, sink) = start(config(), None).await;
    broker.on_connect("sub", session(60)).await.unwrap();
    broker.on_subscribe("sub", qos1("pay")).await.unwrap();
    broker.on_connect("pub", session(60)).await.unwrap();

    let request = PublishRequest::new("pay", "100", QoS::ExactlyOnce).with_packet_id(3);
    for _ in 0..3 {
        let ack = broker.on_publish("pub", request.clone()).await.unwrap();
        assert_eq!(ack, AckObligation::PubRec(3));
    }
    assert_eq!(sink.for_client("sub").len(), 1);
    assert_eq!(
        broker.on_pubrel("pub", 3).await.unwrap(),
        AckObligation::PubComp(3)
    );
    assert_eq!(broker.session_info("pub").await.unwrap().unwrap().awaiting_rel, 0);
}

#[tokio::test]
async fn test_restart_from_fjall_store() {
    let dir = tempfile::tempdir().unwrap();
    let open = || -> Option<Arc<dyn KvStore>> {
        Some(Arc::new(FjallStore::open(dir.path()).unwrap()))
    };

    {
        let (broker, sink) = start(config(), open()).await;
        broker.on_connect("monitor", session(3600)).await.unwrap();
        broker
            .on_subscribe("monitor", qos1("status/+"))
            .await
            .unwrap();
        broker.on_disconnect("monitor", false).await.unwrap();

        let options = ConnectOptions {
            will: Some(WillMessage {
                topic: Arc::from("status/dev"),
                payload: Bytes::from("crashed"),
                qos: QoS::AtLeastOnce,
                retain: false,
                delay_interval: 0,
                expiry_interval: None,
            }),
            ..session(3600)
        };
        broker.on_connect("dev", options).await.unwrap();
        broker.on_subscribe("dev", qos1("cmd")).await.unwrap();
        broker
            .publish("cmd", Bytes::from("reboot"), QoS::AtLeastOnce, false)
            .await
            .unwrap();
        assert_eq!(
            sink.for_client("dev"),
            vec![publish("cmd", "reboot", Some(1), false)]
        );
        broker
            .publish("cfg", Bytes::from("v2"), QoS::AtMostOnce, true)
            .await
            .unwrap();

        // Stop without any disconnect, as a crash would
        broker.shutdown();
    }

    let (broker, sink) = start(config(), open()).await;
    assert_eq!(broker.session_count().await.unwrap(), 2);
    assert_eq!(broker.retained_count().await.unwrap(), 1);

    // The crashed client counts as abnormally disconnected
    let info = broker.session_info("dev").await.unwrap().unwrap();
    assert!(!info.connected);
    assert_eq!(info.in_flight, 1);
    assert_eq!(info.subscriptions, vec!["cmd".to_string()]);

    broker.on_connect("dev", session(3600)).await.unwrap();
    assert_eq!(
        sink.for_client("dev"),
        vec![publish("cmd", "reboot", Some(1), true)]
    );
    broker.on_puback("dev", 1).await.unwrap();
    assert_eq!(
        broker
            .payload_refcount(PayloadId::of(b"reboot"))
            .await
            .unwrap(),
        0
    );

    broker.on_connect("monitor", session(3600)).await.unwrap();
    let packets = sink.wait_for("monitor", 1).await;
    assert_eq!(packets, vec![publish("status/dev", "crashed", Some(1), false)]);

    broker.on_connect("late", session(0)).await.unwrap();
    broker
        .on_subscribe(
            "late",
            vec![("cfg".to_string(), SubscriptionOptions::default())],
        )
        .await
        .unwrap();
    assert_eq!(sink.for_client("late").len(), 1);
}
