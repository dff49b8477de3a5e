//! RouterCore tests
//!
//! Drive the sans-IO router directly: packets in, actions out. Deferred
//! actions are expanded with `resolve` the way the server's sinks do.

use std::{sync::Arc, time::Duration};

use elvin_core::{BasicExpressions, Environment, security::prime_key};
use elvin_proto::{
    ConnectionOptions, KeyBlock, KeyScheme, NackCode, Notification, Packet, Value,
    keys::{Key, KeyHash},
    payloads::{
        ConnRqst, DisconnReason, DisconnRqst, NotifyEmit, QnchAddRqst, SecRqst, SubAddRqst,
        SubDelRqst, SubModRqst, UNotify,
    },
};
use elvin_router::{RouterAction, RouterConfig, RouterCore};
use parking_lot::Mutex;
use proptest::prelude::*;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[derive(Clone)]
struct TestEnv {
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl TestEnv {
    fn seeded(seed: u64) -> Self {
        Self { rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))) }
    }
}

impl Environment for TestEnv {
    fn now(&self) -> std::time::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().fill_bytes(buffer);
    }
}

type Core = RouterCore<TestEnv, BasicExpressions>;

fn router() -> Core {
    RouterCore::new(TestEnv::seeded(7), BasicExpressions, RouterConfig::default())
}

/// Expand deferred actions until only packets and closes remain.
fn settle(core: &Core, actions: Vec<RouterAction>) -> Vec<RouterAction> {
    let mut pending = actions;
    let mut done = Vec::new();
    while !pending.is_empty() {
        let mut next = Vec::new();
        for action in pending {
            if action.is_deferred() {
                next.extend(core.resolve(action));
            } else {
                done.push(action);
            }
        }
        pending = next;
    }
    done
}

fn handle(core: &Core, session: u32, packet: impl Into<Packet>) -> Vec<RouterAction> {
    settle(core, core.handle_packet(session, packet.into()))
}

fn packets_for(actions: &[RouterAction], target: u32) -> Vec<Packet> {
    actions
        .iter()
        .filter_map(|action| match action {
            RouterAction::Send { session, packet } | RouterAction::Deliver { session, packet }
                if *session == target =>
            {
                Some(packet.clone())
            },
            _ => None,
        })
        .collect()
}

fn connect_with(core: &Core, request: ConnRqst) -> u32 {
    let id = core.open_session("test".to_owned()).unwrap();
    let actions = handle(core, id, request);
    assert!(matches!(&packets_for(&actions, id)[..], [Packet::ConnRply(_)]));
    id
}

fn connect(core: &Core) -> u32 {
    connect_with(core, ConnRqst::new(1))
}

fn subscribe(core: &Core, session: u32, expression: &str, keys: KeyBlock) -> u64 {
    let request = SubAddRqst { xid: 2, expression: expression.to_owned(), accept_insecure: true, keys };
    match &packets_for(&handle(core, session, request), session)[..] {
        [Packet::SubRply(reply)] => reply.subscription_id,
        other => panic!("unexpected reply: {other:?}"),
    }
}

fn emit(attributes: Notification, deliver_insecure: bool, keys: KeyBlock) -> NotifyEmit {
    NotifyEmit { attributes, deliver_insecure, keys }
}

fn nack_code(packets: &[Packet]) -> Option<NackCode> {
    packets.iter().find_map(|packet| match packet {
        Packet::Nack(nack) => Some(nack.code),
        _ => None,
    })
}

#[test]
fn connect_echoes_negotiated_options() {
    let core = router();
    let id = core.open_session("peer".to_owned()).unwrap();
    let mut request = ConnRqst::new(1);
    request.options = ConnectionOptions::new()
        .with(ConnectionOptions::SUBSCRIPTION_MAX_COUNT, 5)
        .with("Made.Up", 1);

    let packets = packets_for(&handle(&core, id, request), id);
    let [Packet::ConnRply(reply)] = &packets[..] else {
        panic!("expected ConnRply, got {packets:?}");
    };
    assert_eq!(reply.xid, 1);
    assert_eq!(reply.options.get_int(ConnectionOptions::SUBSCRIPTION_MAX_COUNT), Some(5));
    assert_eq!(reply.options.len(), 1);
}

#[test]
fn incompatible_version_is_refused() {
    let core = router();
    let id = core.open_session("peer".to_owned()).unwrap();
    let mut request = ConnRqst::new(1);
    request.version_major = 3;

    let actions = handle(&core, id, request);
    assert_eq!(nack_code(&packets_for(&actions, id)), Some(NackCode::ProtocolIncompatible));
    assert!(actions.iter().any(|action| matches!(action, RouterAction::Close { .. })));
}

#[test]
fn notify_before_connect_is_a_protocol_violation() {
    let core = router();
    let id = core.open_session("peer".to_owned()).unwrap();

    let actions = handle(&core, id, emit(Notification::new().with("x", 1), true, KeyBlock::new()));
    let packets = packets_for(&actions, id);
    assert!(matches!(&packets[..], [Packet::Disconn(d)] if d.reason == DisconnReason::ProtocolViolation));
    assert!(matches!(actions.last(), Some(RouterAction::Close { session, .. }) if *session == id));
}

#[test]
fn second_conn_rqst_is_already_connected() {
    let core = router();
    let id = connect(&core);

    let packets = packets_for(&handle(&core, id, ConnRqst::new(5)), id);
    let [Packet::Nack(nack)] = &packets[..] else {
        panic!("expected Nack, got {packets:?}");
    };
    assert_eq!(nack.xid, 5);
    assert_eq!(nack.code, NackCode::ProtocolError);
    assert_eq!(nack.args, vec![Value::from("already connected")]);

    // Still usable.
    subscribe(&core, id, "require(Group)", KeyBlock::new());
}

#[test]
fn insecure_delivery_reaches_only_matching_subscriber() {
    let core = router();
    let a = connect(&core);
    let b = connect(&core);
    let c = connect(&core);

    let sub_a = subscribe(&core, a, "require(Group)", KeyBlock::new());
    subscribe(&core, c, "require(Other)", KeyBlock::new());

    let notification = Notification::new().with("Group", "eng").with("count", 7);
    let actions = handle(&core, b, emit(notification.clone(), true, KeyBlock::new()));

    let delivered = packets_for(&actions, a);
    let [Packet::NotifyDeliver(deliver)] = &delivered[..] else {
        panic!("expected one delivery, got {delivered:?}");
    };
    assert_eq!(deliver.attributes, notification);
    assert_eq!(deliver.insecure_matches, vec![sub_a]);
    assert!(deliver.secure_matches.is_empty());

    assert!(packets_for(&actions, b).is_empty());
    assert!(packets_for(&actions, c).is_empty());
}

#[test]
fn unotify_on_new_connection_is_dispatched() {
    let core = router();
    let a = connect(&core);
    let sub = subscribe(&core, a, "require(Group)", KeyBlock::new());

    let anonymous = core.open_session("anon".to_owned()).unwrap();
    let unotify = UNotify {
        client_major: 4,
        client_minor: 0,
        attributes: Notification::new().with("Group", "ops"),
        deliver_insecure: true,
        keys: KeyBlock::new(),
    };
    let delivered = packets_for(&handle(&core, anonymous, unotify), a);
    assert!(matches!(&delivered[..], [Packet::NotifyDeliver(d)] if d.insecure_matches == vec![sub]));
}

#[test]
fn key_match_is_delivered_securely() {
    let core = router();
    let consumer = connect(&core);
    let producer = connect(&core);

    let secret = Key::from("launch codes");
    let public = prime_key(KeyHash::Sha256, &secret);
    let sub_keys = KeyBlock::new().with_key(KeyScheme::Sha256Producer, 0, public).unwrap();
    let request = SubAddRqst {
        xid: 3,
        expression: "require(Group)".to_owned(),
        accept_insecure: false,
        keys: sub_keys,
    };
    let sub = match &packets_for(&handle(&core, consumer, request), consumer)[..] {
        [Packet::SubRply(reply)] => reply.subscription_id,
        other => panic!("unexpected reply: {other:?}"),
    };

    // Insecure notification is refused by an accept_insecure=false subscription.
    let attributes = Notification::new().with("Group", "eng");
    let actions = handle(&core, producer, emit(attributes.clone(), true, KeyBlock::new()));
    assert!(packets_for(&actions, consumer).is_empty());

    let notify_keys = KeyBlock::new().with_key(KeyScheme::Sha256Producer, 0, secret).unwrap();
    let delivered = packets_for(&handle(&core, producer, emit(attributes, false, notify_keys)), consumer);
    assert!(matches!(&delivered[..], [Packet::NotifyDeliver(d)] if d.secure_matches == vec![sub]));
}

#[test]
fn connection_keys_authorize_deliveries() {
    let core = router();
    let secret = Key::from("shared");
    let public = prime_key(KeyHash::Sha1, &secret);

    let mut consumer_request = ConnRqst::new(1);
    consumer_request.subscription_keys = KeyBlock::new().with_key(KeyScheme::Sha1Producer, 0, public).unwrap();
    let consumer = connect_with(&core, consumer_request);
    let producer = connect(&core);

    let request = SubAddRqst {
        xid: 2,
        expression: "Group == \"eng\"".to_owned(),
        accept_insecure: false,
        keys: KeyBlock::new(),
    };
    handle(&core, consumer, request);

    let attributes = Notification::new().with("Group", "eng");
    let actions = handle(&core, producer, emit(attributes.clone(), false, KeyBlock::new()));
    assert!(packets_for(&actions, consumer).is_empty());

    // SecRqst adds the secret to the producing connection.
    let sec = SecRqst {
        xid: 9,
        add_notification_keys: KeyBlock::new().with_key(KeyScheme::Sha1Producer, 0, secret).unwrap(),
        ..SecRqst::default()
    };
    let replies = packets_for(&handle(&core, producer, sec), producer);
    assert!(matches!(&replies[..], [Packet::SecRply(reply)] if reply.xid == 9));

    let delivered = packets_for(&handle(&core, producer, emit(attributes, false, KeyBlock::new())), consumer);
    assert!(matches!(&delivered[..], [Packet::NotifyDeliver(d)] if d.secure_matches.len() == 1));
}

#[test]
fn modify_unknown_subscription_is_nacked() {
    let core = router();
    let id = connect(&core);
    let sub = subscribe(&core, id, "require(Group)", KeyBlock::new());
    let unknown = sub ^ 1;

    let mut request = SubModRqst::new(4, unknown);
    request.expression = "require(Other)".to_owned();
    let packets = packets_for(&handle(&core, id, request), id);
    let [Packet::Nack(nack)] = &packets[..] else {
        panic!("expected Nack, got {packets:?}");
    };
    assert_eq!(nack.code, NackCode::NoSuchSubscription);
    assert_eq!(nack.args, vec![Value::Int64(unknown as i64)]);

    let session = core.session(id).unwrap();
    assert_eq!(session.lock().registry.subscription(sub).unwrap().expression, "require(Group)");
}

#[test]
fn empty_expression_modify_keeps_filter() {
    let core = router();
    let consumer = connect(&core);
    let producer = connect(&core);
    let sub = subscribe(&core, consumer, "require(Group)", KeyBlock::new());

    let mut request = SubModRqst::new(5, sub);
    request.accept_insecure = Some(true);
    let replies = packets_for(&handle(&core, consumer, request), consumer);
    assert!(matches!(&replies[..], [Packet::SubRply(reply)] if reply.subscription_id == sub));

    let attributes = Notification::new().with("Group", "eng");
    let delivered = packets_for(&handle(&core, producer, emit(attributes, true, KeyBlock::new())), consumer);
    assert_eq!(delivered.len(), 1);
}

#[test]
fn parse_errors_and_limits_are_nacked() {
    let core = router();
    let mut request = ConnRqst::new(1);
    request.options = ConnectionOptions::new()
        .with(ConnectionOptions::SUBSCRIPTION_MAX_COUNT, 1)
        .with(ConnectionOptions::SUBSCRIPTION_MAX_LENGTH, 20);
    let id = connect_with(&core, request);

    let bad = SubAddRqst { xid: 2, expression: "Group ==".to_owned(), accept_insecure: true, keys: KeyBlock::new() };
    assert_eq!(nack_code(&packets_for(&handle(&core, id, bad), id)), Some(NackCode::ParseError));

    let long = SubAddRqst {
        xid: 3,
        expression: "require(AVeryLongAttributeName)".to_owned(),
        accept_insecure: true,
        keys: KeyBlock::new(),
    };
    assert_eq!(nack_code(&packets_for(&handle(&core, id, long), id)), Some(NackCode::ImplementationLimit));

    subscribe(&core, id, "require(Group)", KeyBlock::new());
    let extra = SubAddRqst { xid: 4, expression: "require(x)".to_owned(), accept_insecure: true, keys: KeyBlock::new() };
    assert_eq!(nack_code(&packets_for(&handle(&core, id, extra), id)), Some(NackCode::ImplementationLimit));
}

#[test]
fn silent_connections_expire_after_handshake_timeout() {
    let config = RouterConfig { handshake_timeout: Duration::ZERO, ..RouterConfig::default() };
    let core = RouterCore::new(TestEnv::seeded(3), BasicExpressions, config);
    let connected = connect(&core);
    let silent = core.open_session("silent".to_owned()).unwrap();

    assert!(core.expire_handshake(connected).is_empty());
    let actions = core.expire_handshake(silent);
    assert!(matches!(&actions[..], [RouterAction::Close { session, .. }] if *session == silent));

    // Closed sessions reject further packets instead of connecting late.
    let late = packets_for(&handle(&core, silent, ConnRqst::new(9)), silent);
    assert!(!late.iter().any(|packet| matches!(packet, Packet::ConnRply(_))));
    core.close_session(silent);
    assert!(core.expire_handshake(silent).is_empty());
}

#[test]
fn deeply_nested_expression_is_nacked() {
    let core = router();
    let id = connect(&core);

    // Exactly the default Subscription.Max-Length.
    let expression = format!("{}require(Group){}", "(".repeat(1017), ")".repeat(1017));
    assert_eq!(expression.len(), 2048);
    let request = SubAddRqst { xid: 2, expression, accept_insecure: true, keys: KeyBlock::new() };
    let replies = packets_for(&handle(&core, id, request), id);
    assert_eq!(nack_code(&replies), Some(NackCode::ParseError));
    assert_eq!(core.describe_sessions()[0].subscriptions, 0);

    subscribe(&core, id, "((require(Group)))", KeyBlock::new());
}

#[test]
fn quench_hears_about_subscriptions() {
    let core = router();
    let quencher = connect(&core);
    let subscriber = connect(&core);

    let request = QnchAddRqst {
        xid: 2,
        names: vec!["Group".to_owned()],
        deliver_insecure: true,
        keys: KeyBlock::new(),
    };
    let quench = match &packets_for(&handle(&core, quencher, request), quencher)[..] {
        [Packet::QnchRply(reply)] => reply.quench_id,
        other => panic!("unexpected reply: {other:?}"),
    };

    let actions = handle(
        &core,
        subscriber,
        SubAddRqst { xid: 3, expression: "require(Group)".to_owned(), accept_insecure: true, keys: KeyBlock::new() },
    );
    let sub = match &packets_for(&actions, subscriber)[..] {
        [Packet::SubRply(reply)] => reply.subscription_id,
        other => panic!("unexpected reply: {other:?}"),
    };
    let notices = packets_for(&actions, quencher);
    let [Packet::SubAddNotify(notice)] = &notices[..] else {
        panic!("expected SubAddNotify, got {notices:?}");
    };
    assert_eq!(notice.quench_ids, vec![quench]);
    assert_eq!(notice.term_id, sub);
    assert_eq!(notice.expression, "require(Group)");
    assert!(notice.insecure);

    // Unrelated attribute names produce no notice.
    let actions = handle(&core, subscriber, SubAddRqst {
        xid: 4,
        expression: "require(Other)".to_owned(),
        accept_insecure: true,
        keys: KeyBlock::new(),
    });
    assert!(packets_for(&actions, quencher).is_empty());

    let actions = handle(&core, subscriber, SubDelRqst { xid: 5, subscription_id: sub });
    assert!(matches!(&packets_for(&actions, quencher)[..], [Packet::SubDelNotify(n)] if n.term_id == sub));
}

#[test]
fn new_quench_learns_existing_subscriptions() {
    let core = router();
    let subscriber = connect(&core);
    let quencher = connect(&core);
    let sub = subscribe(&core, subscriber, "Group == \"eng\" && require(count)", KeyBlock::new());

    let request = QnchAddRqst {
        xid: 2,
        names: vec!["count".to_owned()],
        deliver_insecure: true,
        keys: KeyBlock::new(),
    };
    let packets = packets_for(&handle(&core, quencher, request), quencher);
    assert!(matches!(&packets[0], Packet::QnchRply(_)));
    assert!(matches!(&packets[1], Packet::SubAddNotify(n) if n.term_id == sub));
}

#[test]
fn closing_a_session_notifies_quenchers() {
    let core = router();
    let quencher = connect(&core);
    let subscriber = connect(&core);
    handle(&core, quencher, QnchAddRqst {
        xid: 2,
        names: vec!["Group".to_owned()],
        deliver_insecure: true,
        keys: KeyBlock::new(),
    });
    let sub = subscribe(&core, subscriber, "require(Group)", KeyBlock::new());

    let actions = settle(&core, core.close_session(subscriber));
    assert!(matches!(&packets_for(&actions, quencher)[..], [Packet::SubDelNotify(n)] if n.term_id == sub));
    assert!(core.session(subscriber).is_none());
    assert_eq!(core.session_count(), 1);
}

#[test]
fn disconn_rqst_is_answered_and_closed() {
    let core = router();
    let id = connect(&core);
    let actions = handle(&core, id, DisconnRqst { xid: 8 });
    assert!(matches!(&packets_for(&actions, id)[..], [Packet::DisconnRply(r)] if r.xid == 8));
    assert!(matches!(actions.last(), Some(RouterAction::Close { .. })));
}

#[test]
fn connection_limit_is_enforced() {
    let config = RouterConfig { max_connections: 2, ..RouterConfig::default() };
    let core = RouterCore::new(TestEnv::seeded(1), BasicExpressions, config);
    let first = core.open_session("a".to_owned()).unwrap();
    core.open_session("b".to_owned()).unwrap();
    assert!(core.open_session("c".to_owned()).is_none());

    core.close_session(first);
    assert!(core.open_session("c".to_owned()).is_some());
}

#[test]
fn shutdown_broadcast_reaches_every_session() {
    let core = router();
    let ids = [connect(&core), connect(&core)];
    let actions = core.broadcast_disconnect(&elvin_proto::payloads::Disconn::new(DisconnReason::Shutdown));
    for id in ids {
        assert!(matches!(&packets_for(&actions, id)[..], [Packet::Disconn(d)] if d.reason == DisconnReason::Shutdown));
    }
    assert_eq!(core.describe_sessions().len(), 2);
}

proptest! {
    #[test]
    fn registry_follows_add_and_delete(ops in proptest::collection::vec(any::<bool>(), 1..40), seed in any::<u64>()) {
        let core = RouterCore::new(TestEnv::seeded(seed), BasicExpressions, RouterConfig::default());
        let id = connect(&core);
        let mut live: Vec<u64> = Vec::new();

        for add in ops {
            if add || live.is_empty() {
                live.push(subscribe(&core, id, "require(Group)", KeyBlock::new()));
            } else {
                let sub = live.remove(0);
                let packets = packets_for(&handle(&core, id, SubDelRqst { xid: 1, subscription_id: sub }), id);
                prop_assert!(matches!(&packets[..], [Packet::SubRply(r)] if r.subscription_id == sub));
            }
        }

        let session = core.session(id).unwrap();
        prop_assert_eq!(session.lock().registry.subscription_count(), live.len());
        for sub in &live {
            prop_assert_eq!((*sub >> 32) as u32, id);
        }
    }
}
