use serde_json::{Map, json};
use signalbox::calls::CallEvent;
use signalbox::store::WriteKind;
use signalbox::transport::mock::MockTransportFactory;
use signalbox::{
    CallCoordinator, CallError, CallRecord, CallType, CallerProfile, CoordinatorConfig, EndReason,
    IceCandidate, InMemoryStore, IncomingCallMailbox, LocalCallStatus, MailboxEvent, RecordStore,
    SessionDescription,
};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn dial(
    store: &Arc<InMemoryStore>,
    factory: &MockTransportFactory,
    caller: &str,
    receiver: &str,
) -> Arc<CallCoordinator> {
    CallCoordinator::dial(
        store.clone(),
        factory,
        &CallerProfile::new(caller, caller.to_uppercase()),
        receiver,
        CallType::Audio,
        CoordinatorConfig::default(),
    )
    .await
    .expect("dial failed")
}

async fn wait_status(coordinator: &CallCoordinator, f: impl Fn(&LocalCallStatus) -> bool) {
    let mut rx = coordinator.status_watch();
    let reached = timeout(WAIT, rx.wait_for(|s| f(s)))
        .await
        .expect("timed out waiting for call status")
        .is_ok();
    assert!(reached, "status channel closed");
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

async fn next_mailbox_event(rx: &mut broadcast::Receiver<MailboxEvent>) -> MailboxEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for mailbox event")
        .expect("mailbox channel closed")
}

async fn incoming(rx: &mut broadcast::Receiver<MailboxEvent>) -> CallRecord {
    match next_mailbox_event(rx).await {
        MailboxEvent::Incoming(record) => record,
        other => panic!("expected incoming call, got {other:?}"),
    }
}

fn mailbox(
    store: &Arc<InMemoryStore>,
    identity: &str,
    disabled: bool,
) -> (Arc<IncomingCallMailbox>, broadcast::Receiver<MailboxEvent>) {
    let mailbox = IncomingCallMailbox::new(
        store.clone(),
        identity,
        Arc::new(AtomicBool::new(disabled)),
        CoordinatorConfig::default(),
    );
    let rx = mailbox.subscribe();
    (mailbox, rx)
}

async fn record_gone(store: &Arc<InMemoryStore>, path: &str) -> bool {
    store.get(path).await.unwrap().is_none()
}

#[tokio::test]
async fn test_both_sides_reach_active() {
    init_logger();
    let store = Arc::new(InMemoryStore::new());
    let alice_media = MockTransportFactory::new("alice");
    let bob_media = MockTransportFactory::new("bob");
    let (bob, mut bob_events) = mailbox(&store, "bob", false);
    bob.start().await.unwrap();

    let caller = dial(&store, &alice_media, "alice", "bob").await;
    let record = incoming(&mut bob_events).await;
    assert_eq!(record.id, *caller.call_id());
    assert_eq!(record.caller_name, "ALICE");
    assert!(record.offer.is_some());

    let receiver = bob.accept(&bob_media).await.unwrap();
    assert!(receiver.status().is_active(), "receiver goes active without a round trip");
    wait_status(&caller, |s| s.is_active()).await;

    let stored = store.get("calls/bob").await.unwrap().unwrap();
    assert_eq!(stored["status"], json!("accepted"));
    assert_eq!(stored["answer"]["type"], json!("answer"));

    let alice_transport = alice_media.last_session().unwrap();
    let bob_transport = bob_media.last_session().unwrap();
    assert_eq!(alice_transport.remote_description_sets(), 1);
    assert_eq!(bob_transport.remote_description_sets(), 1);
    assert_eq!(bob_transport.remote_description(), alice_transport.local_description());
    assert_eq!(alice_transport.remote_description(), bob_transport.local_description());
    assert_eq!(record.offer, alice_transport.local_description());

    // Each side applies the other's gathered candidates.
    eventually("candidates on both sides", || {
        let alice = alice_transport.clone();
        let bob = bob_transport.clone();
        async move { alice.applied_candidates().len() == 2 && bob.applied_candidates().len() == 2 }
    })
    .await;
    eventually("remote tracks attached", || {
        let alice = alice_transport.clone();
        let bob = bob_transport.clone();
        async move { !alice.attached_tracks().is_empty() && !bob.attached_tracks().is_empty() }
    })
    .await;
}

#[tokio::test]
async fn test_accept_publishes_a_single_answer() {
    init_logger();
    let store = Arc::new(InMemoryStore::new());
    let alice_media = MockTransportFactory::new("alice");
    let bob_media = MockTransportFactory::new("bob");
    let (bob, mut bob_events) = mailbox(&store, "bob", false);
    bob.start().await.unwrap();

    let caller = dial(&store, &alice_media, "alice", "bob").await;
    incoming(&mut bob_events).await;
    let receiver = bob.accept(&bob_media).await.unwrap();

    assert!(matches!(
        receiver.accept().await,
        Err(CallError::InvalidState { action: "accept", .. })
    ));
    assert!(matches!(bob.accept(&bob_media).await, Err(CallError::NoPendingCall)));
    wait_status(&caller, |s| s.is_active()).await;

    let answers = store
        .writes_under("calls/bob")
        .await
        .into_iter()
        .filter(|op| op.value.as_ref().is_some_and(|v| v.get("answer").is_some()))
        .count();
    assert_eq!(answers, 1);
    assert_eq!(bob_media.opened_count(), 1);

    // A repeated accepted notification does not re-apply the answer.
    let stored = store.get("calls/bob").await.unwrap().unwrap();
    let mut fields = Map::new();
    fields.insert("answer".into(), stored["answer"].clone());
    fields.insert("timestamp".into(), json!(stored["timestamp"].as_i64().unwrap() + 1));
    store.update("calls/bob", fields).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(alice_media.last_session().unwrap().remote_description_sets(), 1);
    assert!(caller.status().is_active());
}

#[tokio::test]
async fn test_hangup_ends_both_sides_without_duplicate_writes() {
    init_logger();
    let store = Arc::new(InMemoryStore::new());
    let alice_media = MockTransportFactory::new("alice");
    let bob_media = MockTransportFactory::new("bob");
    let (bob, mut bob_events) = mailbox(&store, "bob", false);
    bob.start().await.unwrap();

    let caller = dial(&store, &alice_media, "alice", "bob").await;
    incoming(&mut bob_events).await;
    let receiver = bob.accept(&bob_media).await.unwrap();
    wait_status(&caller, |s| s.is_active()).await;

    receiver.end().await.unwrap();
    assert_eq!(receiver.status().end_reason(), Some(EndReason::LocalHangup));
    wait_status(&caller, |s| s.is_ended()).await;
    assert_eq!(caller.status().end_reason(), Some(EndReason::RemoteHangup));
    assert!(record_gone(&store, "calls/bob").await);

    let writes = store.journal().await.len();
    caller.end().await.unwrap();
    receiver.end().await.unwrap();
    assert_eq!(store.journal().await.len(), writes);

    assert!(alice_media.last_session().unwrap().is_closed());
    assert!(bob_media.last_session().unwrap().is_closed());
    let candidates = format!("calls/candidates/{}", caller.call_id());
    assert!(record_gone(&store, &candidates).await);
}

#[tokio::test]
async fn test_candidates_after_close_are_dropped() {
    init_logger();
    let store = Arc::new(InMemoryStore::new());
    let alice_media = MockTransportFactory::new("alice");
    let caller = dial(&store, &alice_media, "alice", "bob").await;
    let transport = alice_media.last_session().unwrap();

    caller.end().await.unwrap();
    assert_eq!(store.watcher_count(), 0);

    let late = IceCandidate::new("candidate:9 1 UDP 1 10.0.0.9 5009 typ host");
    let partition = format!("calls/candidates/{}/receiver", caller.call_id());
    store
        .push(&partition, serde_json::to_value(&late).unwrap())
        .await
        .unwrap();
    assert!(!transport.emit(signalbox::transport::TransportEvent::LocalCandidate(late)));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.applied_candidates().is_empty());
    assert!(caller.status().is_ended());
}

#[tokio::test]
async fn test_early_receiver_candidates_are_applied_after_answer() {
    init_logger();
    let store = Arc::new(InMemoryStore::new());
    let alice_media = MockTransportFactory::new("alice").with_candidates(0);
    let caller = dial(&store, &alice_media, "alice", "bob").await;
    let transport = alice_media.last_session().unwrap();

    let partition = format!("calls/candidates/{}/receiver", caller.call_id());
    for n in 0..3 {
        let candidate =
            IceCandidate::new(format!("candidate:{n} 1 UDP 1 10.1.0.{n} 600{n} typ srflx"))
                .with_sdp_mid("0");
        store
            .push(&partition, serde_json::to_value(&candidate).unwrap())
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.applied_candidates().is_empty());
    assert!(caller.status().is_ringing());

    let mut fields = Map::new();
    fields.insert("status".into(), json!("accepted"));
    fields.insert(
        "answer".into(),
        serde_json::to_value(SessionDescription::answer("v=0 remote")).unwrap(),
    );
    store.update("calls/bob", fields).await.unwrap();

    wait_status(&caller, |s| s.is_active()).await;
    let applied = transport.applied_candidates();
    assert_eq!(applied.len(), 3);
    assert!(applied[0].candidate.starts_with("candidate:0 "));
    assert!(applied[2].candidate.starts_with("candidate:2 "));
}

#[tokio::test]
async fn test_caller_hangup_dismisses_pending_call() {
    init_logger();
    let store = Arc::new(InMemoryStore::new());
    let alice_media = MockTransportFactory::new("alice");
    let bob_media = MockTransportFactory::new("bob");
    let (bob, mut bob_events) = mailbox(&store, "bob", false);
    bob.start().await.unwrap();

    let caller = dial(&store, &alice_media, "alice", "bob").await;
    let record = incoming(&mut bob_events).await;
    let ringing =
        CallCoordinator::answer(store.clone(), &bob_media, record.clone(), Default::default())
            .await
            .unwrap();

    caller.end().await.unwrap();
    assert_eq!(
        next_mailbox_event(&mut bob_events).await,
        MailboxEvent::Dismissed { call_id: record.id }
    );
    wait_status(&ringing, |s| s.is_ended()).await;
    assert_eq!(ringing.status().end_reason(), Some(EndReason::RemoteHangup));
    assert!(bob.pending().await.is_none());
}

#[tokio::test]
async fn test_reject_ends_caller_and_clears_record() {
    init_logger();
    let store = Arc::new(InMemoryStore::new());
    let alice_media = MockTransportFactory::new("alice");
    let bob_media = MockTransportFactory::new("bob");
    let caller = dial(&store, &alice_media, "alice", "bob").await;
    let seed = signalbox::SignalingChannel::new(store.clone())
        .fetch_call("bob")
        .await
        .unwrap()
        .unwrap();

    let receiver = CallCoordinator::answer(store.clone(), &bob_media, seed, Default::default())
        .await
        .unwrap();
    receiver.reject().await.unwrap();
    assert_eq!(receiver.status().end_reason(), Some(EndReason::LocalRejected));

    wait_status(&caller, |s| s.is_ended()).await;
    assert_eq!(caller.status().end_reason(), Some(EndReason::RemoteRejected));
    eventually("record deleted by caller", || record_gone(&store, "calls/bob")).await;
}

#[tokio::test]
async fn test_calls_disabled_auto_rejects() {
    init_logger();
    let store = Arc::new(InMemoryStore::new());
    let alice_media = MockTransportFactory::new("alice");
    let bob_media = MockTransportFactory::new("bob");
    let (bob, mut bob_events) = mailbox(&store, "bob", true);
    bob.start().await.unwrap();

    let caller = dial(&store, &alice_media, "alice", "bob").await;
    assert!(matches!(
        next_mailbox_event(&mut bob_events).await,
        MailboxEvent::AutoRejected(_)
    ));

    wait_status(&caller, |s| s.is_ended()).await;
    assert_eq!(caller.status().end_reason(), Some(EndReason::RemoteRejected));
    assert_eq!(bob_media.opened_count(), 0);
    eventually("record deleted by caller", || record_gone(&store, "calls/bob")).await;
}

#[tokio::test]
async fn test_receiver_media_failure_declines_call() {
    init_logger();
    let store = Arc::new(InMemoryStore::new());
    let alice_media = MockTransportFactory::new("alice");
    let bob_media = MockTransportFactory::new("bob");
    bob_media.deny_media(true);
    let (bob, mut bob_events) = mailbox(&store, "bob", false);
    bob.start().await.unwrap();

    let caller = dial(&store, &alice_media, "alice", "bob").await;
    incoming(&mut bob_events).await;
    assert!(matches!(
        bob.accept(&bob_media).await,
        Err(CallError::MediaAcquisition(_))
    ));

    wait_status(&caller, |s| s.is_ended()).await;
    assert_eq!(caller.status().end_reason(), Some(EndReason::RemoteRejected));
}

#[tokio::test]
async fn test_answer_apply_failure_ends_both_sides() {
    init_logger();
    let store = Arc::new(InMemoryStore::new());
    let alice_media = MockTransportFactory::new("alice");
    alice_media.fail_remote_description(true);
    let bob_media = MockTransportFactory::new("bob");
    let (bob, mut bob_events) = mailbox(&store, "bob", false);
    bob.start().await.unwrap();

    let caller = dial(&store, &alice_media, "alice", "bob").await;
    incoming(&mut bob_events).await;
    let receiver = bob.accept(&bob_media).await.unwrap();

    wait_status(&caller, |s| s.is_ended()).await;
    assert_eq!(caller.status().end_reason(), Some(EndReason::NegotiationFailed));
    wait_status(&receiver, |s| s.is_ended()).await;
    assert_eq!(receiver.status().end_reason(), Some(EndReason::RemoteHangup));
    assert!(record_gone(&store, "calls/bob").await);
}

#[tokio::test]
async fn test_second_caller_replaces_first() {
    init_logger();
    let store = Arc::new(InMemoryStore::new());
    let alice_media = MockTransportFactory::new("alice");
    let carol_media = MockTransportFactory::new("carol");

    let first = dial(&store, &alice_media, "alice", "bob").await;
    let second = dial(&store, &carol_media, "carol", "bob").await;

    wait_status(&first, |s| s.is_ended()).await;
    assert_eq!(first.status().end_reason(), Some(EndReason::RemoteHangup));

    // The superseded caller leaves the newer record alone.
    first.end().await.unwrap();
    let stored = store.get("calls/bob").await.unwrap().unwrap();
    assert_eq!(stored["id"], json!(second.call_id().as_str()));
    assert!(second.status().is_ringing());
}

#[tokio::test(start_paused = true)]
async fn test_duration_ticks_only_while_active() {
    init_logger();
    let store = Arc::new(InMemoryStore::new());
    let alice_media = MockTransportFactory::new("alice");
    let bob_media = MockTransportFactory::new("bob");
    let (bob, mut bob_events) = mailbox(&store, "bob", false);
    bob.start().await.unwrap();

    let caller = dial(&store, &alice_media, "alice", "bob").await;
    let mut alice_events = caller.subscribe();
    incoming(&mut bob_events).await;
    let receiver = bob.accept(&bob_media).await.unwrap();
    wait_status(&caller, |s| s.is_active()).await;
    assert_eq!(caller.duration_secs(), 0);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(caller.duration_secs(), 3);
    assert_eq!(receiver.duration_secs(), 3);

    let mut ticks = Vec::new();
    while let Ok(event) = alice_events.try_recv() {
        if let CallEvent::Duration(secs) = event {
            ticks.push(secs);
        }
    }
    assert_eq!(ticks, vec![1, 2, 3]);

    caller.end().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(caller.duration_secs(), 3);
    assert_eq!(signalbox::calls::format_duration(caller.duration_secs()), "0:03");
}

#[tokio::test]
async fn test_write_failure_on_publish_leaves_no_record() {
    init_logger();
    let store = Arc::new(InMemoryStore::new());
    let alice_media = MockTransportFactory::new("alice");
    store.fail_writes(true);

    let result = CallCoordinator::dial(
        store.clone(),
        &alice_media,
        &CallerProfile::new("alice", "Alice"),
        "bob",
        CallType::Audio,
        CoordinatorConfig::default(),
    )
    .await;
    assert!(matches!(result, Err(CallError::SignalingWrite(_))));

    store.fail_writes(false);
    assert!(record_gone(&store, "calls/bob").await);
    assert!(
        store
            .journal()
            .await
            .iter()
            .all(|op| op.kind != WriteKind::Set)
    );
    assert!(alice_media.last_session().unwrap().is_closed());
}
