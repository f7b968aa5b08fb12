use anyhow::{Context, bail};
use chrono::Local;
use log::info;
use signalbox::calls::format_duration;
use signalbox::transport::mock::MockTransportFactory;
use signalbox::{
    CallCoordinator, CallEvent, CallType, CallerProfile, CoordinatorConfig, InMemoryStore,
    IncomingCallMailbox, MailboxEvent, RecordStore,
};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

// Demo of a full call between two participants sharing an in-memory store.
//
// Usage:
//   cargo run                     # alice calls bob, talks for 3 seconds
//   RUST_LOG=debug cargo run      # include store writes and candidate flow

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryStore::new());
    let config = CoordinatorConfig::default();
    let alice_media = MockTransportFactory::new("alice");
    let bob_media = MockTransportFactory::new("bob");

    let mailbox = IncomingCallMailbox::new(
        store.clone(),
        "bob",
        Arc::new(AtomicBool::new(false)),
        config.clone(),
    );
    let mut incoming = mailbox.subscribe();
    mailbox.start().await?;

    let caller = CallCoordinator::dial(
        store.clone(),
        &alice_media,
        &CallerProfile::new("alice", "Alice"),
        "bob",
        CallType::Audio,
        config,
    )
    .await?;

    let receiver = match tokio::time::timeout(Duration::from_secs(5), incoming.recv()).await?? {
        MailboxEvent::Incoming(record) => {
            info!("Bob sees a call from {}", record.caller_name);
            mailbox.accept(&bob_media).await?
        }
        other => bail!("unexpected mailbox event: {:?}", other),
    };

    let mut alice_status = caller.status_watch();
    tokio::time::timeout(Duration::from_secs(5), alice_status.wait_for(|s| s.is_active()))
        .await??;
    info!("Both sides active: alice={}, bob={}", caller.status(), receiver.status());

    let mut alice_events = caller.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = alice_events.recv().await {
            if let CallEvent::Duration(secs) = event {
                info!("Alice call time {}", format_duration(secs));
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(1500)).await;
    caller.set_muted(true).await;
    receiver.set_speaker(false).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    caller.end().await?;
    let mut bob_status = receiver.status_watch();
    tokio::time::timeout(Duration::from_secs(5), bob_status.wait_for(|s| s.is_ended())).await??;
    info!(
        "Call over after {}: alice={}, bob={}",
        format_duration(caller.duration_secs()),
        caller.status(),
        receiver.status()
    );

    mailbox.stop().await;
    Ok(())
}
