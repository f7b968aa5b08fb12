//! Typed access to call records and candidate partitions in the record store.
//!
//! The record lives at `calls/{receiver_id}`; each participant appends its
//! candidates under `calls/candidates/{call_id}/{side}`.

use crate::store::{ChildAdded, RecordStore, Subscription, Unsubscribe};
use log::{debug, info, warn};
use serde_json::Value;
use signalbox_core::store::paths::{call_path, candidate_partition_path, candidates_path};
use signalbox_core::store::{Result, StoreError, to_store_fields, to_store_value};
use signalbox_core::{CallId, CallRecord, CallRole, CallUpdate, IceCandidate};
use std::sync::Arc;

/// What a record watcher observed at a receiver's key.
#[derive(Debug, Clone, PartialEq)]
pub enum CallSnapshot {
    Present(CallRecord),
    Absent,
}

impl CallSnapshot {
    pub fn record(&self) -> Option<&CallRecord> {
        match self {
            CallSnapshot::Present(record) => Some(record),
            CallSnapshot::Absent => None,
        }
    }
}

#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn RecordStore>,
}

impl SignalingChannel {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Write the whole record at the receiver's key, replacing any existing one.
    pub async fn publish_call(&self, record: &CallRecord) -> Result<()> {
        let path = call_path(&record.receiver_id);
        debug!("Publishing call {} at {}", record.id, path);
        self.store.set(&path, to_store_value(record)?).await
    }

    /// Merge the present fields of `update` into the record. Empty updates are
    /// not written.
    pub async fn update_call(&self, receiver_id: &str, update: &CallUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let path = call_path(receiver_id);
        debug!("Updating call at {}: {:?}", path, update.status);
        self.store.update(&path, to_store_fields(update)?).await
    }

    pub async fn delete_call(&self, receiver_id: &str) -> Result<()> {
        self.store.remove(&call_path(receiver_id)).await
    }

    /// Delete the record only while it still belongs to `call_id`. A newer call
    /// that replaced it at the same key is left alone.
    pub async fn delete_call_if_current(
        &self,
        receiver_id: &str,
        call_id: &CallId,
    ) -> Result<bool> {
        match self.fetch_call(receiver_id).await? {
            Some(current) if &current.id != call_id => {
                debug!(
                    "Not deleting {}: key now holds call {}",
                    call_id, current.id
                );
                Ok(false)
            }
            Some(_) => {
                self.delete_call(receiver_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Mark `call_id` rejected while it is still the live record at the
    /// receiver's key. Returns whether the rejection stuck.
    pub async fn reject_call(&self, receiver_id: &str, call_id: &CallId) -> Result<bool> {
        match self.fetch_call(receiver_id).await {
            Ok(Some(current)) if &current.id == call_id && current.status.is_live() => {}
            Ok(_) => {
                debug!("Call {} no longer pending, nothing to reject", call_id);
                return Ok(false);
            }
            Err(StoreError::Serialization(_)) => {
                self.clear_fragment(receiver_id).await?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        self.update_call(receiver_id, &CallUpdate::rejected()).await?;
        Ok(!self.clear_fragment(receiver_id).await?)
    }

    /// Remove the value at the receiver's key if it is not a whole record.
    ///
    /// A merge that lands after the record was deleted leaves such a fragment
    /// behind, and no watcher can decode it.
    pub async fn clear_fragment(&self, receiver_id: &str) -> Result<bool> {
        let path = call_path(receiver_id);
        let Some(value) = self.store.get(&path).await? else {
            return Ok(false);
        };
        if serde_json::from_value::<CallRecord>(value).is_ok() {
            return Ok(false);
        }
        info!("Removing partial call record at {}", path);
        self.store.remove(&path).await?;
        Ok(true)
    }

    pub async fn fetch_call(&self, receiver_id: &str) -> Result<Option<CallRecord>> {
        match self.store.get(&call_path(receiver_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn subscribe_call(&self, receiver_id: &str) -> Result<CallSubscription> {
        let path = call_path(receiver_id);
        let inner = self.store.subscribe(&path).await?;
        Ok(CallSubscription { inner, path })
    }

    /// Append a candidate to `side`'s partition of the call.
    pub async fn append_candidate(
        &self,
        call_id: &CallId,
        side: CallRole,
        candidate: &IceCandidate,
    ) -> Result<String> {
        let path = candidate_partition_path(call_id, side);
        self.store.push(&path, to_store_value(candidate)?).await
    }

    /// Watch `side`'s partition, entries already present included.
    pub async fn subscribe_candidates(
        &self,
        call_id: &CallId,
        side: CallRole,
    ) -> Result<CandidateSubscription> {
        let path = candidate_partition_path(call_id, side);
        let inner = self.store.subscribe_child_added(&path).await?;
        Ok(CandidateSubscription { inner, path })
    }

    /// Drop both partitions of the call.
    pub async fn remove_candidates(&self, call_id: &CallId) -> Result<()> {
        self.store.remove(&candidates_path(call_id)).await
    }
}

/// Decoded record notifications. Values that fail to decode are skipped.
pub struct CallSubscription {
    inner: Subscription<Option<Value>>,
    path: String,
}

impl CallSubscription {
    pub async fn next(&mut self) -> Option<CallSnapshot> {
        loop {
            match self.inner.recv().await? {
                None => return Some(CallSnapshot::Absent),
                Some(value) => match serde_json::from_value::<CallRecord>(value) {
                    Ok(record) => return Some(CallSnapshot::Present(record)),
                    Err(e) => warn!("Skipping undecodable record at {}: {}", self.path, e),
                },
            }
        }
    }

    pub fn handle(&self) -> Unsubscribe {
        self.inner.handle()
    }
}

/// Decoded candidate notifications. Entries that fail to decode are skipped.
pub struct CandidateSubscription {
    inner: Subscription<ChildAdded>,
    path: String,
}

impl CandidateSubscription {
    pub async fn next(&mut self) -> Option<IceCandidate> {
        loop {
            let ChildAdded { key, value } = self.inner.recv().await?;
            match serde_json::from_value::<IceCandidate>(value) {
                Ok(candidate) => return Some(candidate),
                Err(e) => warn!("Skipping undecodable candidate {}/{}: {}", self.path, key, e),
            }
        }
    }

    pub fn handle(&self) -> Unsubscribe {
        self.inner.handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use signalbox_core::{CallStatus, CallType, CallerProfile, SessionDescription};

    fn channel() -> (Arc<InMemoryStore>, SignalingChannel) {
        let store = Arc::new(InMemoryStore::new());
        let channel = SignalingChannel::new(store.clone());
        (store, channel)
    }

    fn record(id: &str) -> CallRecord {
        CallRecord::ringing(
            CallId::new(id),
            &CallerProfile::new("alice", "Alice"),
            "bob",
            CallType::Audio,
        )
        .with_offer(SessionDescription::offer("v=0"))
    }

    #[tokio::test]
    async fn test_publish_fetch_update_delete() {
        let (_store, channel) = channel();
        channel.publish_call(&record("c1")).await.unwrap();

        let fetched = channel.fetch_call("bob").await.unwrap().unwrap();
        assert_eq!(fetched.status, CallStatus::Ringing);
        assert!(fetched.answer.is_none());

        channel
            .update_call("bob", &CallUpdate::accepted(SessionDescription::answer("v=0 a")))
            .await
            .unwrap();
        let fetched = channel.fetch_call("bob").await.unwrap().unwrap();
        assert_eq!(fetched.status, CallStatus::Accepted);
        assert_eq!(fetched.offer, Some(SessionDescription::offer("v=0")));
        assert!(fetched.answer.is_some());

        channel.delete_call("bob").await.unwrap();
        assert!(channel.fetch_call("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_update_is_not_written() {
        let (store, channel) = channel();
        channel.update_call("bob", &CallUpdate::default()).await.unwrap();
        assert!(store.journal().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_if_current_spares_newer_call() {
        let (_store, channel) = channel();
        channel.publish_call(&record("c2")).await.unwrap();

        let deleted = channel
            .delete_call_if_current("bob", &CallId::new("c1"))
            .await
            .unwrap();
        assert!(!deleted);
        assert!(channel.fetch_call("bob").await.unwrap().is_some());

        let deleted = channel
            .delete_call_if_current("bob", &CallId::new("c2"))
            .await
            .unwrap();
        assert!(deleted);
        assert!(channel.fetch_call("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reject_only_touches_the_live_record() {
        let (store, channel) = channel();
        assert!(!channel.reject_call("bob", &CallId::new("c1")).await.unwrap());
        assert!(store.journal().await.is_empty());

        channel.publish_call(&record("c2")).await.unwrap();
        assert!(!channel.reject_call("bob", &CallId::new("c1")).await.unwrap());
        assert!(channel.reject_call("bob", &CallId::new("c2")).await.unwrap());
        let fetched = channel.fetch_call("bob").await.unwrap().unwrap();
        assert_eq!(fetched.status, CallStatus::Rejected);

        // Already terminal, nothing more to write.
        let writes = store.journal().await.len();
        assert!(!channel.reject_call("bob", &CallId::new("c2")).await.unwrap());
        assert_eq!(store.journal().await.len(), writes);
    }

    #[tokio::test]
    async fn test_clear_fragment_keeps_whole_records() {
        let (store, channel) = channel();
        channel.publish_call(&record("c1")).await.unwrap();
        assert!(!channel.clear_fragment("bob").await.unwrap());
        assert!(channel.fetch_call("bob").await.unwrap().is_some());

        channel.delete_call("bob").await.unwrap();
        channel
            .update_call("bob", &CallUpdate::rejected())
            .await
            .unwrap();
        assert_eq!(
            store.get("calls/bob").await.unwrap(),
            Some(json!({ "status": "rejected" }))
        );
        assert!(channel.clear_fragment("bob").await.unwrap());
        assert_eq!(store.get("calls/bob").await.unwrap(), None);
        assert!(!channel.reject_call("bob", &CallId::new("c1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_subscription_skips_undecodable_records() {
        let (store, channel) = channel();
        let mut sub = channel.subscribe_call("bob").await.unwrap();
        assert_eq!(sub.next().await, Some(CallSnapshot::Absent));

        store.set("calls/bob", json!({ "garbage": true })).await.unwrap();
        channel.publish_call(&record("c1")).await.unwrap();

        match sub.next().await {
            Some(CallSnapshot::Present(r)) => assert_eq!(r.id, CallId::new("c1")),
            other => panic!("unexpected snapshot: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_candidates_are_partitioned_by_side() {
        let (_store, channel) = channel();
        let call_id = CallId::new("c1");
        let host = IceCandidate::new("candidate:1 1 UDP 1 10.0.0.1 5000 typ host");
        let relay = IceCandidate::new("candidate:2 1 UDP 1 10.0.0.2 5001 typ relay");

        channel
            .append_candidate(&call_id, CallRole::Caller, &host)
            .await
            .unwrap();
        channel
            .append_candidate(&call_id, CallRole::Receiver, &relay)
            .await
            .unwrap();

        let mut from_caller = channel
            .subscribe_candidates(&call_id, CallRole::Caller)
            .await
            .unwrap();
        assert_eq!(from_caller.next().await, Some(host));

        let mut from_receiver = channel
            .subscribe_candidates(&call_id, CallRole::Receiver)
            .await
            .unwrap();
        assert_eq!(from_receiver.next().await, Some(relay));

        channel.remove_candidates(&call_id).await.unwrap();
        let mut again = channel
            .subscribe_candidates(&call_id, CallRole::Caller)
            .await
            .unwrap();
        assert!(again.inner.try_recv().is_none());
    }
}
