use super::traits::{ChildAdded, RecordStore, Subscription, Unsubscribe};
use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use serde_json::{Map, Value};
use signalbox_core::store::paths::segments;
use signalbox_core::store::{Result, StoreError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};

/// Kind of a journaled write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Set,
    Update,
    Remove,
    Push,
}

/// One accepted write, in the order the store applied it.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub kind: WriteKind,
    pub path: String,
    pub value: Option<Value>,
}

/// An in-process record store implementing the full subscribe/push contract.
///
/// Values live in a single JSON tree. Every write is journaled and fanned out
/// to watchers while the tree lock is held, so each watcher sees changes in
/// the order they were applied. Writes containing `null` anywhere are refused,
/// like hosted stores refuse undefined members.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    tree: Mutex<Tree>,
    value_watchers: DashMap<u64, ValueWatcher>,
    child_watchers: DashMap<u64, ChildWatcher>,
    next_watcher: AtomicU64,
    next_push: AtomicU64,
    fail_writes: AtomicBool,
    fail_subscribes: AtomicBool,
}

struct Tree {
    root: Value,
    journal: Vec<WriteOp>,
}

struct ValueWatcher {
    path: Vec<String>,
    last: Option<Value>,
    tx: mpsc::UnboundedSender<Option<Value>>,
}

struct ChildWatcher {
    path: Vec<String>,
    seen: HashSet<String>,
    tx: mpsc::UnboundedSender<ChildAdded>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tree: Mutex::new(Tree {
                    root: Value::Object(Map::new()),
                    journal: Vec::new(),
                }),
                value_watchers: DashMap::new(),
                child_watchers: DashMap::new(),
                next_watcher: AtomicU64::new(0),
                next_push: AtomicU64::new(0),
                fail_writes: AtomicBool::new(false),
                fail_subscribes: AtomicBool::new(false),
            }),
        }
    }

    /// Make every following write fail with [`StoreError::Unavailable`].
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every following subscription fail with [`StoreError::Unavailable`].
    pub fn fail_subscribes(&self, fail: bool) {
        self.inner.fail_subscribes.store(fail, Ordering::SeqCst);
    }

    /// All accepted writes so far.
    pub async fn journal(&self) -> Vec<WriteOp> {
        self.inner.tree.lock().await.journal.clone()
    }

    /// Accepted writes whose path starts with `prefix`.
    pub async fn writes_under(&self, prefix: &str) -> Vec<WriteOp> {
        self.inner
            .tree
            .lock()
            .await
            .journal
            .iter()
            .filter(|op| op.path.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of live watchers, both kinds.
    pub fn watcher_count(&self) -> usize {
        self.inner.value_watchers.len() + self.inner.child_watchers.len()
    }

    fn check_writable(&self, path: &str, value: Option<&Value>) -> Result<Vec<String>> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("write to {path} refused")));
        }
        if value.is_some_and(contains_null) {
            return Err(StoreError::Serialization(format!(
                "explicit null in value written to {path}"
            )));
        }
        owned_segments(path)
    }

    fn check_subscribable(&self, path: &str) -> Result<Vec<String>> {
        if self.inner.fail_subscribes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("subscription to {path} refused")));
        }
        owned_segments(path)
    }

    fn next_push_key(&self) -> String {
        let n = self.inner.next_push.fetch_add(1, Ordering::SeqCst);
        format!("{:016x}{:04x}", n, rand::random::<u16>())
    }

    fn watcher_id(&self) -> u64 {
        self.inner.next_watcher.fetch_add(1, Ordering::SeqCst)
    }

    fn commit(&self, tree: &mut Tree, op: WriteOp) {
        debug!("store {:?} {}", op.kind, op.path);
        tree.journal.push(op);
        self.inner.notify(&tree.root);
    }
}

impl Inner {
    fn notify(&self, root: &Value) {
        self.value_watchers.retain(|_, watcher| {
            let current = get_at(root, &watcher.path).cloned();
            if current == watcher.last {
                return !watcher.tx.is_closed();
            }
            watcher.last.clone_from(&current);
            watcher.tx.send(current).is_ok()
        });

        self.child_watchers.retain(|_, watcher| {
            let Some(Value::Object(children)) = get_at(root, &watcher.path) else {
                return !watcher.tx.is_closed();
            };
            for (key, value) in children {
                if watcher.seen.insert(key.clone()) {
                    let added = ChildAdded {
                        key: key.clone(),
                        value: value.clone(),
                    };
                    if watcher.tx.send(added).is_err() {
                        return false;
                    }
                }
            }
            true
        });
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let segs = owned_segments(path)?;
        let tree = self.inner.tree.lock().await;
        Ok(get_at(&tree.root, &segs).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        let segs = self.check_writable(path, Some(&value))?;
        let mut tree = self.inner.tree.lock().await;
        set_at(&mut tree.root, &segs, value.clone());
        self.commit(
            &mut tree,
            WriteOp {
                kind: WriteKind::Set,
                path: path.to_string(),
                value: Some(value),
            },
        );
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<()> {
        let fields = Value::Object(fields);
        let segs = self.check_writable(path, Some(&fields))?;
        let mut targets = Vec::new();
        if let Value::Object(map) = &fields {
            for (key, value) in map {
                let mut target = segs.clone();
                target.extend(owned_segments(key)?);
                targets.push((target, value.clone()));
            }
        }
        let mut tree = self.inner.tree.lock().await;
        for (target, value) in targets {
            set_at(&mut tree.root, &target, value);
        }
        self.commit(
            &mut tree,
            WriteOp {
                kind: WriteKind::Update,
                path: path.to_string(),
                value: Some(fields),
            },
        );
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let segs = self.check_writable(path, None)?;
        let mut tree = self.inner.tree.lock().await;
        remove_at(&mut tree.root, &segs);
        self.commit(
            &mut tree,
            WriteOp {
                kind: WriteKind::Remove,
                path: path.to_string(),
                value: None,
            },
        );
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let mut segs = self.check_writable(path, Some(&value))?;
        let key = self.next_push_key();
        segs.push(key.clone());
        let mut tree = self.inner.tree.lock().await;
        set_at(&mut tree.root, &segs, value.clone());
        self.commit(
            &mut tree,
            WriteOp {
                kind: WriteKind::Push,
                path: format!("{}/{}", path.trim_end_matches('/'), key),
                value: Some(value),
            },
        );
        Ok(key)
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription<Option<Value>>> {
        let segs = self.check_subscribable(path)?;
        let id = self.watcher_id();
        let (tx, rx) = mpsc::unbounded_channel();

        // Registration and the initial delivery happen under the tree lock so
        // no write can fall between them.
        let tree = self.inner.tree.lock().await;
        let current = get_at(&tree.root, &segs).cloned();
        let _ = tx.send(current.clone());
        self.inner.value_watchers.insert(
            id,
            ValueWatcher {
                path: segs,
                last: current,
                tx,
            },
        );
        drop(tree);

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(
            rx,
            Unsubscribe::new(move || {
                if let Some(inner) = Weak::upgrade(&inner) {
                    inner.value_watchers.remove(&id);
                }
            }),
        ))
    }

    async fn subscribe_child_added(&self, path: &str) -> Result<Subscription<ChildAdded>> {
        let segs = self.check_subscribable(path)?;
        let id = self.watcher_id();
        let (tx, rx) = mpsc::unbounded_channel();

        let tree = self.inner.tree.lock().await;
        let mut seen = HashSet::new();
        if let Some(Value::Object(children)) = get_at(&tree.root, &segs) {
            for (key, value) in children {
                seen.insert(key.clone());
                let _ = tx.send(ChildAdded {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        self.inner.child_watchers.insert(
            id,
            ChildWatcher {
                path: segs,
                seen,
                tx,
            },
        );
        drop(tree);

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(
            rx,
            Unsubscribe::new(move || {
                if let Some(inner) = Weak::upgrade(&inner) {
                    inner.child_watchers.remove(&id);
                }
            }),
        ))
    }
}

fn owned_segments(path: &str) -> Result<Vec<String>> {
    Ok(segments(path)?.into_iter().map(str::to_string).collect())
}

fn contains_null(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.iter().any(contains_null),
        Value::Object(map) => map.values().any(contains_null),
        _ => false,
    }
}

fn get_at<'a>(root: &'a Value, segs: &[String]) -> Option<&'a Value> {
    segs.iter()
        .try_fold(root, |node, seg| node.as_object()?.get(seg.as_str()))
}

fn set_at(node: &mut Value, segs: &[String], value: Value) {
    if value.as_object().is_some_and(Map::is_empty) {
        remove_at(node, segs);
        return;
    }
    let Some((first, rest)) = segs.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        if rest.is_empty() {
            map.insert(first.clone(), value);
        } else {
            let child = map
                .entry(first.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            set_at(child, rest, value);
        }
    }
}

fn remove_at(node: &mut Value, segs: &[String]) {
    let Some((first, rest)) = segs.split_first() else {
        return;
    };
    let Value::Object(map) = node else {
        return;
    };
    if rest.is_empty() {
        map.remove(first.as_str());
        return;
    }
    if let Some(child) = map.get_mut(first.as_str()) {
        remove_at(child, rest);
        if child.as_object().is_some_and(Map::is_empty) {
            map.remove(first.as_str());
        }
    }
}
