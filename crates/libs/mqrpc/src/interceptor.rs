//! Duplicate-call hooks consulted by the dispatcher before invoking a handler.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{CallMode, RpcName};

/// Identity of one inbound call as seen by an interceptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallContext {
    pub rpc_name: RpcName,
    pub mode: CallMode,
    pub command: String,
    /// Correlation id for SYNC calls, message id otherwise. `None` when the
    /// sender set neither.
    pub call_id: Option<String>,
}

/// Pluggable duplicate detection.
///
/// `is_duplicate_call` is asked for every call; `is_duplicate_content` only
/// for commands registered without `allow_duplicate`. Implementations are
/// shared by all consumer tasks of a server.
#[async_trait]
pub trait DuplicateInterceptor: Send + Sync {
    async fn is_duplicate_call(&self, ctx: &CallContext) -> bool;

    async fn is_duplicate_content(&self, ctx: &CallContext, data: &Value) -> bool;
}

/// Never reports a duplicate.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDuplicates;

#[async_trait]
impl DuplicateInterceptor for NoDuplicates {
    async fn is_duplicate_call(&self, _ctx: &CallContext) -> bool {
        false
    }

    async fn is_duplicate_content(&self, _ctx: &CallContext, _data: &Value) -> bool {
        false
    }
}

/// Keys in insertion order. Timestamps are taken under the owning mutex, so
/// `order` is also sorted by age and only its front ever expires or gets
/// evicted.
struct ExpiringSet {
    seen: HashSet<String>,
    order: VecDeque<(Instant, String)>,
    capacity: usize,
}

impl ExpiringSet {
    fn new(capacity: usize) -> Self {
        Self { seen: HashSet::new(), order: VecDeque::new(), capacity }
    }

    fn release(&mut self, ttl: Duration) {
        while let Some((at, _)) = self.order.front() {
            if at.elapsed() <= ttl {
                break;
            }
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.order.pop_front() {
            self.seen.remove(&key);
        }
    }

    /// Records `key`; returns `true` if it was already present.
    fn check_and_insert(&mut self, key: String, ttl: Duration) -> bool {
        self.release(ttl);
        if self.seen.contains(&key) {
            return true;
        }
        if self.seen.len() >= self.capacity {
            self.evict_oldest();
        }
        self.seen.insert(key.clone());
        self.order.push_back((Instant::now(), key));
        false
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// In-process interceptor remembering call ids and content fingerprints for
/// `ttl`. Suitable for a single server process; a fleet needs a shared store.
pub struct SeenCache {
    ttl: Duration,
    calls: Mutex<ExpiringSet>,
    contents: Mutex<ExpiringSet>,
}

impl SeenCache {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(ttl: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ttl,
            calls: Mutex::new(ExpiringSet::new(capacity)),
            contents: Mutex::new(ExpiringSet::new(capacity)),
        }
    }

    /// Hex SHA-256 over rpc name, command and the data object.
    ///
    /// `serde_json` objects keep keys sorted, so equal objects hash equally
    /// regardless of the field order on the wire.
    pub fn fingerprint(ctx: &CallContext, data: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(ctx.rpc_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(ctx.command.as_bytes());
        hasher.update([0u8]);
        hasher.update(data.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl DuplicateInterceptor for SeenCache {
    async fn is_duplicate_call(&self, ctx: &CallContext) -> bool {
        let Some(call_id) = ctx.call_id.as_ref() else {
            return false;
        };
        let key = format!("{}/{}/{call_id}", ctx.rpc_name, ctx.mode);
        self.calls.lock().expect("seen calls mutex poisoned").check_and_insert(key, self.ttl)
    }

    async fn is_duplicate_content(&self, ctx: &CallContext, data: &Value) -> bool {
        let key = Self::fingerprint(ctx, data);
        self.contents.lock().expect("seen contents mutex poisoned").check_and_insert(key, self.ttl)
    }
}
