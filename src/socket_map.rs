use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::{Result, SessionError};
use crate::frame::SocketId;
use crate::socket::SocketContext;
use crate::timeouts::{TimeoutConfig, Timeouts};

/// One-shot signaling primitive: created alive, transitions to terminated
/// exactly once; any number of observers may await the transition.
#[derive(Clone)]
pub struct Lifetime(Arc<LifetimeInner>);

struct LifetimeInner {
    notify: tokio::sync::Notify,
    terminated: std::sync::atomic::AtomicBool,
}

impl Lifetime {
    fn new() -> Self {
        Self(Arc::new(LifetimeInner {
            notify: tokio::sync::Notify::new(),
            terminated: std::sync::atomic::AtomicBool::new(false),
        }))
    }

    /// Transitions this lifetime to terminated, waking every observer.
    /// Idempotent.
    pub fn terminate(&self) {
        use std::sync::atomic::Ordering;
        if !self.0.terminated.swap(true, Ordering::AcqRel) {
            self.0.notify.notify_waiters();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.0.terminated.load(std::sync::atomic::Ordering::Acquire)
    }

    fn same(&self, other: &Lifetime) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Completes when this lifetime is terminated, or when `cancel` fires,
    /// whichever happens first.
    pub async fn wait_while_alive(&self, cancel: &CancellationToken) {
        // `notified()` must be created before the terminated check to avoid
        // missing a concurrent `terminate()` between the check and the await.
        let notified = self.0.notify.notified();
        tokio::pin!(notified);
        if self.is_terminated() {
            return;
        }
        tokio::select! {
            _ = &mut notified => {}
            _ = cancel.cancelled() => {}
        }
    }
}

struct Inner {
    sockets: HashMap<SocketId, Arc<SocketContext>>,
    outstanding: Option<Lifetime>,
}

type Shared = Arc<Mutex<Inner>>;

/// Immutable `{id -> SocketContext}` view paired with a `Lifetime` handle.
/// Dropping a snapshot (or calling `detach`) releases the
/// map's outstanding-snapshot slot if this is still the recorded snapshot.
pub struct SocketSnapshot {
    sockets: HashMap<SocketId, Arc<SocketContext>>,
    lifetime: Lifetime,
    shared: Shared,
}

impl SocketSnapshot {
    pub fn sockets(&self) -> &HashMap<SocketId, Arc<SocketContext>> {
        &self.sockets
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    /// Cooperative release, equivalent to dropping the snapshot.
    pub fn detach(self) {
        drop(self)
    }
}

impl Drop for SocketSnapshot {
    fn drop(&mut self) {
        let mut inner = self.shared.lock().unwrap();
        if inner
            .outstanding
            .as_ref()
            .is_some_and(|current| current.same(&self.lifetime))
        {
            inner.outstanding = None;
        }
    }
}

/// Authoritative `id -> SocketContext` mapping for the listener side.
///
/// Entries are added by the accept loop and removed on error or explicit
/// close. All public operations are serialized by a single mutex; a
/// mutation while a snapshot is outstanding terminates that snapshot.
pub struct ListenerSocketMap {
    shared: Shared,
}

impl ListenerSocketMap {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Inner {
                sockets: HashMap::new(),
                outstanding: None,
            })),
        }
    }

    fn invalidate_locked(inner: &mut Inner) {
        if let Some(lifetime) = inner.outstanding.take() {
            lifetime.terminate();
        }
    }

    pub fn get(&self, id: SocketId, required: bool) -> Result<Option<Arc<SocketContext>>> {
        let inner = self.shared.lock().unwrap();
        match inner.sockets.get(&id).cloned() {
            found @ Some(_) => Ok(found),
            None if required => Err(SessionError::NoSuchSocket(id)),
            None => Ok(None),
        }
    }

    pub fn add(&self, ctx: Arc<SocketContext>) -> Result<()> {
        let mut inner = self.shared.lock().unwrap();
        if inner.sockets.contains_key(&ctx.id()) {
            return Err(SessionError::DuplicateSocket(ctx.id()));
        }
        inner.sockets.insert(ctx.id(), ctx);
        Self::invalidate_locked(&mut inner);
        Ok(())
    }

    pub fn remove(&self, id: SocketId) {
        let mut inner = self.shared.lock().unwrap();
        if inner.sockets.remove(&id).is_some() {
            Self::invalidate_locked(&mut inner);
        }
    }

    pub fn snapshot(&self) -> Result<SocketSnapshot> {
        let mut inner = self.shared.lock().unwrap();
        if inner.outstanding.is_some() {
            return Err(SessionError::ConcurrentSnapshot);
        }
        let lifetime = Lifetime::new();
        inner.outstanding = Some(lifetime.clone());
        Ok(SocketSnapshot {
            sockets: inner.sockets.clone(),
            lifetime,
            shared: self.shared.clone(),
        })
    }

    pub fn reset(&self) {
        let mut inner = self.shared.lock().unwrap();
        inner.sockets.clear();
        Self::invalidate_locked(&mut inner);
    }

    pub fn len(&self) -> usize {
        self.shared.lock().unwrap().sockets.len()
    }
}

impl Default for ListenerSocketMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared interface between the listener and auto-connect `SocketMap`
/// variants, used by the Multiplexer so it need not know which side it
/// is running on.
#[async_trait::async_trait]
pub trait SocketMap: Send + Sync {
    async fn get_socket(
        &self,
        id: SocketId,
        cancel: Option<&CancellationToken>,
    ) -> Result<Arc<SocketContext>>;

    fn remove_socket(&self, id: SocketId);

    fn snapshot(&self) -> Result<SocketSnapshot>;

    fn reset(&self);
}

#[async_trait::async_trait]
impl SocketMap for ListenerSocketMap {
    async fn get_socket(
        &self,
        id: SocketId,
        _cancel: Option<&CancellationToken>,
    ) -> Result<Arc<SocketContext>> {
        self.get(id, true)?.ok_or(SessionError::NoSuchSocket(id))
    }

    fn remove_socket(&self, id: SocketId) {
        self.remove(id)
    }

    fn snapshot(&self) -> Result<SocketSnapshot> {
        ListenerSocketMap::snapshot(self)
    }

    fn reset(&self) {
        ListenerSocketMap::reset(self)
    }
}

/// Wraps a `ListenerSocketMap`, configured with a fixed target endpoint.
/// `get_socket` returns an existing entry or lazily connects
/// and inserts a fresh one; the lookup-then-insert pair is not atomic, so a
/// losing racer's fresh socket is discarded and the lookup retried
/// (discard-on-race).
pub struct AutoConnectSocketMap {
    inner: ListenerSocketMap,
    target: SocketAddr,
    timeout_config: TimeoutConfig,
    parent_cancel: CancellationToken,
}

impl AutoConnectSocketMap {
    pub fn new(
        target: SocketAddr,
        timeout_config: TimeoutConfig,
        parent_cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: ListenerSocketMap::new(),
            target,
            timeout_config,
            parent_cancel,
        }
    }
}

#[async_trait::async_trait]
impl SocketMap for AutoConnectSocketMap {
    async fn get_socket(
        &self,
        id: SocketId,
        cancel: Option<&CancellationToken>,
    ) -> Result<Arc<SocketContext>> {
        loop {
            if let Some(ctx) = self.inner.get(id, false)? {
                return Ok(ctx);
            }
            let timeouts = Timeouts::new(&self.parent_cancel, self.timeout_config);
            let ctx = Arc::new(SocketContext::pending(id, self.target, timeouts));
            ctx.ensure_connected(cancel).await?;
            match self.inner.add(ctx.clone()) {
                Ok(()) => return Ok(ctx),
                Err(SessionError::DuplicateSocket(_)) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn remove_socket(&self, id: SocketId) {
        self.inner.remove(id)
    }

    fn snapshot(&self) -> Result<SocketSnapshot> {
        self.inner.snapshot()
    }

    fn reset(&self) {
        self.inner.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeouts::TimeoutConfig;
    use tokio_util::sync::CancellationToken;

    fn make_ctx(id: u64) -> Arc<SocketContext> {
        let parent = CancellationToken::new();
        let timeouts = Timeouts::new(&parent, TimeoutConfig::default());
        Arc::new(SocketContext::pending(
            SocketId(id),
            "127.0.0.1:1".parse().unwrap(),
            timeouts,
        ))
    }

    #[test]
    fn add_duplicate_fails() {
        let map = ListenerSocketMap::new();
        map.add(make_ctx(1)).unwrap();
        let err = map.add(make_ctx(1)).unwrap_err();
        assert!(matches!(err, SessionError::DuplicateSocket(_)));
    }

    #[test]
    fn get_missing_required_fails() {
        let map = ListenerSocketMap::new();
        let err = map.get(SocketId(9), true).unwrap_err();
        assert!(matches!(err, SessionError::NoSuchSocket(_)));
        assert!(map.get(SocketId(9), false).unwrap().is_none());
    }

    #[test]
    fn concurrent_snapshot_rejected() {
        let map = ListenerSocketMap::new();
        let first = map.snapshot().unwrap();
        let err = map.snapshot().unwrap_err();
        assert!(matches!(err, SessionError::ConcurrentSnapshot));
        drop(first);
        assert!(map.snapshot().is_ok());
    }

    #[tokio::test]
    async fn mutation_invalidates_outstanding_snapshot() {
        let map = ListenerSocketMap::new();
        let snapshot = map.snapshot().unwrap();
        assert!(!snapshot.lifetime().is_terminated());
        map.add(make_ctx(1)).unwrap();
        assert!(snapshot.lifetime().is_terminated());
    }

    #[tokio::test]
    async fn detach_clears_slot_only_if_still_current() {
        let map = ListenerSocketMap::new();
        let snapshot = map.snapshot().unwrap();
        snapshot.detach();
        // slot cleared, a new snapshot should now succeed
        assert!(map.snapshot().is_ok());
    }

    #[tokio::test]
    async fn wait_while_alive_completes_after_terminate() {
        let map = ListenerSocketMap::new();
        let snapshot = map.snapshot().unwrap();
        let lifetime = snapshot.lifetime().clone();
        let cancel = CancellationToken::new();
        let waiter = tokio::spawn(async move {
            lifetime.wait_while_alive(&cancel).await;
        });
        map.add(make_ctx(1)).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wait_while_alive should complete after termination")
            .unwrap();
    }
}
