use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::pending::Pending;
use crate::cache::{ListSnapshot, QueryCache, QueryKey};
use crate::models::Entity;
use crate::patch::{FieldUpdates, Intent, PatchEngine};

/// Prefix of client-side placeholder identifiers.
/// Server-issued identifiers never start with it.
pub const PLACEHOLDER_PREFIX: &str = "optimistic-";

static PLACEHOLDER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a placeholder id, unique for the life of the process
fn next_placeholder_id() -> String {
    format!(
        "{}{}",
        PLACEHOLDER_PREFIX,
        PLACEHOLDER_COUNTER.fetch_add(1, Ordering::SeqCst) + 1
    )
}

pub fn is_placeholder_id(id: &str) -> bool {
    id.starts_with(PLACEHOLDER_PREFIX)
}

/// A write against one list query.
#[derive(Debug, Clone)]
pub enum Mutation<E: Entity> {
    Create(E::Draft),
    Update(E),
    Patch { id: String, updates: FieldUpdates },
    Delete { id: String },
}

impl<E: Entity> Mutation<E> {
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::Create(_) => MutationKind::Create,
            Mutation::Update(_) => MutationKind::Update,
            Mutation::Patch { .. } => MutationKind::Patch,
            Mutation::Delete { .. } => MutationKind::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Patch,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Create => write!(f, "create"),
            MutationKind::Update => write!(f, "update"),
            MutationKind::Patch => write!(f, "patch"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

/// Server-confirmed outcome of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled<E> {
    Saved(E),
    Deleted { id: String },
}

impl<E> Settled<E> {
    pub fn into_entity(self) -> Option<E> {
        match self {
            Settled::Saved(entity) => Some(entity),
            Settled::Deleted { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStatus {
    Applied,
    Reconciled,
    RolledBack,
}

/// Bookkeeping for one in-flight mutation.
#[derive(Debug, Clone)]
pub struct PendingPatch<E> {
    pub query: QueryKey,
    pub kind: MutationKind,
    /// Entity the mutation targets (the placeholder id for creates)
    pub target_id: String,
    pub forward: Intent<E>,
    pub inverse: Intent<E>,
    pub status: PatchStatus,
    pub started_at: DateTime<Utc>,
}

struct Registry<E> {
    next_id: u64,
    patches: BTreeMap<u64, PendingPatch<E>>,
    /// Open `populate` calls per key
    refreshing: HashMap<QueryKey, usize>,
    settle_seq: u64,
    /// Confirmed outcomes of patches that settled while a refresh of their
    /// key was open, as `(settle_seq, query, intent)`
    settled: Vec<(u64, QueryKey, Intent<E>)>,
}

/// Keeps a refresh of one key open from fetch start until the fetched list
/// is written.
struct RefreshWindow<'a, E> {
    coordinator: &'a MutationCoordinator<E>,
    key: QueryKey,
    since: u64,
}

impl<E: Entity> RefreshWindow<'_, E> {
    /// Intents to replay on the fetched list: outcomes confirmed since the
    /// fetch started, then every patch still in flight.
    fn replay(&self) -> Vec<Intent<E>> {
        let registry = self.coordinator.registry();
        registry
            .settled
            .iter()
            .filter(|(seq, query, _)| *seq > self.since && *query == self.key)
            .map(|(_, _, intent)| intent.clone())
            .chain(
                registry
                    .patches
                    .values()
                    .filter(|patch| patch.query == self.key)
                    .map(|patch| patch.forward.clone()),
            )
            .collect()
    }
}

impl<E> Drop for RefreshWindow<'_, E> {
    fn drop(&mut self) {
        let mut registry = self.coordinator.registry();
        let open = match registry.refreshing.get_mut(&self.key) {
            Some(open) => {
                *open = open.saturating_sub(1);
                *open
            }
            None => 0,
        };
        if open == 0 {
            registry.refreshing.remove(&self.key);
            let key = &self.key;
            registry.settled.retain(|(_, query, _)| query != key);
        }
    }
}

/// Runs create/update/patch/delete calls with optimistic cache writes.
///
/// The optimistic patch is written when `perform` is called. When the remote
/// call settles, the coordinator either reconciles the cached list with the
/// server's entity or applies the inverse patch. Both steps run against the
/// list as it is at that moment, addressed by identifier, so concurrent
/// mutations compose in any settle order.
pub struct MutationCoordinator<E> {
    cache: QueryCache,
    engine: PatchEngine<E>,
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E> Clone for MutationCoordinator<E> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            engine: self.engine,
            registry: self.registry.clone(),
        }
    }
}

impl<E> MutationCoordinator<E> {
    fn registry(&self) -> MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: Entity> MutationCoordinator<E> {
    pub fn new(cache: QueryCache) -> Self {
        Self::with_engine(cache, PatchEngine::new())
    }

    pub fn with_engine(cache: QueryCache, engine: PatchEngine<E>) -> Self {
        Self {
            cache,
            engine,
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                patches: BTreeMap::new(),
                refreshing: HashMap::new(),
                settle_seq: 0,
                settled: Vec::new(),
            })),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Number of mutations applied optimistically and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.registry().patches.len()
    }

    /// In-flight patches on `key`, oldest first.
    pub fn pending_patches(&self, key: &QueryKey) -> Vec<PendingPatch<E>> {
        self.registry()
            .patches
            .values()
            .filter(|patch| &patch.query == key)
            .cloned()
            .collect()
    }

    /// Apply `mutation` optimistically to `key`, then run `remote` with it.
    ///
    /// The cache reflects the change as soon as this returns. The remote call
    /// runs in a spawned task, so it completes (and the cache is reconciled
    /// or rolled back) even if the returned handle is dropped. The handle
    /// resolves to `None` if the remote call failed; the failure is logged,
    /// never raised.
    ///
    /// Must be called from within a tokio runtime.
    pub fn perform<F, Fut>(
        &self,
        key: &QueryKey,
        mutation: Mutation<E>,
        remote: F,
    ) -> Pending<Option<Settled<E>>>
    where
        F: FnOnce(Mutation<E>) -> Fut,
        Fut: Future<Output = Result<Option<E>>> + Send + 'static,
    {
        let kind = mutation.kind();
        let (forward, target_id, placeholder_id) = match &mutation {
            Mutation::Create(draft) => {
                let id = next_placeholder_id();
                let entity = E::from_draft(id.clone(), draft);
                (Intent::insert(entity), id.clone(), Some(id))
            }
            Mutation::Update(entity) => (
                Intent::replace(entity.id(), entity.clone()),
                entity.id().to_string(),
                None,
            ),
            Mutation::Patch { id, updates } => {
                (Intent::patch_fields(id.clone(), updates.clone()), id.clone(), None)
            }
            Mutation::Delete { id } => (Intent::remove(id.clone()), id.clone(), None),
        };
        let optimistic = match &mutation {
            Mutation::Update(entity) => Some(entity.clone()),
            _ => None,
        };

        let inverse = self.apply(key, forward.clone()).unwrap_or(Intent::Noop);
        let patch_id = self.track(PendingPatch {
            query: key.clone(),
            kind,
            target_id: target_id.clone(),
            forward,
            inverse,
            status: PatchStatus::Applied,
            started_at: Utc::now(),
        });

        let call = remote(mutation);
        let this = self.clone();
        let key = key.clone();
        let task = tokio::spawn(async move {
            let result = call.await;
            this.settle(patch_id, &key, kind, &target_id, optimistic, result)
        });

        Pending::new(placeholder_id, async move {
            match task.await {
                Ok(settled) => settled,
                Err(e) => {
                    error!(error = %e, "mutation task failed");
                    None
                }
            }
        })
    }

    /// Load a list with `fetch` and write it sorted.
    ///
    /// Patches still in flight on `key` are re-applied on top of the fetched
    /// list so their optimistic state survives the refresh. So are the
    /// confirmed outcomes of patches that settled while the fetch was
    /// running, since the fetched list may predate them. On failure the
    /// current snapshot is kept.
    pub async fn populate<F, Fut>(&self, key: &QueryKey, fetch: F) -> Result<ListSnapshot<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<E>>>,
    {
        let window = self.open_refresh(key);
        let mut entities = match fetch().await {
            Ok(entities) => entities,
            Err(e) => {
                warn!(query = %key, error = %format!("{:#}", e), "list fetch failed, keeping cached snapshot");
                return Err(e);
            }
        };
        self.engine.sort(&mut entities);

        let fetched = entities.len();
        let engine = self.engine;
        let mut rebased = 0;
        // Replay is collected under the store lock so a settle cannot slip
        // between reading the registry and writing the list.
        let snapshot = self.cache.set_with(key, || {
            for intent in window.replay() {
                let patched = engine.apply(&entities, intent);
                if patched.changed() {
                    rebased += 1;
                }
                entities = patched.forward;
            }
            entities
        });
        drop(window);

        info!(query = %key, fetched, rebased, "list loaded");
        Ok(snapshot)
    }

    fn open_refresh(&self, key: &QueryKey) -> RefreshWindow<'_, E> {
        let mut registry = self.registry();
        *registry.refreshing.entry(key.clone()).or_default() += 1;
        RefreshWindow {
            coordinator: self,
            key: key.clone(),
            since: registry.settle_seq,
        }
    }

    /// Apply `intent` to the current snapshot of `key`.
    /// Returns the inverse, or `None` if the key has no snapshot.
    fn apply(&self, key: &QueryKey, intent: Intent<E>) -> Option<Intent<E>> {
        if intent.is_noop() {
            return Some(Intent::Noop);
        }
        let engine = self.engine;
        let operation = intent.name();
        let inverse = self.cache.update(key, move |current: &[E]| {
            let patched = engine.apply(current, intent);
            if patched.changed() {
                (Some(patched.forward), patched.inverse)
            } else {
                (None, Intent::Noop)
            }
        });
        if inverse.is_none() {
            debug!(query = %key, operation, "query not loaded, nothing to patch");
        }
        inverse
    }

    fn track(&self, patch: PendingPatch<E>) -> u64 {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = registry.next_id;
        debug!(
            query = %patch.query,
            kind = %patch.kind,
            id = %patch.target_id,
            forward = patch.forward.name(),
            "optimistic patch applied"
        );
        registry.patches.insert(id, patch);
        id
    }

    /// Remove a patch from the registry, marking its terminal status.
    ///
    /// A reconciled patch whose key is being refreshed leaves its confirmed
    /// outcome (`confirmed`, or the forward intent if the server sent no
    /// entity) for that refresh to replay.
    fn finish(
        &self,
        patch_id: u64,
        status: PatchStatus,
        confirmed: Option<&E>,
    ) -> Option<PendingPatch<E>> {
        let mut registry = self.registry();
        let mut patch = registry.patches.remove(&patch_id)?;
        patch.status = status;
        registry.settle_seq += 1;
        let refreshing = registry.refreshing.get(&patch.query).is_some_and(|open| *open > 0);
        if status == PatchStatus::Reconciled && refreshing {
            let outcome = match (patch.kind, confirmed) {
                (MutationKind::Create, Some(server)) => Intent::insert(server.clone()),
                (_, Some(server)) => Intent::replace(server.id(), server.clone()),
                (_, None) => patch.forward.clone(),
            };
            let seq = registry.settle_seq;
            registry.settled.push((seq, patch.query.clone(), outcome));
        }
        drop(registry);
        debug!(
            query = %patch.query,
            kind = %patch.kind,
            id = %patch.target_id,
            status = ?patch.status,
            elapsed_ms = (Utc::now() - patch.started_at).num_milliseconds(),
            "patch settled"
        );
        Some(patch)
    }

    fn settle(
        &self,
        patch_id: u64,
        key: &QueryKey,
        kind: MutationKind,
        target_id: &str,
        optimistic: Option<E>,
        result: Result<Option<E>>,
    ) -> Option<Settled<E>> {
        let confirmed = match (kind, result) {
            (_, Err(e)) => Err(e),
            (MutationKind::Create, Ok(None)) => {
                Err(anyhow!("create succeeded without returning an entity"))
            }
            (_, Ok(confirmed)) => Ok(confirmed),
        };

        let confirmed = match confirmed {
            Ok(confirmed) => confirmed,
            Err(e) => {
                self.rollback(patch_id, key);
                warn!(
                    query = %key,
                    kind = %kind,
                    id = target_id,
                    error = %format!("{:#}", e),
                    "remote call failed, optimistic patch rolled back"
                );
                return None;
            }
        };

        self.finish(patch_id, PatchStatus::Reconciled, confirmed.as_ref());
        match kind {
            MutationKind::Create => {
                let server = confirmed?;
                self.apply(key, Intent::replace(target_id, server.clone()));
                Some(Settled::Saved(server))
            }
            MutationKind::Update | MutationKind::Patch => match confirmed {
                Some(server) => {
                    if optimistic.as_ref() != Some(&server) {
                        // Server filled in or normalized fields
                        self.apply(key, Intent::replace(server.id().to_string(), server.clone()));
                    }
                    Some(Settled::Saved(server))
                }
                None => optimistic
                    .or_else(|| self.find(key, target_id))
                    .map(Settled::Saved),
            },
            MutationKind::Delete => Some(Settled::Deleted {
                id: target_id.to_string(),
            }),
        }
    }

    fn rollback(&self, patch_id: u64, key: &QueryKey) {
        if let Some(patch) = self.finish(patch_id, PatchStatus::RolledBack, None) {
            self.apply(key, patch.inverse);
        }
    }

    fn find(&self, key: &QueryKey, id: &str) -> Option<E> {
        self.cache
            .get::<E>(key)?
            .iter()
            .find(|e| e.id() == id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewState, State};
    use futures::channel::oneshot;
    use futures::future::{BoxFuture, FutureExt};
    use serde_json::json;

    type Reply = Result<Option<State>>;

    fn key() -> QueryKey {
        QueryKey::list(State::KIND)
    }

    fn state(id: &str, name: &str) -> State {
        State {
            id: id.to_string(),
            name: name.to_string(),
            code: None,
        }
    }

    fn original() -> Vec<State> {
        vec![state("1", "Arizona"), state("2", "Texas")]
    }

    fn seeded() -> (QueryCache, MutationCoordinator<State>) {
        let cache = QueryCache::new();
        cache.set(&key(), original());
        let coordinator = MutationCoordinator::new(cache.clone());
        (cache, coordinator)
    }

    fn snapshot(cache: &QueryCache) -> Vec<State> {
        cache
            .get::<State>(&key())
            .map(|s| s.as_ref().clone())
            .unwrap_or_default()
    }

    fn names(cache: &QueryCache) -> Vec<String> {
        snapshot(cache).into_iter().map(|s| s.name).collect()
    }

    /// Remote call that settles when the test sends on the returned channel
    fn gated() -> (
        oneshot::Sender<Reply>,
        impl FnOnce(Mutation<State>) -> BoxFuture<'static, Reply>,
    ) {
        let (tx, rx) = oneshot::channel::<Reply>();
        let remote = move |_: Mutation<State>| {
            async move {
                rx.await
                    .unwrap_or_else(|_| Err(anyhow!("test dropped the reply channel")))
            }
            .boxed()
        };
        (tx, remote)
    }

    /// Wait until a spawned `populate` has started its fetch
    async fn refresh_opened(coordinator: &MutationCoordinator<State>) {
        for _ in 0..100 {
            if coordinator.registry().refreshing.contains_key(&key()) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("refresh never started");
    }

    fn rejected(_: Mutation<State>) -> BoxFuture<'static, Reply> {
        async { Err(anyhow!("HTTP 500")) }.boxed()
    }

    #[tokio::test]
    async fn test_create_is_visible_then_reconciled() {
        let (cache, coordinator) = seeded();
        let (reply, remote) = gated();

        let pending = coordinator.perform(&key(), Mutation::Create(NewState::named("California")), remote);
        let placeholder = pending.placeholder_id().expect("create has a placeholder").to_string();
        assert!(is_placeholder_id(&placeholder));

        let optimistic = snapshot(&cache);
        assert_eq!(names(&cache), ["Arizona", "California", "Texas"]);
        assert_eq!(optimistic[1].id, placeholder);
        assert_eq!(coordinator.in_flight(), 1);

        reply.send(Ok(Some(state("9", "California")))).expect("receiver alive");
        let settled = pending.await;

        assert_eq!(settled, Some(Settled::Saved(state("9", "California"))));
        let ids: Vec<String> = snapshot(&cache).into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["1", "9", "2"]);
        assert!(!ids.iter().any(|id| is_placeholder_id(id)));
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_rejected_delete_restores_original() {
        let (cache, coordinator) = seeded();

        let pending = coordinator.perform(&key(), Mutation::Delete { id: "2".to_string() }, rejected);
        assert_eq!(names(&cache), ["Arizona"]);

        assert_eq!(pending.await, None);
        assert_eq!(snapshot(&cache), original());
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_successful_delete_reports_id() {
        let (cache, coordinator) = seeded();
        let pending = coordinator.perform(&key(), Mutation::Delete { id: "1".to_string() }, |_| async {
            Ok(None)
        });

        assert_eq!(
            pending.await,
            Some(Settled::Deleted {
                id: "1".to_string()
            })
        );
        assert_eq!(names(&cache), ["Texas"]);
    }

    #[tokio::test]
    async fn test_update_applies_server_fields() {
        let (cache, coordinator) = seeded();
        let (reply, remote) = gated();

        let pending = coordinator.perform(&key(), Mutation::Update(state("2", "Lone Star")), remote);
        assert_eq!(names(&cache), ["Arizona", "Lone Star"]);

        let mut server = state("2", "Lone Star");
        server.code = Some("TX".to_string());
        reply.send(Ok(Some(server.clone()))).expect("receiver alive");

        assert_eq!(pending.await, Some(Settled::Saved(server.clone())));
        assert_eq!(snapshot(&cache)[1], server);
    }

    #[tokio::test]
    async fn test_update_without_response_body_keeps_payload() {
        let (cache, coordinator) = seeded();
        let pending = coordinator.perform(&key(), Mutation::Update(state("1", "Alaska")), |_| async {
            Ok(None)
        });
        assert_eq!(pending.await, Some(Settled::Saved(state("1", "Alaska"))));
        assert_eq!(names(&cache), ["Alaska", "Texas"]);
    }

    #[tokio::test]
    async fn test_rejected_update_rolls_back() {
        let (cache, coordinator) = seeded();
        let pending = coordinator.perform(&key(), Mutation::Update(state("1", "Zzz")), rejected);
        assert_eq!(names(&cache), ["Texas", "Zzz"]);

        assert_eq!(pending.await, None);
        assert_eq!(snapshot(&cache), original());
    }

    #[tokio::test]
    async fn test_patch_success_and_rollback() {
        let (cache, coordinator) = seeded();
        let updates = match json!({"code": "AZ"}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };

        let mut patched = state("1", "Arizona");
        patched.code = Some("AZ".to_string());
        let server = patched.clone();
        let pending = coordinator.perform(
            &key(),
            Mutation::Patch { id: "1".to_string(), updates },
            move |_| async move { Ok(Some(server)) },
        );
        assert_eq!(snapshot(&cache)[0], patched);
        assert_eq!(pending.await, Some(Settled::Saved(patched.clone())));

        let rename = match json!({"name": "Nope"}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let pending = coordinator.perform(&key(), Mutation::Patch { id: "1".to_string(), updates: rename }, rejected);
        assert_eq!(names(&cache), ["Nope", "Texas"]);
        assert_eq!(pending.await, None);
        assert_eq!(snapshot(&cache), vec![patched, state("2", "Texas")]);
    }

    #[tokio::test]
    async fn test_create_without_entity_is_rolled_back() {
        let (cache, coordinator) = seeded();
        let pending = coordinator.perform(&key(), Mutation::Create(NewState::named("Utah")), |_| async {
            Ok(None)
        });
        assert_eq!(pending.await, None);
        assert_eq!(snapshot(&cache), original());
    }

    #[tokio::test]
    async fn test_unloaded_query_is_not_patched() {
        let cache = QueryCache::new();
        let coordinator = MutationCoordinator::<State>::new(cache.clone());

        let pending = coordinator.perform(&key(), Mutation::Create(NewState::named("Utah")), |_| async {
            Ok(Some(state("5", "Utah")))
        });
        assert!(cache.get::<State>(&key()).is_none());
        assert_eq!(pending.await, Some(Settled::Saved(state("5", "Utah"))));
        assert!(cache.get::<State>(&key()).is_none());
    }

    async fn interleave(fail_first: bool) -> Vec<State> {
        let (cache, coordinator) = seeded();
        let (reply_a, remote_a) = gated();
        let (reply_b, remote_b) = gated();

        // A: create that will fail; B: delete that will succeed
        let a = coordinator.perform(&key(), Mutation::Create(NewState::named("Nevada")), remote_a);
        let b = coordinator.perform(&key(), Mutation::Delete { id: "1".to_string() }, remote_b);
        assert_eq!(names(&cache), ["Nevada", "Texas"]);

        if fail_first {
            reply_a.send(Err(anyhow!("validation failed"))).expect("receiver alive");
            assert_eq!(a.await, None);
            reply_b.send(Ok(None)).expect("receiver alive");
            assert!(b.await.is_some());
        } else {
            reply_b.send(Ok(None)).expect("receiver alive");
            assert!(b.await.is_some());
            reply_a.send(Err(anyhow!("validation failed"))).expect("receiver alive");
            assert_eq!(a.await, None);
        }
        snapshot(&cache)
    }

    #[tokio::test]
    async fn test_interleaving_independence() {
        let expected = vec![state("2", "Texas")];
        assert_eq!(interleave(true).await, expected);
        assert_eq!(interleave(false).await, expected);
    }

    #[tokio::test]
    async fn test_every_write_is_sorted() {
        let (cache, coordinator) = seeded();
        let unsorted = Arc::new(AtomicU64::new(0));
        let writes = Arc::new(AtomicU64::new(0));
        let _sub = {
            let unsorted = unsorted.clone();
            let writes = writes.clone();
            cache.subscribe(&key(), move |snapshot: ListSnapshot<State>| {
                writes.fetch_add(1, Ordering::SeqCst);
                let sorted = snapshot
                    .windows(2)
                    .all(|w| w[0].name.to_lowercase() <= w[1].name.to_lowercase());
                if !sorted {
                    unsorted.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let (reply, remote) = gated();
        let create = coordinator.perform(&key(), Mutation::Create(NewState::named("colorado")), remote);
        let update = coordinator.perform(&key(), Mutation::Update(state("2", "alabama")), |_| async {
            Ok(None)
        });
        let failing = coordinator.perform(&key(), Mutation::Create(NewState::named("Maine")), rejected);
        reply.send(Ok(Some(state("3", "Colorado")))).expect("receiver alive");

        create.await;
        update.await;
        failing.await;

        assert!(writes.load(Ordering::SeqCst) >= 5);
        assert_eq!(unsorted.load(Ordering::SeqCst), 0);
        assert_eq!(names(&cache), ["alabama", "Arizona", "Colorado"]);
    }

    #[tokio::test]
    async fn test_dropped_handle_still_settles() {
        let (cache, coordinator) = seeded();
        let (reply, remote) = gated();

        drop(coordinator.perform(&key(), Mutation::Delete { id: "2".to_string() }, remote));
        reply.send(Err(anyhow!("timeout"))).expect("receiver alive");

        for _ in 0..100 {
            if coordinator.in_flight() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.in_flight(), 0);
        assert_eq!(snapshot(&cache), original());
    }

    #[tokio::test]
    async fn test_populate_sorts_and_keeps_in_flight_patches() {
        let (cache, coordinator) = seeded();
        let (reply, remote) = gated();
        let create = coordinator.perform(&key(), Mutation::Create(NewState::named("Kansas")), remote);

        let loaded = coordinator
            .populate(&key(), || async {
                Ok(vec![state("2", "texas"), state("1", "Arizona"), state("4", "Idaho")])
            })
            .await
            .expect("fetch succeeds");
        let loaded_names: Vec<&str> = loaded.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(loaded_names, ["Arizona", "Idaho", "Kansas", "texas"]);
        assert_eq!(coordinator.pending_patches(&key()).len(), 1);

        reply.send(Ok(Some(state("8", "Kansas")))).expect("receiver alive");
        create.await;
        let ids: Vec<String> = snapshot(&cache).into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["1", "4", "8", "2"]);
    }

    #[tokio::test]
    async fn test_populate_keeps_create_confirmed_during_fetch() {
        let (cache, coordinator) = seeded();
        let (reply, remote) = gated();
        let create = coordinator.perform(&key(), Mutation::Create(NewState::named("California")), remote);

        let (fetched_tx, fetched_rx) = oneshot::channel::<Vec<State>>();
        let refresh = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .populate(&key(), || async move {
                        fetched_rx.await.map_err(|_| anyhow!("test dropped the fetch channel"))
                    })
                    .await
            })
        };
        refresh_opened(&coordinator).await;

        reply.send(Ok(Some(state("9", "California")))).expect("receiver alive");
        create.await;
        let ids: Vec<String> = snapshot(&cache).into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["1", "9", "2"]);

        // The list was read before the create reached the server
        fetched_tx.send(original()).expect("receiver alive");
        refresh.await.expect("task ran").expect("fetch succeeds");

        let ids: Vec<String> = snapshot(&cache).into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["1", "9", "2"]);
    }

    #[tokio::test]
    async fn test_populate_skips_delete_confirmed_during_fetch() {
        let (cache, coordinator) = seeded();
        let (fetched_tx, fetched_rx) = oneshot::channel::<Vec<State>>();
        let refresh = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .populate(&key(), || async move {
                        fetched_rx.await.map_err(|_| anyhow!("test dropped the fetch channel"))
                    })
                    .await
            })
        };
        refresh_opened(&coordinator).await;

        let delete = coordinator.perform(&key(), Mutation::Delete { id: "2".to_string() }, |_| async {
            Ok(None)
        });
        delete.await;

        fetched_tx.send(original()).expect("receiver alive");
        refresh.await.expect("task ran").expect("fetch succeeds");
        assert_eq!(names(&cache), ["Arizona"]);

        // Once the refresh has closed, its replay log is gone
        coordinator
            .populate(&key(), || async { Ok(original()) })
            .await
            .expect("fetch succeeds");
        assert_eq!(snapshot(&cache), original());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_rollbacks_leave_subscribers_current() {
        const DELETES: usize = 50;

        let cache = QueryCache::new();
        let rows: Vec<State> = (0..DELETES)
            .map(|i| state(&i.to_string(), &format!("State {:03}", i)))
            .collect();
        cache.set(&key(), rows);
        let coordinator = MutationCoordinator::<State>::new(cache.clone());

        let last_seen = Arc::new(AtomicU64::new(0));
        let _sub = {
            let last_seen = last_seen.clone();
            cache.subscribe(&key(), move |snapshot: ListSnapshot<State>| {
                last_seen.store(snapshot.len() as u64, Ordering::SeqCst);
            })
        };

        let pending: Vec<_> = (0..DELETES)
            .map(|i| coordinator.perform(&key(), Mutation::Delete { id: i.to_string() }, rejected))
            .collect();
        futures::future::join_all(pending).await;

        assert_eq!(snapshot(&cache).len(), DELETES);
        assert_eq!(last_seen.load(Ordering::SeqCst), DELETES as u64);
    }

    #[tokio::test]
    async fn test_populate_failure_keeps_snapshot() {
        let (cache, coordinator) = seeded();
        let result = coordinator
            .populate(&key(), || async { Err(anyhow!("connection refused")) })
            .await;
        assert!(result.is_err());
        assert_eq!(snapshot(&cache), original());
    }
}
