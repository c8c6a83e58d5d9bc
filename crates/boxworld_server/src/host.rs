//! Single-process virtual-actor hosting.
//!
//! An [`ActorHost`] activates one instance per key on first use and runs
//! every operation on that key under the key's own async mutex, which is
//! what gives each actor single-threaded semantics. Instances idle for
//! longer than the configured timeout are dropped and rebuilt from storage
//! on their next call.

use crate::config::EngineConfig;
use crate::pubsub::PubSubHub;
use crate::stats::StatsAccumulator;
use crate::store::StateStore;
use crate::EngineError;
use async_trait::async_trait;
use boxworld_bits::{AddressedRng, AddressedRngFactory};
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedMappedMutexGuard, OwnedMutexGuard};
use tracing::{debug, info, instrument};

/// Collaborators every actor may use.
#[derive(Debug)]
pub struct Services {
    config: EngineConfig,
    store: Arc<dyn StateStore>,
    hub: Arc<PubSubHub>,
    rng: AddressedRngFactory,
    stats: Arc<StatsAccumulator>,
}

impl Services {
    /// Bundles the collaborators.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the RNG secret is unusable.
    #[instrument(skip_all)]
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        hub: Arc<PubSubHub>,
    ) -> Result<Self, EngineError> {
        let rng = AddressedRngFactory::from_hex(config.rng_secret())?;
        Ok(Self {
            config,
            store,
            hub,
            rng,
            stats: Arc::new(StatsAccumulator::default()),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Persistence collaborator.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Pub/sub collaborator.
    pub fn hub(&self) -> &Arc<PubSubHub> {
        &self.hub
    }

    /// Address-keyed RNG for `stream`.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the stream key cannot be derived.
    pub fn rng(&self, stream: &str) -> Result<AddressedRng, EngineError> {
        Ok(self.rng.derive(stream)?)
    }

    /// Local check/uncheck deltas.
    pub fn stats(&self) -> &Arc<StatsAccumulator> {
        &self.stats
    }
}

/// A stateful unit hosted by an [`ActorHost`].
#[async_trait]
pub trait Actor: Sized + Send + 'static {
    /// Address type.
    type Key: Clone + Eq + Hash + Display + Debug + Send + Sync + 'static;

    /// Kind name, used for state keys and logs.
    const KIND: &'static str;

    /// Builds the instance for `key`, usually by loading persisted state.
    async fn activate(key: &Self::Key, services: &Services) -> Result<Self, EngineError>;
}

/// Exclusive access to one activated actor.
pub type ActorGuard<A> = OwnedMappedMutexGuard<Option<A>, A>;

struct Slot<A> {
    cell: Arc<tokio::sync::Mutex<Option<A>>>,
    touched: Instant,
}

/// Hosts every activation of one actor kind.
pub struct ActorHost<A: Actor> {
    services: Arc<Services>,
    slots: Mutex<HashMap<A::Key, Slot<A>>>,
}

impl<A: Actor> Debug for ActorHost<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHost")
            .field("kind", &A::KIND)
            .field("active", &self.active_count())
            .finish()
    }
}

impl<A: Actor> ActorHost<A> {
    /// Creates an empty host.
    pub fn new(services: Arc<Services>) -> Self {
        debug!(kind = A::KIND, "Creating actor host");
        Self {
            services,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Locks the actor for `key`, activating it first if needed.
    ///
    /// Callers queue on the key; the returned guard is the only access to
    /// the instance until it is dropped.
    ///
    /// # Errors
    ///
    /// Returns the activation error if the actor could not be loaded.
    #[instrument(skip(self), fields(kind = A::KIND))]
    pub async fn get(&self, key: &A::Key) -> Result<ActorGuard<A>, EngineError> {
        let cell = {
            let mut slots = self.lock_slots();
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                cell: Arc::new(tokio::sync::Mutex::new(None)),
                touched: Instant::now(),
            });
            slot.touched = Instant::now();
            Arc::clone(&slot.cell)
        };

        let mut guard = cell.lock_owned().await;
        if guard.is_none() {
            let actor = A::activate(key, &self.services).await?;
            *guard = Some(actor);
            info!(%key, "Actor activated");
        }
        OwnedMutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| EngineError::dependency(format!("{} {} lost its activation", A::KIND, key)))
    }

    /// Number of keys with a live slot.
    pub fn active_count(&self) -> usize {
        self.lock_slots().len()
    }

    /// Drops activations untouched for at least `idle`.
    ///
    /// Busy actors are skipped. `get` refreshes the touch time under the
    /// same lock this takes, so a caller already queued on a key always
    /// keeps its slot.
    #[instrument(skip(self), fields(kind = A::KIND))]
    pub fn deactivate_idle(&self, idle: Duration) -> usize {
        let mut slots = self.lock_slots();
        let before = slots.len();
        slots.retain(|key, slot| {
            if slot.touched.elapsed() < idle {
                return true;
            }
            match Arc::clone(&slot.cell).try_lock_owned() {
                Ok(mut actor) => {
                    *actor = None;
                    debug!(%key, "Actor deactivated");
                    false
                }
                Err(_) => true,
            }
        });
        let dropped = before - slots.len();
        if dropped > 0 {
            info!(dropped, "Idle actors deactivated");
        }
        dropped
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<A::Key, Slot<A>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State key for an actor record.
pub fn state_key(kind: &str, key: &impl Display) -> String {
    format!("{}:{}", kind, key)
}

/// Services over an in-memory store with a fixed secret.
#[cfg(test)]
pub(crate) fn test_services() -> Arc<Services> {
    let config = EngineConfig::new("00112233445566778899aabbccddeeff");
    let store: Arc<dyn StateStore> = Arc::new(crate::store::MemoryStore::new());
    let hub = PubSubHub::open(64);
    Arc::new(Services::new(config, store, hub).expect("test secret is valid hex"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static ACTIVATIONS: AtomicUsize = AtomicUsize::new(0);

    struct Counter {
        hits: u32,
    }

    #[async_trait]
    impl Actor for Counter {
        type Key = String;
        const KIND: &'static str = "Counter";

        async fn activate(key: &String, _services: &Services) -> Result<Self, EngineError> {
            if key == "broken" {
                return Err(EngineError::dependency("cannot load"));
            }
            ACTIVATIONS.fetch_add(1, Ordering::SeqCst);
            Ok(Self { hits: 0 })
        }
    }

    #[tokio::test]
    async fn test_activation_is_reused_until_idle() {
        let host = ActorHost::<Counter>::new(test_services());
        let key = "a".to_string();
        let before = ACTIVATIONS.load(Ordering::SeqCst);

        host.get(&key).await.unwrap().hits += 1;
        host.get(&key).await.unwrap().hits += 1;
        assert_eq!(host.get(&key).await.unwrap().hits, 2);
        assert_eq!(host.active_count(), 1);

        assert_eq!(host.deactivate_idle(Duration::ZERO), 1);
        assert_eq!(host.active_count(), 0);
        assert_eq!(host.get(&key).await.unwrap().hits, 0);
        assert!(ACTIVATIONS.load(Ordering::SeqCst) >= before + 2);
    }

    #[tokio::test]
    async fn test_busy_actor_survives_sweep() {
        let host = ActorHost::<Counter>::new(test_services());
        let key = "busy".to_string();
        let guard = host.get(&key).await.unwrap();
        assert_eq!(host.deactivate_idle(Duration::ZERO), 0);
        drop(guard);
        assert_eq!(host.deactivate_idle(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn test_failed_activation_is_retried() {
        let host = ActorHost::<Counter>::new(test_services());
        let key = "broken".to_string();
        assert!(host.get(&key).await.is_err());
        assert!(host.get(&key).await.is_err());
    }

    #[tokio::test]
    async fn test_same_key_calls_are_serialized() {
        let host = Arc::new(ActorHost::<Counter>::new(test_services()));
        let key = "shared".to_string();
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let host = Arc::clone(&host);
                let key = key.clone();
                tokio::spawn(async move {
                    let mut actor = host.get(&key).await.unwrap();
                    let seen = actor.hits;
                    tokio::task::yield_now().await;
                    actor.hits = seen + 1;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(host.get(&key).await.unwrap().hits, 16);
    }
}
