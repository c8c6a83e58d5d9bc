//! The checkbox page actor: one 4096-bit array per address.

use super::callback::{AutoRevealed, CallbackDispatch, CallbackTarget, CheckboxUpdate};
use crate::host::{Actor, Services, state_key};
use crate::pubsub::{Topic, TopicKind};
use crate::store::PersistentState;
use crate::EngineError;
use async_trait::async_trait;
use boxworld_bits::{Address, PAGE_BITS, compress, decompress, unpack_be};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Persisted page record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckboxPageState {
    /// Compressed bits; `None` until the first write.
    #[serde(default, with = "hex_bytes")]
    pub bits: Option<Vec<u8>>,
    /// Game notified of flips. Last registration wins.
    #[serde(default)]
    pub callback: Option<CallbackTarget>,
}

/// Event published on `Checkbox:<address>` for every `set_bit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckboxEvent {
    /// Index that was set.
    pub index: usize,
    /// Value it was set to.
    pub value: bool,
}

/// What a `set_bit` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetBitOutcome {
    /// Whether the stored bit actually flipped.
    pub changed: bool,
    /// Indices the callback target reported as auto-revealed.
    pub auto_revealed: Vec<usize>,
}

/// One checkbox page.
///
/// The compressed record is loaded on activation. The decompressed working
/// copy is built on the first call that needs it and reused for the rest
/// of the activation; every mutation recompresses and persists at once.
#[derive(Debug)]
pub struct CheckboxPage {
    address: Address,
    state: PersistentState<CheckboxPageState>,
    working: Option<Vec<bool>>,
}

#[async_trait]
impl Actor for CheckboxPage {
    type Key = Address;
    const KIND: &'static str = "Checkbox";

    async fn activate(key: &Address, services: &Services) -> Result<Self, EngineError> {
        let state =
            PersistentState::load(Arc::clone(services.store()), state_key(Self::KIND, key)).await?;
        Ok(Self {
            address: *key,
            state,
            working: None,
        })
    }
}

impl CheckboxPage {
    /// Page address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Registered callback target, if any.
    pub fn callback(&self) -> Option<CallbackTarget> {
        self.state.get().callback
    }

    /// The persisted compressed bits, without decompressing.
    pub fn get_bits(&self) -> Option<Vec<u8>> {
        self.state.get().bits.clone()
    }

    /// Whether the working copy has been built this activation.
    pub fn is_materialized(&self) -> bool {
        self.working.is_some()
    }

    /// Sets bit `index` to `value` on behalf of `user_id`.
    ///
    /// On a real flip the callback target sees the flipped page first and
    /// may veto it; then the page is persisted and the flip counted. A
    /// `{index, value}` event is published either way, plus one `true`
    /// event per index the target auto-revealed.
    ///
    /// # Errors
    ///
    /// Validation errors for an out-of-range index, the callback's error if
    /// it vetoed, and dependency errors if the hub is closed or the page
    /// cannot be persisted. Nothing is committed or published on error.
    #[instrument(skip(self, services, dispatch), fields(page = %self.address))]
    pub async fn set_bit(
        &mut self,
        services: &Services,
        dispatch: &dyn CallbackDispatch,
        index: usize,
        value: bool,
        user_id: &str,
    ) -> Result<SetBitOutcome, EngineError> {
        if index >= PAGE_BITS {
            return Err(EngineError::validation(format!(
                "index {} outside 0..{}",
                index, PAGE_BITS
            )));
        }
        services.hub().ensure_open()?;

        let working = self.materialize()?;
        let mut outcome = SetBitOutcome::default();
        if working[index] != value {
            let mut next = working.clone();
            next[index] = value;

            let mut auto_revealed = AutoRevealed::new();
            if let Some(target) = self.callback() {
                let update = CheckboxUpdate {
                    page: self.address,
                    bits: &next,
                    index,
                    value,
                    user_id,
                };
                debug!(%target, "Dispatching callback");
                if let Some(extra) = dispatch.dispatch(target, &update).await? {
                    auto_revealed = extra;
                }
            }

            let record = CheckboxPageState {
                bits: Some(compress(&next)),
                callback: self.callback(),
            };
            self.state.write(record).await?;
            self.working = Some(next);
            services.stats().record(value);

            outcome.changed = true;
            outcome.auto_revealed = auto_revealed.into_keys().collect();
            debug!(index, value, "Bit flipped");
        }

        let topic = Topic::new(TopicKind::Checkbox, self.address);
        let events = std::iter::once(CheckboxEvent { index, value }).chain(
            outcome
                .auto_revealed
                .iter()
                .map(|&index| CheckboxEvent { index, value: true }),
        );
        for event in events {
            if let Err(e) = services.hub().publish(&topic, &event) {
                warn!(error = %e, "Flip committed but not published");
            }
        }
        Ok(outcome)
    }

    /// Overwrites the leading bits with big-endian packed `bytes`.
    ///
    /// Used to seed a page at game creation: no callback, no events.
    ///
    /// # Errors
    ///
    /// Returns a dependency error if the page cannot be persisted.
    #[instrument(skip(self, bytes), fields(page = %self.address, len = bytes.len()))]
    pub async fn set_bits(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        let seed = unpack_be(bytes, PAGE_BITS);
        let mut next = self.materialize()?.clone();
        next[..seed.len()].copy_from_slice(&seed);

        let record = CheckboxPageState {
            bits: Some(compress(&next)),
            callback: self.callback(),
        };
        self.state.write(record).await?;
        self.working = Some(next);
        info!(seeded = seed.len(), "Page seeded");
        Ok(())
    }

    /// Makes `target` the game notified of flips, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns a dependency error if the page cannot be persisted.
    #[instrument(skip(self), fields(page = %self.address))]
    pub async fn register_callback(&mut self, target: CallbackTarget) -> Result<(), EngineError> {
        if let Some(previous) = self.callback().filter(|p| *p != target) {
            warn!(%previous, "Replacing callback target");
        }
        let record = CheckboxPageState {
            bits: self.get_bits(),
            callback: Some(target),
        };
        self.state.write(record).await?;
        info!(%target, "Callback registered");
        Ok(())
    }

    fn materialize(&mut self) -> Result<&mut Vec<bool>, EngineError> {
        let bits = match self.working.take() {
            Some(bits) => bits,
            None => {
                let mut bits = match self.state.get().bits.as_deref() {
                    Some(bytes) => decompress(bytes)?.unwrap_or_default(),
                    None => Vec::new(),
                };
                bits.resize(PAGE_BITS, false);
                debug!(page = %self.address, "Working copy materialized");
                bits
            }
        };
        Ok(self.working.insert(bits))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        bytes.as_ref().map(hex::encode).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|h| hex::decode(h).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::test_services;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(CallbackTarget, usize, bool, usize)>>,
        reply: Option<AutoRevealed>,
        fail: bool,
    }

    #[async_trait]
    impl CallbackDispatch for Recorder {
        async fn dispatch(
            &self,
            target: CallbackTarget,
            update: &CheckboxUpdate<'_>,
        ) -> Result<Option<AutoRevealed>, EngineError> {
            let set = update.bits.iter().filter(|b| **b).count();
            self.calls.lock().unwrap().push((target, update.index, update.value, set));
            if self.fail {
                return Err(EngineError::state_conflict("game over"));
            }
            Ok(self.reply.clone())
        }
    }

    async fn page(services: &Services) -> CheckboxPage {
        CheckboxPage::activate(&Address::from_u64(0xa), services).await.unwrap()
    }

    #[tokio::test]
    async fn test_set_bit_flips_persists_and_publishes() {
        let services = test_services();
        let mut page = page(&services).await;
        let topic = Topic::new(TopicKind::Checkbox, page.address());
        let mut rx = services.hub().subscribe(&topic).unwrap();
        let recorder = Recorder::default();

        let outcome = page.set_bit(&services, &recorder, 5, true, "u1").await.unwrap();
        assert!(outcome.changed);
        assert!(recorder.calls.lock().unwrap().is_empty());

        let event: CheckboxEvent = serde_json::from_value((*rx.recv().await.unwrap()).clone()).unwrap();
        assert_eq!(event, CheckboxEvent { index: 5, value: true });

        let reloaded = CheckboxPage::activate(&page.address(), &services).await.unwrap();
        let bits = decompress(&reloaded.get_bits().unwrap()).unwrap().unwrap();
        assert_eq!(bits.len(), PAGE_BITS);
        assert!(bits[5]);
        assert_eq!(bits.iter().filter(|b| **b).count(), 1);
        assert!(!reloaded.is_materialized());
        assert_eq!(services.stats().take().checks, 1);
    }

    #[tokio::test]
    async fn test_noop_set_still_publishes_without_callback_or_count() {
        let services = test_services();
        let mut page = page(&services).await;
        page.register_callback(CallbackTarget::War(1)).await.unwrap();
        let mut rx = services.hub().subscribe(&Topic::new(TopicKind::Checkbox, page.address())).unwrap();
        let recorder = Recorder::default();

        let outcome = page.set_bit(&services, &recorder, 9, false, "u1").await.unwrap();
        assert!(!outcome.changed);
        assert!(recorder.calls.lock().unwrap().is_empty());
        assert!(services.stats().take().is_empty());
        assert!(page.get_bits().is_none());
        assert_eq!(rx.recv().await.unwrap()["index"], 9);
    }

    #[tokio::test]
    async fn test_callback_sees_flip_and_auto_reveals_are_published() {
        let services = test_services();
        let mut page = page(&services).await;
        page.register_callback(CallbackTarget::War(3)).await.unwrap();
        let mut rx = services.hub().subscribe(&Topic::new(TopicKind::Checkbox, page.address())).unwrap();
        let recorder = Recorder {
            reply: Some(AutoRevealed::from([(1, true), (2, true)])),
            ..Recorder::default()
        };

        let outcome = page.set_bit(&services, &recorder, 0, true, "u1").await.unwrap();
        assert_eq!(outcome.auto_revealed, vec![1, 2]);
        assert_eq!(
            recorder.calls.lock().unwrap().as_slice(),
            &[(CallbackTarget::War(3), 0, true, 1)]
        );
        let indices: Vec<u64> = (0..3)
            .map(|_| rx.try_recv().unwrap()["index"].as_u64().unwrap())
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_callback_failure_aborts_flip() {
        let services = test_services();
        let mut page = page(&services).await;
        page.register_callback(CallbackTarget::War(3)).await.unwrap();
        let mut rx = services.hub().subscribe(&Topic::new(TopicKind::Checkbox, page.address())).unwrap();
        let recorder = Recorder {
            fail: true,
            ..Recorder::default()
        };

        let err = page.set_bit(&services, &recorder, 4, true, "u1").await.unwrap_err();
        assert_eq!(err.kind(), crate::EngineErrorKind::StateConflict);
        assert!(page.get_bits().is_none());
        assert!(rx.try_recv().is_err());

        // The working copy was not touched either.
        let recorder = Recorder::default();
        assert!(page.set_bit(&services, &recorder, 4, true, "u1").await.unwrap().changed);
    }

    #[tokio::test]
    async fn test_out_of_range_index_is_rejected() {
        let services = test_services();
        let mut page = page(&services).await;
        let err = page
            .set_bit(&services, &Recorder::default(), PAGE_BITS, true, "u1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::EngineErrorKind::Validation);
        assert!(!page.is_materialized());
    }

    #[tokio::test]
    async fn test_set_bits_seeds_leading_bits() {
        let services = test_services();
        let mut page = page(&services).await;
        page.set_bits(&[0b1100_0000, 0b0000_0001]).await.unwrap();
        let bits = decompress(&page.get_bits().unwrap()).unwrap().unwrap();
        assert!(bits[0] && bits[1] && bits[15]);
        assert_eq!(bits.iter().filter(|b| **b).count(), 3);
    }

    #[test]
    fn test_state_record_uses_hex_bits() {
        let state = CheckboxPageState {
            bits: Some(vec![0xab, 0x01]),
            callback: None,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["bits"], "ab01");
        let back: CheckboxPageState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
        let empty: CheckboxPageState = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, CheckboxPageState::default());
    }
}
