//! End-to-end tests driving the gateway over in-memory storage.

use async_trait::async_trait;
use boxworld_bits::{Address, AddressedRngFactory, PAGE_BITS, decompress};
use boxworld_minesweeper::{Grid, MineField};
use boxworld_server::{
    EngineConfig, EngineErrorKind, GOLD_SPOTS, GOLD_STREAM, Gateway, MINE_STREAM, MemoryStore,
    StateStore, StoreError, Team, Topic, TopicKind,
};
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const SECRET: &str = "00112233445566778899aabbccddeeff";

async fn start() -> Gateway {
    Gateway::start(EngineConfig::new(SECRET), Arc::new(MemoryStore::new()))
        .await
        .expect("Gateway failed to start")
}

fn page_bits(compressed: Option<Vec<u8>>) -> Vec<bool> {
    match compressed {
        Some(bytes) => decompress(&bytes).expect("Corrupt page").expect("Empty page"),
        None => vec![false; PAGE_BITS],
    }
}

fn mines_for(address: &Address, width: usize, count: usize) -> BTreeSet<usize> {
    let rng = AddressedRngFactory::from_hex(SECRET)
        .expect("Bad secret")
        .derive(MINE_STREAM)
        .expect("Bad stream");
    let grid = Grid::new(width).expect("Bad width");
    let field = MineField::generate(grid, count, &mut rng.for_address(address)).expect("Bad layout");
    field.mines().keys().copied().collect()
}

#[tokio::test]
async fn test_set_bit_without_callback_flips_and_publishes() {
    let gateway = start().await;
    let page = "0a";
    let address: Address = page.parse().expect("Bad address");
    let topic = Topic::new(TopicKind::Checkbox, address);
    let mut events = gateway
        .cluster()
        .services()
        .hub()
        .subscribe(&topic)
        .expect("Subscribe failed");

    let outcome = gateway.set_bit(page, 5, true, "u1").await.expect("Set failed");
    assert!(outcome.changed);
    assert!(outcome.auto_revealed.is_empty());

    let event = events.recv().await.expect("No event");
    assert_eq!(*event, serde_json::json!({"index": 5, "value": true}));

    let bits = page_bits(gateway.get_bits(page).await.expect("Get failed"));
    assert!(bits[5]);
    assert_eq!(bits.iter().filter(|b| **b).count(), 1);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_validation_errors() {
    let gateway = start().await;
    let err = gateway.set_bit("0a", PAGE_BITS, true, "u1").await.unwrap_err();
    assert_eq!(err.kind(), EngineErrorKind::Validation);
    let err = gateway.set_bit("not hex", 0, true, "u1").await.unwrap_err();
    assert_eq!(err.kind(), EngineErrorKind::Validation);
    let err = gateway.create_minesweeper_game(65, 10, "u1").await.unwrap_err();
    assert_eq!(err.kind(), EngineErrorKind::Validation);
    let err = gateway.create_minesweeper_game(8, 0, "u1").await.unwrap_err();
    assert_eq!(err.kind(), EngineErrorKind::Validation);
    let err = gateway.create_war(7).await.unwrap_err();
    assert_eq!(err.kind(), EngineErrorKind::Validation);
    let err = gateway.get_war(42).await.unwrap_err();
    assert_eq!(err.kind(), EngineErrorKind::NotFound);
    gateway.shutdown().await;
}

#[derive(Debug, Default)]
struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, record: Vec<u8>) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::new("disk on fire"));
        }
        self.inner.write(key, record).await
    }
}

#[tokio::test]
async fn test_store_failure_aborts_set_bit() {
    let store = Arc::new(FlakyStore::default());
    let shared = Arc::clone(&store) as Arc<dyn StateStore>;
    let gateway = Gateway::start(EngineConfig::new(SECRET), shared)
        .await
        .expect("Gateway failed to start");
    gateway.set_bit("0b", 1, true, "u1").await.expect("Set failed");

    store.failing.store(true, Ordering::SeqCst);
    let err = gateway.set_bit("0b", 2, true, "u1").await.unwrap_err();
    assert_eq!(err.kind(), EngineErrorKind::Dependency);

    store.failing.store(false, Ordering::SeqCst);
    let bits = page_bits(gateway.get_bits("0b").await.expect("Get failed"));
    assert!(bits[1]);
    assert!(!bits[2]);
    // The in-memory copy was not touched, so the retry is a real flip.
    assert!(gateway.set_bit("0b", 2, true, "u1").await.expect("Retry failed").changed);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_minesweeper_win_then_conflict() {
    let gateway = start().await;
    let game = gateway.create_minesweeper_game(8, 10, "u1").await.expect("Create failed");
    let address = *game.address();
    let sweep = game.sweep_address().to_string();
    let mines = mines_for(&address, 8, 10);
    assert_eq!(mines.len(), 10);

    let game_address = address.to_string();
    let mut exposed = BTreeSet::new();
    for index in (0..64).filter(|i| !mines.contains(i)) {
        if exposed.contains(&index) {
            continue;
        }
        let state = gateway.get_minesweeper_state(&game_address).await.expect("View failed");
        if state.ended_at().is_some() {
            break;
        }
        let outcome = gateway.set_bit(&sweep, index, true, "u1").await.expect("Sweep failed");
        exposed.insert(index);
        exposed.extend(outcome.auto_revealed);
    }

    let view = gateway.get_minesweeper_state(&address.to_string()).await.expect("View failed");
    assert_eq!(*view.won(), Some(true));
    assert!(view.ended_at().is_some());
    assert_eq!(view.mines().as_ref().map(Vec::len), Some(10));

    let mine = *mines.iter().next().expect("No mines");
    let err = gateway.set_bit(&sweep, mine, true, "u1").await.unwrap_err();
    assert_eq!(err.kind(), EngineErrorKind::StateConflict);
    let bits = page_bits(gateway.get_bits(&sweep).await.expect("Get failed"));
    assert!(!bits[mine]);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_minesweeper_view_hides_mines_while_running() {
    let gateway = start().await;
    let game = gateway.create_minesweeper_game(16, 40, "u2").await.expect("Create failed");
    let flag = game.flag_address().to_string();
    gateway.set_bit(&flag, 3, true, "u2").await.expect("Flag failed");

    let view = gateway
        .get_minesweeper_state(&game.address().to_string())
        .await
        .expect("View failed");
    assert!(view.mines().is_none());
    assert!(view.started_at().is_some());
    assert!(view.ended_at().is_none());

    let err = gateway
        .get_minesweeper_state(&Address::from_u64(99).to_string())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), EngineErrorKind::NotFound);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_war_is_balanced_and_checkers_can_win() {
    let gateway = start().await;
    let war = gateway.create_war(8).await.expect("Create failed");
    assert_eq!(*war.id(), 1);
    assert_eq!(*gateway.create_war(8).await.expect("Second war failed").id(), 2);

    let page = war.war_page_address().to_string();
    let bits = page_bits(gateway.get_bits(&page).await.expect("Get failed"));
    assert_eq!(bits.iter().filter(|b| **b).count(), 32);

    for index in (0..64).filter(|i| !bits[*i]) {
        gateway.set_bit(&page, index, true, "u1").await.expect("Check failed");
    }
    let view = gateway.get_war(1).await.expect("Get war failed");
    assert_eq!(*view.winning_team(), Team::Checkers);
    assert_eq!(*view.checked_count(), 64);

    let err = gateway.set_bit(&page, 0, false, "u1").await.unwrap_err();
    assert_eq!(err.kind(), EngineErrorKind::StateConflict);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_digging_gold_credits_once() {
    let gateway = start().await;
    let address = Address::from_u64(0x601d);
    let mut rng = AddressedRngFactory::from_hex(SECRET)
        .expect("Bad secret")
        .derive(GOLD_STREAM)
        .expect("Bad stream")
        .for_address(&address);
    let mut spots = BTreeSet::new();
    while spots.len() < GOLD_SPOTS {
        spots.insert(rng.gen_range(0..PAGE_BITS));
    }
    let spot = *spots.iter().next().expect("No spots");
    let miss = (0..PAGE_BITS).find(|i| !spots.contains(i)).expect("No miss");
    let page = address.to_string();

    assert!(!gateway.dig(&page, miss, "u1").await.expect("Dig failed").found);
    let outcome = gateway.dig(&page, spot, "u1").await.expect("Dig failed");
    assert!(outcome.changed && outcome.found);
    let again = gateway.dig(&page, spot, "u1").await.expect("Dig failed");
    assert!(!again.changed && !again.found);

    assert_eq!(*gateway.balance("u1").await.expect("Balance failed").balance(), 1);
    let view = gateway.get_gold_spots(&page).await.expect("Spots failed");
    assert_eq!(view.found(), &vec![spot]);
    assert_eq!(*view.remaining(), GOLD_SPOTS - 1);
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscribers_receive_debounced_batches() {
    let gateway = start().await;
    let mut subscription = gateway.subscribe("0c").expect("Subscribe failed");

    gateway.set_bit("0c", 1, true, "u1").await.expect("Set failed");
    gateway.set_bit("0c", 1, false, "u1").await.expect("Set failed");
    gateway.set_bit("0c", 2, true, "u1").await.expect("Set failed");

    let batch = subscription.recv().await.expect("No batch");
    assert_eq!(batch, HashMap::from([(1, false), (2, true)]));
    assert!(gateway.unsubscribe(subscription).await);
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_balance_and_stats_feeds() {
    let gateway = start().await;
    let mut balances = gateway.subscribe_balance("u9").expect("Subscribe failed");
    let mut stats = gateway.subscribe_stats().expect("Subscribe failed");

    gateway.set_display_name("u9", "Nine").await.expect("Rename failed");
    let batch = balances.recv().await.expect("No balance batch");
    assert_eq!(batch["u9"].display_name().as_deref(), Some("Nine"));

    gateway.set_bit("0d", 1, true, "u9").await.expect("Set failed");
    gateway.set_bit("0d", 2, true, "u9").await.expect("Set failed");
    gateway.set_bit("0d", 2, false, "u9").await.expect("Set failed");
    // Totals are eventually consistent; wait for the batch carrying all three flips.
    loop {
        let batch = stats.recv().await.expect("No stats batch");
        let totals = batch["global"];
        if (*totals.total_checks(), *totals.total_unchecks()) == (2, 1) {
            break;
        }
    }
    assert_eq!(*gateway.global_stats().await.total_checks(), 2);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_flushes_stats_and_closes_hub() {
    let gateway = start().await;
    gateway.set_bit("0e", 1, true, "u1").await.expect("Set failed");
    gateway.shutdown().await;

    assert_eq!(*gateway.global_stats().await.total_checks(), 1);
    let err = gateway.set_bit("0e", 2, true, "u1").await.unwrap_err();
    assert_eq!(err.kind(), EngineErrorKind::Dependency);
    assert!(gateway.subscribe("0e").is_err());
    gateway.shutdown().await;
}
