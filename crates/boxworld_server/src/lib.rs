//! Boxworld engine - virtual-actor checkbox pages and the games built on them
//!
//! Every 4096-bit checkbox page, minesweeper game, war round, gold-digger
//! page and user account is an actor: activated on first use, persisted as
//! a whole record on every change, and run one call at a time.
//!
//! # Architecture
//!
//! - **Store**: whole-record key/value persistence (memory or SQLite)
//! - **Host**: per-key activation, serialization and idle deactivation
//! - **Actors**: pages and the games that observe them through callbacks
//! - **Pub/sub**: topic-per-address broadcast hub
//! - **Fan-out**: debounced per-topic batches for subscribers
//! - **Gateway**: the client-facing operations
//!
//! # Example
//!
//! ```no_run
//! use boxworld_server::{EngineConfig, Gateway, MemoryStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), boxworld_server::EngineError> {
//! let config = EngineConfig::new("00112233445566778899aabbccddeeff");
//! let gateway = Gateway::start(config, Arc::new(MemoryStore::new())).await?;
//! let page = "0a";
//! gateway.set_bit(page, 5, true, "u1").await?;
//! gateway.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

// Private module declarations
mod actors;
mod cli;
mod cluster;
mod config;
mod debounce;
mod error;
mod fanout;
mod gateway;
mod host;
mod ledger;
mod pubsub;
mod stats;
mod store;

// Crate-level exports - Errors
pub use error::{EngineError, EngineErrorKind};

// Crate-level exports - Configuration
pub use config::{
    ConfigError, DB_PATH_ENV, DebounceConfig, EngineConfig, RNG_SECRET_ENV, StorageConfig,
};

// Crate-level exports - CLI
pub use cli::{Cli, Command};

// Crate-level exports - Persistence
pub use store::{MemoryStore, PersistentState, SqliteStore, StateStore, StoreError};

// Crate-level exports - Actor runtime
pub use host::{Actor, ActorGuard, ActorHost, Services, state_key};

// Crate-level exports - Actors
pub use actors::{
    AutoRevealed, Balance, CallbackDispatch, CallbackTarget, CellCount, CheckboxEvent,
    CheckboxObserver, CheckboxPage, CheckboxPageState, CheckboxUpdate, GOLD_REWARD, GOLD_SPOTS,
    GOLD_STREAM, GoldDiggerGame, GoldFound, GoldSpotsView, MAX_DISPLAY_NAME, MINE_STREAM,
    MinesweeperEvent, MinesweeperGame, MinesweeperState, MinesweeperView, NewWar, SetBitOutcome,
    Team, UserAccount, WarGame, WarState, WarView, balanced_battlefield,
};

// Crate-level exports - Ledger
pub use ledger::{AccountLedger, UserLedger};

// Crate-level exports - Pub/sub and fan-out
pub use debounce::{BatchListener, ChannelListener, DebounceBatcher, ListenerError, ListenerId};
pub use fanout::{
    Decoder, FanOutService, SUBSCRIBER_BUFFER, Subscription, decode_balance, decode_checkbox,
    decode_minesweeper_counts, decode_minesweeper_state, decode_stats, decode_war,
};
pub use pubsub::{Payload, PubSubHub, Topic, TopicKind};

// Crate-level exports - Statistics
pub use stats::{
    GLOBAL_STATS_KEY, GlobalStats, StatsAccumulator, StatsAggregator, StatsDelta, StatsFlusher,
};

// Crate-level exports - Cluster and gateway
pub use cluster::{Cluster, DigOutcome};
pub use gateway::{Gateway, MinesweeperSubscription};
