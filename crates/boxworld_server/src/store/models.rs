//! Database rows for actor state.

use chrono::NaiveDateTime;
use derive_getters::Getters;
use derive_new::new;
use diesel::prelude::*;

use crate::store::schema;

/// A stored actor record.
#[derive(Debug, Clone, Queryable, Selectable, Getters)]
#[diesel(table_name = schema::actor_state)]
pub struct StateRow {
    state_key: String,
    record: Vec<u8>,
    updated_at: NaiveDateTime,
}

impl StateRow {
    /// Consumes the row, keeping only the record bytes.
    pub fn into_record(self) -> Vec<u8> {
        self.record
    }
}

/// Insertable actor record; written with `REPLACE INTO`.
#[derive(Debug, Clone, Insertable, new)]
#[diesel(table_name = schema::actor_state)]
pub struct NewStateRow {
    state_key: String,
    record: Vec<u8>,
    updated_at: NaiveDateTime,
}
