mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use crate::model::overlaps;
pub use conflict::{ConflictScope, Validator};
pub use error::{BookingError, ValidationError};

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::limits::DEFAULT_COMMIT_ATTEMPTS;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::settings::SettingsService;
use crate::store::{segments, DocumentStore, Versioned};

/// Store collection holding one record per reservation id.
pub const BOOKINGS_PATH: &str = "bookings";

/// How a validated write reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Read, validate, write, with nothing guarding the gap. Two concurrent
    /// writers can both pass validation against the same snapshot and both land.
    Naive,
    /// Write only if the collection is unchanged since it was read; otherwise
    /// re-read, re-validate and try again, up to `max_attempts` times.
    Optimistic { max_attempts: u32 },
}

impl Default for CommitPolicy {
    fn default() -> Self {
        CommitPolicy::Optimistic {
            max_attempts: DEFAULT_COMMIT_ATTEMPTS,
        }
    }
}

impl CommitPolicy {
    /// `0` attempts selects the naive policy.
    pub fn from_attempts(max_attempts: u32) -> Self {
        if max_attempts == 0 {
            CommitPolicy::Naive
        } else {
            CommitPolicy::Optimistic { max_attempts }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingConfig {
    pub scope: ConflictScope,
    pub commit: CommitPolicy,
}

/// Sole writer of the `bookings` collection. Every create and update is validated
/// against the stored set before it is written.
pub struct BookingRepository<S> {
    store: Arc<S>,
    settings: SettingsService<S>,
    config: BookingConfig,
    notify: Arc<NotifyHub>,
}

impl<S: DocumentStore> BookingRepository<S> {
    pub fn new(store: Arc<S>, config: BookingConfig, notify: Arc<NotifyHub>) -> Self {
        Self {
            settings: SettingsService::new(store.clone()),
            store,
            config,
            notify,
        }
    }

    pub fn config(&self) -> BookingConfig {
        self.config
    }

    pub fn settings(&self) -> &SettingsService<S> {
        &self.settings
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    /// Validator for the settings as they are right now.
    pub async fn validator(&self) -> Result<Validator, BookingError> {
        let settings = self.settings.load().await?;
        Ok(Validator::from_settings(self.config.scope, &settings))
    }

    /// Every stored reservation, in store key order, with the collection revision.
    pub(super) async fn read_all(&self) -> Result<Versioned<Vec<Reservation>>, BookingError> {
        let snapshot = self.store.snapshot(BOOKINGS_PATH).await?;
        Ok(Versioned {
            value: decode_collection(snapshot.value),
            revision: snapshot.revision,
        })
    }
}

/// Store path of a reservation. Ids that cannot be a path segment cannot exist.
pub(super) fn record_path(id: &ReservationId) -> Result<String, BookingError> {
    let path = format!("{BOOKINGS_PATH}/{id}");
    match segments(&path) {
        Ok(segs) if segs.len() == 2 => Ok(path),
        _ => Err(BookingError::NotFound(id.clone())),
    }
}

pub(super) fn decode_record(id: &str, value: Value) -> Option<Reservation> {
    match serde_json::from_value::<Reservation>(value) {
        Ok(mut r) => {
            r.id = ReservationId::from(id);
            Some(r)
        }
        Err(e) => {
            warn!("skipping unreadable reservation {id}: {e}");
            None
        }
    }
}

fn decode_collection(value: Option<Value>) -> Vec<Reservation> {
    let Some(Value::Object(map)) = value else {
        return Vec::new();
    };
    map.into_iter()
        .filter_map(|(id, v)| decode_record(&id, v))
        .collect()
}
