use tracing::{debug, info};

use crate::model::*;
use crate::store::{DocumentStore, Write};

use super::{decode_record, record_path, BookingError, BookingRepository, CommitPolicy, BOOKINGS_PATH};

/// A write that reached the store, with the record it replaced.
struct Committed {
    previous: Option<Reservation>,
    record: Reservation,
}

fn record_outcome<T>(op: &'static str, result: &Result<T, BookingError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(crate::observability::BOOKINGS_TOTAL, "op" => op, "outcome" => outcome)
        .increment(1);
}

impl<S: DocumentStore> BookingRepository<S> {
    pub async fn create(&self, draft: ReservationDraft) -> Result<Reservation, BookingError> {
        let result = self.commit(None, draft).await;
        record_outcome("create", &result);
        let Committed { record, .. } = result?;
        info!(
            "reservation {} created: apartment {} on {} [{}, {})",
            record.id, record.apartment, record.date, record.start_hour, record.end_hour
        );
        self.notify.send(&ReservationEvent::Created {
            reservation: record.clone(),
        });
        Ok(record)
    }

    /// Replace the reservation `id`. Fields absent from `draft` keep their stored
    /// values. The record never conflicts with itself.
    pub async fn update(
        &self,
        id: &ReservationId,
        draft: ReservationDraft,
    ) -> Result<Reservation, BookingError> {
        let result = self.commit(Some(id), draft).await;
        record_outcome("update", &result);
        let Committed { previous, record } = result?;
        let previous_date = previous.map_or(record.date, |p| p.date);
        info!("reservation {} updated", record.id);
        self.notify.send(&ReservationEvent::Updated {
            previous_date,
            reservation: record.clone(),
        });
        Ok(record)
    }

    pub async fn delete(&self, id: &ReservationId) -> Result<(), BookingError> {
        let result = self.remove_record(id).await;
        record_outcome("delete", &result);
        let date = result?;
        info!("reservation {id} deleted");
        if let Some(date) = date {
            self.notify.send(&ReservationEvent::Deleted {
                id: id.clone(),
                date,
            });
        }
        Ok(())
    }

    /// Remove whatever is stored under `id`, readable or not. Returns the record's
    /// date when it could be decoded.
    async fn remove_record(
        &self,
        id: &ReservationId,
    ) -> Result<Option<chrono::NaiveDate>, BookingError> {
        let path = record_path(id)?;
        let raw = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| BookingError::NotFound(id.clone()))?;
        let date = decode_record(id.as_str(), raw).map(|r| r.date);
        self.store.remove(&path).await?;
        Ok(date)
    }

    /// Read, validate and write one record. `target` is the id being updated, or
    /// `None` for a new reservation.
    async fn commit(
        &self,
        target: Option<&ReservationId>,
        draft: ReservationDraft,
    ) -> Result<Committed, BookingError> {
        if let Some(id) = target {
            record_path(id)?;
        }
        let validator = self.validator().await?;
        let max_attempts = match self.config.commit {
            CommitPolicy::Naive => 1,
            CommitPolicy::Optimistic { max_attempts } => max_attempts.max(1),
        };
        let mut new_id: Option<ReservationId> = None;

        for attempt in 1..=max_attempts {
            let snapshot = self.read_all().await?;
            let previous = match target {
                Some(id) => Some(
                    snapshot
                        .value
                        .iter()
                        .find(|r| &r.id == id)
                        .cloned()
                        .ok_or_else(|| BookingError::NotFound(id.clone()))?,
                ),
                None => None,
            };
            let candidate = match previous {
                Some(ref p) => draft.clone().merged_over(p),
                None => draft.clone(),
            };

            let in_scope = validator.scoped(&candidate, &snapshot.value, target);
            let valid = validator.validate(&candidate, in_scope)?;

            let id = match target {
                Some(id) => id.clone(),
                None => match new_id.clone() {
                    Some(id) => id,
                    None => {
                        let id = ReservationId::from(self.store.push(BOOKINGS_PATH).await?);
                        new_id = Some(id.clone());
                        id
                    }
                },
            };
            let mut record = Reservation::from_valid(id, valid);
            let now = now_ms();
            match previous {
                Some(ref p) => {
                    record.created_at = p.created_at;
                    record.updated_at = Some(now);
                }
                None => record.created_at = Some(now),
            }

            let path = record_path(&record.id)?;
            let value = serde_json::to_value(&record)?;
            match self.config.commit {
                CommitPolicy::Naive => {
                    self.store.set(&path, value).await?;
                    return Ok(Committed { previous, record });
                }
                CommitPolicy::Optimistic { .. } => {
                    let write = Write::Set { path, value };
                    if self
                        .store
                        .commit_if(BOOKINGS_PATH, snapshot.revision, write)
                        .await?
                    {
                        return Ok(Committed { previous, record });
                    }
                    metrics::counter!(crate::observability::COMMIT_RETRIES_TOTAL).increment(1);
                    debug!("commit attempt {attempt}/{max_attempts} lost the race, retrying");
                }
            }
        }

        Err(BookingError::ConcurrentConflict {
            attempts: max_attempts,
        })
    }
}
