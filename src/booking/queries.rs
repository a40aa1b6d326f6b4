use chrono::NaiveDate;

use crate::model::*;
use crate::store::DocumentStore;

use super::{decode_record, record_path, BookingError, BookingRepository};

impl<S: DocumentStore> BookingRepository<S> {
    pub async fn get(&self, id: &ReservationId) -> Result<Option<Reservation>, BookingError> {
        let path = match record_path(id) {
            Ok(path) => path,
            Err(BookingError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(self
            .store
            .get(&path)
            .await?
            .and_then(|value| decode_record(id.as_str(), value)))
    }

    /// Reservations matching `filter`, in store order.
    pub async fn list(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, BookingError> {
        let mut all = self.read_all().await?.value;
        all.retain(|r| filter.matches(r));
        Ok(all)
    }

    /// Like [`list`](Self::list), ordered by date then start hour.
    pub async fn list_sorted(
        &self,
        filter: &ReservationFilter,
    ) -> Result<Vec<Reservation>, BookingError> {
        let mut out = self.list(filter).await?;
        out.sort_by_key(|r| (r.date, r.start_hour, r.end_hour));
        Ok(out)
    }

    /// One day's reservations, earliest first.
    pub async fn occupancy(&self, date: NaiveDate) -> Result<Vec<Reservation>, BookingError> {
        let filter = ReservationFilter {
            date: Some(date),
            ..Default::default()
        };
        self.list_sorted(&filter).await
    }

    /// The reservation holding `hour` on `date`, if any.
    pub async fn booking_at(
        &self,
        date: NaiveDate,
        hour: Hour,
    ) -> Result<Option<Reservation>, BookingError> {
        Ok(self
            .occupancy(date)
            .await?
            .into_iter()
            .find(|r| r.hours().contains_hour(hour)))
    }

    pub async fn is_hour_booked(&self, date: NaiveDate, hour: Hour) -> Result<bool, BookingError> {
        Ok(self.booking_at(date, hour).await?.is_some())
    }
}
