use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Unix milliseconds, used for record timestamps.
pub type Ms = i64;

/// Hour-of-day boundary.
pub type Hour = u32;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// `true` iff the half-open ranges `[a_start, a_end)` and `[b_start, b_end)` share
/// at least one hour. Both ranges must already be well formed.
pub fn overlaps(a_start: Hour, a_end: Hour, b_start: Hour, b_end: Hour) -> bool {
    !(b_end <= a_start || b_start >= a_end)
}

/// Half-open hour range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HourRange {
    pub start: Hour,
    pub end: Hour,
}

impl HourRange {
    pub fn new(start: Hour, end: Hour) -> Self {
        debug_assert!(start < end, "HourRange start must be before end");
        Self { start, end }
    }

    pub fn hours(&self) -> Hour {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &HourRange) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn contains_hour(&self, hour: Hour) -> bool {
        self.start <= hour && hour < self.end
    }
}

/// Store key of a reservation. New ids are ULIDs handed out by the store; older
/// keys (e.g. millisecond timestamps) are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(String);

impl ReservationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ReservationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ReservationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A stored booking of the common room. This is also the record shape at
/// `bookings/<id>` in the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    #[serde(default)]
    pub id: ReservationId,
    pub date: NaiveDate,
    #[serde(deserialize_with = "lenient::number")]
    pub apartment: u32,
    #[serde(rename = "startTime", deserialize_with = "lenient::number")]
    pub start_hour: Hour,
    #[serde(rename = "endTime", deserialize_with = "lenient::number")]
    pub end_hour: Hour,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub accept_terms: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Ms>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Ms>,
}

impl Reservation {
    pub fn hours(&self) -> HourRange {
        HourRange {
            start: self.start_hour,
            end: self.end_hour,
        }
    }

    pub(crate) fn from_valid(id: ReservationId, valid: ValidReservation) -> Self {
        Self {
            id,
            date: valid.date,
            apartment: valid.apartment,
            start_hour: valid.hours.start,
            end_hour: valid.hours.end,
            name: valid.name,
            phone: valid.phone,
            purpose: valid.purpose,
            accept_terms: true,
            created_at: None,
            updated_at: None,
        }
    }
}

/// A candidate reservation as submitted by a resident. Every field may be missing
/// so the validator can report exactly what is incomplete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationDraft {
    #[serde(default, deserialize_with = "lenient::opt_date")]
    pub date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient::opt_number")]
    pub apartment: Option<u32>,
    #[serde(default, rename = "startTime", deserialize_with = "lenient::opt_number")]
    pub start_hour: Option<Hour>,
    #[serde(default, rename = "endTime", deserialize_with = "lenient::opt_number")]
    pub end_hour: Option<Hour>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub accept_terms: bool,
}

impl ReservationDraft {
    /// Fill every absent field from `existing`. Used by the update path so an
    /// administrator can change one field without resubmitting the rest.
    pub fn merged_over(self, existing: &Reservation) -> Self {
        Self {
            date: self.date.or(Some(existing.date)),
            apartment: self.apartment.or(Some(existing.apartment)),
            start_hour: self.start_hour.or(Some(existing.start_hour)),
            end_hour: self.end_hour.or(Some(existing.end_hour)),
            name: self.name.or_else(|| Some(existing.name.clone())),
            phone: self.phone.or_else(|| Some(existing.phone.clone())),
            purpose: self.purpose.or_else(|| Some(existing.purpose.clone())),
            accept_terms: self.accept_terms || existing.accept_terms,
        }
    }
}

impl From<&Reservation> for ReservationDraft {
    fn from(r: &Reservation) -> Self {
        Self {
            date: Some(r.date),
            apartment: Some(r.apartment),
            start_hour: Some(r.start_hour),
            end_hour: Some(r.end_hour),
            name: Some(r.name.clone()),
            phone: Some(r.phone.clone()),
            purpose: Some(r.purpose.clone()),
            accept_terms: r.accept_terms,
        }
    }
}

/// A draft that passed validation, normalized and ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidReservation {
    pub date: NaiveDate,
    pub apartment: u32,
    pub hours: HourRange,
    pub name: String,
    pub phone: String,
    pub purpose: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationFilter {
    #[serde(default, deserialize_with = "lenient::opt_date")]
    pub date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient::opt_number")]
    pub apartment: Option<u32>,
    /// Case-insensitive substring of the requester name.
    #[serde(default)]
    pub name: Option<String>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        if let Some(date) = self.date
            && r.date != date
        {
            return false;
        }
        if let Some(apartment) = self.apartment
            && r.apartment != apartment
        {
            return false;
        }
        if let Some(ref needle) = self.name {
            let needle = needle.to_lowercase();
            if !r.name.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

/// Change feed record, published after every successful mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReservationEvent {
    Created {
        reservation: Reservation,
    },
    Updated {
        previous_date: NaiveDate,
        reservation: Reservation,
    },
    Deleted {
        id: ReservationId,
        date: NaiveDate,
    },
}

impl ReservationEvent {
    /// Dates whose calendars this event changes.
    pub fn dates(&self) -> Vec<NaiveDate> {
        match self {
            ReservationEvent::Created { reservation } => vec![reservation.date],
            ReservationEvent::Updated {
                previous_date,
                reservation,
            } if *previous_date != reservation.date => vec![*previous_date, reservation.date],
            ReservationEvent::Updated { reservation, .. } => vec![reservation.date],
            ReservationEvent::Deleted { date, .. } => vec![*date],
        }
    }
}

/// Deserializers that accept numbers written either as JSON numbers or as
/// numeric strings (`9`, `"9"`, `"09"`).
pub(crate) mod lenient {
    use chrono::NaiveDate;
    use serde::de::{self, Deserializer};
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u64),
        Str(String),
    }

    fn to_u32<E: de::Error>(raw: NumOrStr) -> Result<Option<u32>, E> {
        match raw {
            NumOrStr::Num(n) => u32::try_from(n)
                .map(Some)
                .map_err(|_| E::custom(format!("number out of range: {n}"))),
            NumOrStr::Str(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return Ok(None);
                }
                s.parse::<u32>()
                    .map(Some)
                    .map_err(|_| E::custom(format!("not a whole number: {s:?}")))
            }
        }
    }

    pub fn number<'de, D>(deserializer: D) -> Result<u32, D::Error>
    where
        D: Deserializer<'de>,
    {
        to_u32(NumOrStr::deserialize(deserializer)?)?
            .ok_or_else(|| de::Error::custom("empty number"))
    }

    pub fn opt_number<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<NumOrStr>::deserialize(deserializer)? {
            Some(raw) => to_u32(raw),
            None => Ok(None),
        }
    }

    pub fn opt_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map(Some)
                .map_err(|e| de::Error::custom(format!("invalid date {s:?}: {e}"))),
            None => Ok(None),
        }
    }
}
