use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::limits::HOURS_PER_DAY;
use crate::model::*;
use crate::settings::SystemSettings;

use super::ValidationError;

/// Which existing reservations a candidate must not overlap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictScope {
    /// Same apartment on the same date.
    #[default]
    Apartment,
    /// Anyone on the same date: the room holds one booking at a time.
    Building,
}

impl FromStr for ConflictScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apartment" => Ok(ConflictScope::Apartment),
            "building" => Ok(ConflictScope::Building),
            other => Err(format!("unknown conflict scope: {other:?}")),
        }
    }
}

/// Pure booking rules. Holds no data beyond the policy it was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validator {
    scope: ConflictScope,
    max_booking_hours: Option<u32>,
}

impl Validator {
    pub fn new(scope: ConflictScope, max_booking_hours: Option<u32>) -> Self {
        Self {
            scope,
            max_booking_hours,
        }
    }

    pub fn from_settings(scope: ConflictScope, settings: &SystemSettings) -> Self {
        Self::new(scope, settings.max_booking_hours)
    }

    pub fn scope(&self) -> ConflictScope {
        self.scope
    }

    /// Narrow `all` to the reservations `candidate` is checked against, leaving out
    /// `exclude` (the record being updated).
    pub fn scoped<'a>(
        &self,
        candidate: &ReservationDraft,
        all: &'a [Reservation],
        exclude: Option<&ReservationId>,
    ) -> Vec<&'a Reservation> {
        let Some(date) = candidate.date else {
            return Vec::new();
        };
        all.iter()
            .filter(|r| r.date == date)
            .filter(|r| match self.scope {
                ConflictScope::Apartment => Some(r.apartment) == candidate.apartment,
                ConflictScope::Building => true,
            })
            .filter(|r| exclude != Some(&r.id))
            .collect()
    }

    pub fn validate<'a, I>(
        &self,
        candidate: &ReservationDraft,
        existing_for_scope: I,
    ) -> Result<ValidReservation, ValidationError>
    where
        I: IntoIterator<Item = &'a Reservation>,
    {
        let valid = complete(candidate)?;
        let hours = valid.hours;

        if let Some(max) = self.max_booking_hours
            && hours.hours() > max
        {
            return Err(ValidationError::DurationExceeded {
                hours: hours.hours(),
                max,
            });
        }

        for existing in existing_for_scope {
            if existing.hours().overlaps(&hours) {
                return Err(ValidationError::OverlapConflict(Box::new(existing.clone())));
            }
        }
        Ok(valid)
    }
}

fn text(field: &Option<String>) -> Option<String> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Completeness and chronology. Returns the normalized record.
fn complete(candidate: &ReservationDraft) -> Result<ValidReservation, ValidationError> {
    let name = text(&candidate.name);
    let phone = text(&candidate.phone);
    let purpose = text(&candidate.purpose);
    let apartment = candidate.apartment.filter(|n| *n > 0);

    let mut missing = Vec::new();
    if candidate.date.is_none() {
        missing.push("date");
    }
    if apartment.is_none() {
        missing.push("apartment");
    }
    if name.is_none() {
        missing.push("name");
    }
    if phone.is_none() {
        missing.push("phone");
    }
    if purpose.is_none() {
        missing.push("purpose");
    }
    if candidate.start_hour.is_none() {
        missing.push("startTime");
    }
    if candidate.end_hour.is_none() {
        missing.push("endTime");
    }
    if !candidate.accept_terms {
        missing.push("acceptTerms");
    }

    let (Some(date), Some(apartment), Some(name), Some(phone), Some(purpose), Some(start), Some(end)) = (
        candidate.date,
        apartment,
        name,
        phone,
        purpose,
        candidate.start_hour,
        candidate.end_hour,
    ) else {
        return Err(ValidationError::IncompleteFields { missing });
    };
    if !missing.is_empty() {
        return Err(ValidationError::IncompleteFields { missing });
    }

    if start >= HOURS_PER_DAY || end >= HOURS_PER_DAY || end <= start {
        return Err(ValidationError::InvalidTimeRange { start, end });
    }

    Ok(ValidReservation {
        date,
        apartment,
        hours: HourRange::new(start, end),
        name,
        phone,
        purpose,
    })
}
