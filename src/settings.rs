use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::limits::*;
use crate::model::lenient;
use crate::store::{DocumentStore, StoreError};

/// Store path of the settings singleton.
pub const SETTINGS_PATH: &str = "settings";

/// Numeric entry code. Codes arrive as strings or numbers and are always
/// compared as numbers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AccessCode(u32);

impl AccessCode {
    pub fn new(code: u32) -> Self {
        Self(code)
    }

    /// Parse a code typed by a user. Surrounding whitespace is ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse().ok().map(Self)
    }
}

// Codes are secrets; keep them out of logs.
impl fmt::Debug for AccessCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessCode(****)")
    }
}

impl<'de> Deserialize<'de> for AccessCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        lenient::number(deserializer).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSettings {
    #[serde(default)]
    pub title: String,
    pub access_code: AccessCode,
    pub admin_code: AccessCode,
    /// Longest allowed reservation in hours. `None` means no cap; `Some(0)` is a cap.
    #[serde(
        default,
        deserialize_with = "lenient::opt_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_booking_hours: Option<u32>,
    #[serde(default, alias = "regulationsText")]
    pub regulations: String,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            title: "Residents Room".to_string(),
            access_code: AccessCode(4334),
            admin_code: AccessCode(3266),
            max_booking_hours: Some(12),
            regulations: "The room is reserved for the private use of building residents. \
                          Leave it clean and tidy after use."
                .to_string(),
        }
    }
}

/// Partial settings change. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub access_code: Option<AccessCode>,
    #[serde(default)]
    pub admin_code: Option<AccessCode>,
    /// `Some(None)` removes the cap.
    #[serde(default, deserialize_with = "nullable_number")]
    pub max_booking_hours: Option<Option<u32>>,
    #[serde(default)]
    pub regulations: Option<String>,
}

fn nullable_number<'de, D>(deserializer: D) -> Result<Option<Option<u32>>, D::Error>
where
    D: Deserializer<'de>,
{
    lenient::opt_number(deserializer).map(Some)
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn check(&self) -> Result<(), SettingsError> {
        if let Some(ref t) = self.title
            && t.len() > MAX_TITLE_LEN
        {
            return Err(SettingsError::Invalid("title too long"));
        }
        if let Some(ref r) = self.regulations
            && r.len() > MAX_REGULATIONS_LEN
        {
            return Err(SettingsError::Invalid("regulations too long"));
        }
        if let Some(Some(hours)) = self.max_booking_hours
            && hours > HOURS_PER_DAY
        {
            return Err(SettingsError::Invalid("maxBookingHours longer than a day"));
        }
        if let (Some(access), Some(admin)) = (self.access_code, self.admin_code)
            && access == admin
        {
            return Err(SettingsError::Invalid("access and admin codes must differ"));
        }
        Ok(())
    }

    fn to_partial(&self) -> Map<String, Value> {
        let mut partial = Map::new();
        if let Some(ref t) = self.title {
            partial.insert("title".into(), Value::from(t.clone()));
        }
        if let Some(code) = self.access_code {
            partial.insert("accessCode".into(), Value::from(code.0));
        }
        if let Some(code) = self.admin_code {
            partial.insert("adminCode".into(), Value::from(code.0));
        }
        if let Some(cap) = self.max_booking_hours {
            partial.insert("maxBookingHours".into(), cap.map_or(Value::Null, Value::from));
        }
        if let Some(ref r) = self.regulations {
            partial.insert("regulations".into(), Value::from(r.clone()));
        }
        partial
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid settings: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reads and writes the settings singleton. Writes are last-write-wins.
pub struct SettingsService<S> {
    store: Arc<S>,
}

impl<S> Clone for SettingsService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: DocumentStore> SettingsService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Current settings. Seeds the defaults the first time the store has none.
    pub async fn load(&self) -> Result<SystemSettings, SettingsError> {
        match self.store.get(SETTINGS_PATH).await? {
            Some(value) => Ok(serde_json::from_value(value).map_err(StoreError::from)?),
            None => {
                let defaults = SystemSettings::default();
                let value = serde_json::to_value(&defaults).map_err(StoreError::from)?;
                self.store.set(SETTINGS_PATH, value).await?;
                info!("seeded default settings");
                Ok(defaults)
            }
        }
    }

    /// Merge `patch` into the stored settings and return the result.
    pub async fn update(&self, patch: SettingsPatch) -> Result<SystemSettings, SettingsError> {
        patch.check()?;
        let current = self.load().await?;
        let access = patch.access_code.unwrap_or(current.access_code);
        let admin = patch.admin_code.unwrap_or(current.admin_code);
        if access == admin {
            return Err(SettingsError::Invalid("access and admin codes must differ"));
        }
        if !patch.is_empty() {
            self.store.update(SETTINGS_PATH, patch.to_partial()).await?;
            info!("settings updated");
        }
        self.load().await
    }
}
