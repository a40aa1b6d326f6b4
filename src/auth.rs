use serde::{Deserialize, Serialize};

use crate::settings::{AccessCode, SystemSettings};

/// What a session may do, decided once by the code it entered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// View the calendar and create reservations.
    Resident,
    /// Everything a resident can do, plus editing and deleting reservations and
    /// changing settings.
    Admin,
}

impl Role {
    pub fn can_manage(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// Match a submitted code against the configured ones. The admin code wins if
/// both happen to be equal.
pub fn authenticate(code: AccessCode, settings: &SystemSettings) -> Option<Role> {
    if code == settings.admin_code {
        Some(Role::Admin)
    } else if code == settings.access_code {
        Some(Role::Resident)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_roles() {
        let settings = SystemSettings::default();
        assert_eq!(authenticate(AccessCode::new(4334), &settings), Some(Role::Resident));
        assert_eq!(authenticate(AccessCode::new(3266), &settings), Some(Role::Admin));
        assert_eq!(authenticate(AccessCode::new(1111), &settings), None);
    }

    #[test]
    fn string_and_numeric_codes_compare_equal() {
        let settings = SystemSettings::default();
        let typed = AccessCode::parse("4334").unwrap();
        assert_eq!(authenticate(typed, &settings), Some(Role::Resident));
    }

    #[test]
    fn only_admin_manages() {
        assert!(Role::Admin.can_manage());
        assert!(!Role::Resident.can_manage());
    }
}
