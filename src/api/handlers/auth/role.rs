//! Fixed role hierarchy: guest < user < moderator < admin.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;

use super::error::AuthError;

/// Variants are declared in privilege order so the derived `Ord` is the hierarchy.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    User,
    Moderator,
    Admin,
}

impl Role {
    pub const ALL: [Self; 4] = [Self::Guest, Self::User, Self::Moderator, Self::Admin];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::User => "user",
            Self::Moderator => "moderator",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub const fn ordinal(self) -> u8 {
        match self {
            Self::Guest => 0,
            Self::User => 1,
            Self::Moderator => 2,
            Self::Admin => 3,
        }
    }

    /// True when `self` is at least as privileged as `required`.
    #[must_use]
    pub const fn satisfies(self, required: Self) -> bool {
        self.ordinal() >= required.ordinal()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AuthError;

    /// Unknown names are a configuration fault, never the lowest privilege.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == value)
            .ok_or_else(|| AuthError::UnknownRole(value.to_string()))
    }
}
