//! Access-control entities: the requesting principal and tag/role rules.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Authenticated identity handed to the core by the identity source.
///
/// No authentication happens here; whatever the upstream hands us is trusted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub role: String,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
        }
    }
}

/// Principals holding `role` may read any file carrying `tag`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccessRule {
    pub tag: String,
    pub role: String,
}

impl fmt::Display for AccessRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag, self.role)
    }
}

impl FromStr for AccessRule {
    type Err = String;

    /// Parse the `TAG:ROLE` form used on the command line.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, role) = s
            .split_once(':')
            .ok_or_else(|| format!("access rule `{}` must look like TAG:ROLE", s))?;
        let (tag, role) = (tag.trim(), role.trim());
        if tag.is_empty() || role.is_empty() {
            return Err(format!("access rule `{}` has an empty tag or role", s));
        }
        Ok(Self {
            tag: tag.to_string(),
            role: role.to_string(),
        })
    }
}
