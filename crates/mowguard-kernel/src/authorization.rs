//! [`BladeAuthorization`] – explicit operator grants for running the blade.
//!
//! Blade enable commands must carry a token granted here. A grant may also
//! permit running the blade while the drive motors are active; without it
//! the blade only starts on a stationary mower.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What a blade token allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BladeGrant {
    /// Who the token was issued to, for logs.
    pub operator: String,
    #[serde(default)]
    pub allow_while_driving: bool,
}

/// Token → grant table.
///
/// # Example
///
/// ```
/// use mowguard_kernel::authorization::{BladeAuthorization, BladeGrant};
///
/// let mut auth = BladeAuthorization::new();
/// auth.grant("s3cret", BladeGrant { operator: "alice".into(), allow_while_driving: false });
///
/// assert!(auth.check("s3cret").is_some());
/// assert!(auth.check("guess").is_none());
/// ```
#[derive(Debug, Default, Clone)]
pub struct BladeAuthorization {
    grants: HashMap<String, BladeGrant>,
}

impl BladeAuthorization {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `token`. Re-granting replaces the previous grant.
    pub fn grant(&mut self, token: &str, grant: BladeGrant) {
        self.grants.insert(token.to_string(), grant);
    }

    /// Revoke `token`. No-op for unknown tokens.
    pub fn revoke(&mut self, token: &str) {
        self.grants.remove(token);
    }

    /// The grant behind `token`, if any. Empty tokens never match.
    pub fn check(&self, token: &str) -> Option<&BladeGrant> {
        if token.is_empty() {
            return None;
        }
        self.grants.get(token)
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}
