//! Worker identity slots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::WorkerId;

/// A pre-provisioned worker identity.
///
/// Leased iff `instance_token` and `lease_until` are both set. A lease whose
/// `lease_until` has passed is free for the taking even before maintenance
/// clears it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSlot {
    pub id: WorkerId,
    pub instance_token: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl WorkerSlot {
    pub fn free(id: WorkerId) -> Self {
        Self {
            id,
            instance_token: None,
            lease_until: None,
            heartbeat_at: None,
        }
    }

    pub fn is_free_at(&self, now: DateTime<Utc>) -> bool {
        self.instance_token.is_none() || self.lease_until.is_none_or(|until| until <= now)
    }

    pub fn is_held_by(&self, token: &str) -> bool {
        self.instance_token.as_deref() == Some(token)
    }

    pub fn lease(&mut self, token: &str, lease_until: DateTime<Utc>, now: DateTime<Utc>) {
        self.instance_token = Some(token.to_owned());
        self.lease_until = Some(lease_until);
        self.heartbeat_at = Some(now);
    }

    /// Extend the lease. A non-matching token changes nothing.
    pub fn heartbeat(&mut self, token: &str, lease_until: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if !self.is_held_by(token) {
            return false;
        }
        self.lease_until = Some(lease_until);
        self.heartbeat_at = Some(now);
        true
    }

    /// Give the slot back. A non-matching token changes nothing.
    pub fn release(&mut self, token: &str) -> bool {
        if !self.is_held_by(token) {
            return false;
        }
        self.clear();
        true
    }

    pub fn lease_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.instance_token.is_some() && self.lease_until.is_some_and(|until| until <= now)
    }

    pub fn clear(&mut self) {
        self.instance_token = None;
        self.lease_until = None;
    }
}
