//! Credential validation against the node registry

use crate::common::error::AuthError;
use crate::protocol::Credential;
use crate::protocol::trojan::password_hash;
use crate::registry::{NodeRecord, NodeStore};
use edgetunnel_core::tracing::metrics::counter;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Validates credentials against a [`NodeStore`]
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn NodeStore>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    /// Find the record `credential` belongs to
    ///
    /// A store failure is reported as [`AuthError::StoreUnavailable`], never
    /// as `Invalid`.
    pub async fn authenticate(&self, credential: &Credential) -> Result<NodeRecord, AuthError> {
        if is_empty(credential) {
            counter("tunnel_auth_failures_total").increment();
            return Err(AuthError::Invalid);
        }

        let records = self.store.list().await.map_err(|e| {
            warn!("Node registry unavailable during authentication: {}", e);
            AuthError::from(e)
        })?;

        match records.into_iter().find(|r| credential_matches(credential, &r.identifier)) {
            Some(record) => {
                debug!(node = %record.display_name, "Credential accepted");
                Ok(record)
            }
            None => {
                debug!(credential = ?credential, "Credential rejected");
                counter("tunnel_auth_failures_total").increment();
                Err(AuthError::Invalid)
            }
        }
    }
}

fn is_empty(credential: &Credential) -> bool {
    match credential {
        Credential::Uuid(id) => id.is_nil(),
        Credential::PasswordHash(hash) => hash.is_empty(),
        Credential::Token(token) => token.trim().is_empty(),
    }
}

fn credential_matches(credential: &Credential, identifier: &str) -> bool {
    if identifier.is_empty() {
        return false;
    }
    match credential {
        Credential::Uuid(id) => Uuid::parse_str(identifier).is_ok_and(|stored| stored == *id),
        Credential::PasswordHash(hash) => {
            constant_time_eq(password_hash(identifier).as_bytes(), hash.as_bytes())
        }
        Credential::Token(token) => {
            token == identifier
                || matches!(
                    (Uuid::parse_str(token), Uuid::parse_str(identifier)),
                    (Ok(a), Ok(b)) if a == b
                )
        }
    }
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
