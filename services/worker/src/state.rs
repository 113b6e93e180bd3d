//! Application state shared across request handlers.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use amp_store::StateStore;

use crate::custodian::TokenCustodian;
use crate::reconciler::Reconciler;

/// Shared application state.
///
/// Passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<StateStore>,
    reconciler: Arc<Reconciler>,
    custodian: Arc<TokenCustodian>,
    service_token_hash: [u8; 32],
}

impl AppState {
    /// Create a new application state.
    pub fn new(
        store: Arc<StateStore>,
        reconciler: Arc<Reconciler>,
        custodian: Arc<TokenCustodian>,
        service_token: &str,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                store,
                reconciler,
                custodian,
                service_token_hash: Sha256::digest(service_token.as_bytes()).into(),
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    pub fn custodian(&self) -> &TokenCustodian {
        &self.inner.custodian
    }

    /// Check a presented bearer token against the configured one.
    ///
    /// Both sides are hashed first so the comparison does not leak
    /// length or prefix timing.
    pub fn verify_service_token(&self, presented: &str) -> bool {
        let presented: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        presented == self.inner.service_token_hash
    }
}
