//! Custodian Registry
//!
//! Process-wide directory of resilient custodian wrappers keyed by
//! connector code. Breaker state lives here, per connector, guarded by
//! each breaker's own atomic transition - there is no single global lock.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use super::breaker::BreakerSnapshot;
use super::connector::CustodianConnector;
use super::error::ResilienceError;
use super::resilient::ResilientCustodian;
use crate::config::ResilienceConfig;

static GLOBAL: Lazy<CustodianRegistry> = Lazy::new(CustodianRegistry::new);

/// Registry of configured custodians
#[derive(Default)]
pub struct CustodianRegistry {
    entries: DashMap<String, Arc<ResilientCustodian>>,
}

impl CustodianRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// The process-wide registry
    pub fn global() -> &'static CustodianRegistry {
        &GLOBAL
    }

    /// Wrap and register a connector. Replaces any previous registration
    /// for the same code (and its breaker state).
    pub fn register(
        &self,
        connector: Arc<dyn CustodianConnector>,
        config: &ResilienceConfig,
    ) -> Arc<ResilientCustodian> {
        let code = connector.code().to_string();
        let resilient = Arc::new(ResilientCustodian::new(connector, config));
        self.entries.insert(code.clone(), resilient.clone());
        tracing::info!(connector = %code, "Custodian registered");
        resilient
    }

    pub fn get(&self, code: &str) -> Result<Arc<ResilientCustodian>, ResilienceError> {
        self.entries
            .get(code)
            .map(|e| e.value().clone())
            .ok_or_else(|| ResilienceError::UnknownCustodian(code.to_string()))
    }

    pub fn codes(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Breaker snapshots for the monitoring surface
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.entries.iter().map(|e| e.value().snapshot()).collect()
    }

    /// Replay deferred writes on every custodian whose breaker is closed
    pub async fn replay_all_deferred(&self) -> usize {
        let custodians: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        let mut total = 0;
        for custodian in custodians {
            match custodian.replay_deferred().await {
                Ok(n) => total += n,
                Err(e) => {
                    tracing::error!(
                        connector = custodian.code(),
                        error = %e,
                        "Deferred replay failed"
                    );
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custodian::breaker::CircuitState;
    use crate::custodian::connector::mock::MockConnector;

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = CustodianRegistry::new();
        registry.register(Arc::new(MockConnector::new("fnb")), &ResilienceConfig::default());

        assert!(registry.get("fnb").is_ok());
        assert!(matches!(
            registry.get("nope"),
            Err(ResilienceError::UnknownCustodian(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshots_expose_state() {
        let registry = CustodianRegistry::new();
        registry.register(Arc::new(MockConnector::new("a")), &ResilienceConfig::default());
        registry.register(Arc::new(MockConnector::new("b")), &ResilienceConfig::default());

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.iter().all(|s| s.state == CircuitState::Closed));
    }
}
