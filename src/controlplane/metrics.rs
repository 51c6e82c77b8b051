//! Prometheus metrics
//!
//! - `freenas_iscsi_provisions_total{result}` - provisioning calls
//! - `freenas_iscsi_deprovisions_total{result}` - deprovisioning calls
//! - `freenas_iscsi_rollback_deletions_total{result}` - deletions issued while
//!   unwinding a failed provision

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_FAILURE: &str = "failure";

/// Provisioner counters and the registry they live in
pub struct ProvisionerMetrics {
    registry: Registry,
    provisions: IntCounterVec,
    deprovisions: IntCounterVec,
    rollback_deletions: IntCounterVec,
}

impl ProvisionerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let provisions = counter(
            &registry,
            "freenas_iscsi_provisions_total",
            "Provisioning calls by result",
        )?;
        let deprovisions = counter(
            &registry,
            "freenas_iscsi_deprovisions_total",
            "Deprovisioning calls by result",
        )?;
        let rollback_deletions = counter(
            &registry,
            "freenas_iscsi_rollback_deletions_total",
            "Rollback deletions by result",
        )?;

        Ok(Self {
            registry,
            provisions,
            deprovisions,
            rollback_deletions,
        })
    }

    pub fn record_provision(&self, ok: bool) {
        self.provisions.with_label_values(&[label(ok)]).inc();
    }

    pub fn record_deprovision(&self, ok: bool) {
        self.deprovisions.with_label_values(&[label(ok)]).inc();
    }

    pub fn record_rollback_deletion(&self, ok: bool) {
        self.rollback_deletions.with_label_values(&[label(ok)]).inc();
    }

    /// Current value of a provision counter
    pub fn provisions(&self, result: &str) -> u64 {
        self.provisions.with_label_values(&[result]).get()
    }

    pub fn deprovisions(&self, result: &str) -> u64 {
        self.deprovisions.with_label_values(&[result]).get()
    }

    pub fn rollback_deletions(&self, result: &str) -> u64 {
        self.rollback_deletions.with_label_values(&[result]).get()
    }

    /// Render every metric in the text exposition format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("failed to encode metrics: {}", e)))?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), &["result"])
        .map_err(|e| Error::Internal(format!("failed to create metric {}: {}", name, e)))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| Error::Internal(format!("failed to register metric {}: {}", name, e)))?;
    Ok(counter)
}

fn label(ok: bool) -> &'static str {
    if ok {
        RESULT_SUCCESS
    } else {
        RESULT_FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_encoding() {
        let metrics = ProvisionerMetrics::new().unwrap();
        metrics.record_provision(true);
        metrics.record_provision(false);
        metrics.record_provision(true);
        metrics.record_rollback_deletion(false);

        assert_eq!(metrics.provisions(RESULT_SUCCESS), 2);
        assert_eq!(metrics.provisions(RESULT_FAILURE), 1);
        assert_eq!(metrics.rollback_deletions(RESULT_FAILURE), 1);
        assert_eq!(metrics.deprovisions(RESULT_SUCCESS), 0);

        let (content_type, body) = metrics.encode().unwrap();
        assert!(content_type.starts_with("text/plain"));
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("freenas_iscsi_provisions_total{result=\"success\"} 2"));
    }
}
