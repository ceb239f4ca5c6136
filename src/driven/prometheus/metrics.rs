use anyhow::Result as AnyhowResult;
use prometheus::{opts, IntCounterVec, Registry};

pub struct MetricsDriven {
    registry: Registry,
    pub signing_key_operations: IntCounterVec,
}

impl MetricsDriven {
    pub fn new() -> AnyhowResult<Self> {
        let registry = Registry::default();

        let signing_key_operations = IntCounterVec::new(
            opts!(
                "keyward_signing_key_operations_total",
                "signing key lifecycle operations",
            ),
            &["operation", "result"],
        )?;
        registry.register(Box::new(signing_key_operations.clone()))?;

        Ok(Self {
            registry,
            signing_key_operations,
        })
    }

    pub fn metrics_collected(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    pub fn signing_key_operation(&self, operation: &str, result: &str) {
        self.signing_key_operations
            .with_label_values(&[operation, result])
            .inc()
    }
}
