use std::sync::Arc;

use prometheus_client::{encoding::text::encode, registry::Registry};

use super::Metrics;

#[derive(Clone)]
pub struct Exporter {
    registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Exporter {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("reloader");
        let metrics = Arc::new(Metrics::new(&mut registry));
        Exporter {
            registry: Arc::new(registry),
            metrics,
        }
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for Exporter {
    fn default() -> Self {
        Exporter::new()
    }
}
