use crate::SharedStore;
use cluster_agent_core::DeltaKind;
use parking_lot::RwLock;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric},
    metrics::{counter::Counter, family::Family, gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct WatchMetrics {
    events: Family<EventLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct EventLabels {
    kind: String,
    event: &'static str,
}

/// Exposes the size of every registered store.
#[derive(Clone, Debug, Default)]
pub struct StoreSizes(Arc<RwLock<Vec<SharedStore>>>);

// === impl WatchMetrics ===

impl WatchMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let events = Family::<EventLabels, Counter>::default();
        reg.register(
            "watch_events",
            "Total number of changes observed on watched resources",
            events.clone(),
        );
        Self { events }
    }

    pub(crate) fn observe(&self, kind: &str, event: DeltaKind) {
        self.events
            .get_or_create(&EventLabels {
                kind: kind.to_string(),
                event: event.as_str(),
            })
            .inc();
    }
}

// === impl StoreSizes ===

impl StoreSizes {
    pub fn register(reg: &mut Registry) -> Self {
        let sizes = Self::default();
        reg.register_collector(Box::new(sizes.clone()));
        sizes
    }

    pub fn track(&self, store: SharedStore) {
        self.0.write().push(store);
    }
}

impl Collector for StoreSizes {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let stores = self.0.read();

        let mut objects_encoder = encoder.encode_descriptor(
            "watched_objects",
            "The number of objects cached for each watched kind",
            None,
            MetricType::Gauge,
        )?;
        for store in stores.iter() {
            let store = store.read();
            let labels = [("kind", store.kind())];
            let objects = ConstGauge::new(store.len() as u32);
            let objects_encoder = objects_encoder.encode_family(&labels)?;
            objects.encode(objects_encoder)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KindStore;

    #[test]
    fn encodes_events_and_sizes() {
        let mut reg = Registry::with_prefix("agent");
        let metrics = WatchMetrics::register(&mut reg);
        let sizes = StoreSizes::register(&mut reg);
        sizes.track(KindStore::shared("rollouts"));

        metrics.observe("rollouts", DeltaKind::Added);
        metrics.observe("rollouts", DeltaKind::Added);

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &reg).expect("encodes");
        assert!(
            out.contains(r#"agent_watch_events_total{kind="rollouts",event="added"} 2"#),
            "{out}"
        );
        assert!(
            out.contains(r#"agent_watched_objects{kind="rollouts"} 0"#),
            "{out}"
        );
    }
}
