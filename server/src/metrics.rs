use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

#[derive(Debug, Default)]
pub(crate) struct Metrics {
    pub connections_accepted: Counter,
    pub accept_failures: Counter,
    pub connections_drained: Counter,
    pub connections_failed: Counter,
    pub bytes_received: Counter,
    pub occupied_slots: Gauge,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "connections_accepted",
            "Number of connections accepted into a slot",
            metrics.connections_accepted.clone(),
        );
        registry.register(
            "accept_failures",
            "Number of accept attempts that failed",
            metrics.accept_failures.clone(),
        );
        registry.register(
            "connections_drained",
            "Number of connections drained until closed or idle",
            metrics.connections_drained.clone(),
        );
        registry.register(
            "connections_failed",
            "Number of connections dropped because of an error",
            metrics.connections_failed.clone(),
        );
        registry.register(
            "bytes_received",
            "Bytes received across all connections",
            metrics.bytes_received.clone(),
        );
        registry.register(
            "occupied_slots",
            "Number of slots holding a connection",
            metrics.occupied_slots.clone(),
        );
        metrics
    }
}
