use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct OutboxMetrics {
    pub emitted: IntCounter,
    pub delivered: IntCounter,
    pub listener_failures: IntCounter,
    pub dead_lettered: IntCounter,
    pub in_flight: IntGauge,
}

impl OutboxMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let emitted = IntCounter::with_opts(
            Opts::new("outbox_emitted_total", "Total outbox records committed")
                .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_emitted_total");

        let delivered = IntCounter::with_opts(
            Opts::new(
                "outbox_delivered_total",
                "Total successful per-listener deliveries",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_delivered_total");

        let listener_failures = IntCounter::with_opts(
            Opts::new(
                "outbox_listener_failures_total",
                "Total failed or timed-out listener invocations",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_listener_failures_total");

        let dead_lettered = IntCounter::with_opts(
            Opts::new(
                "outbox_dead_lettered_total",
                "Total records that exhausted their retry budget",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_dead_lettered_total");

        let in_flight = IntGauge::with_opts(
            Opts::new(
                "outbox_in_flight_dispatches",
                "Record dispatches currently running",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_in_flight_dispatches");

        for metric in [
            Box::new(emitted.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(delivered.clone()),
            Box::new(listener_failures.clone()),
            Box::new(dead_lettered.clone()),
            Box::new(in_flight.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register outbox metric: {}", e);
            }
        }

        Self {
            emitted,
            delivered,
            listener_failures,
            dead_lettered,
            in_flight,
        }
    }
}
