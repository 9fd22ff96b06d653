use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    request_counter: Counter<u64>,
    sessions_started: Counter<u64>,
    session_outcomes: Counter<u64>,
    one_shot_duration: Histogram<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("stream_bridge");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let sessions_started = meter
            .u64_counter("bridge_sessions_started_total")
            .with_description("Bridged sessions started, per adapter")
            .build();

        let session_outcomes = meter
            .u64_counter("bridge_session_outcomes_total")
            .with_description("Bridged sessions finished, per adapter and outcome")
            .build();

        let boundaries = generate_boundaries((15, 30, 60, 500, 1000));

        let one_shot_duration = meter
            .u64_histogram("one_shot_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of one-shot inference sessions in milliseconds")
            .build();

        Ok(Metrics {
            request_counter,
            sessions_started,
            session_outcomes,
            one_shot_duration,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_session_started(&self, adapter: &'static str) {
        let attributes = vec![KeyValue::new("adapter", adapter)];
        self.sessions_started.add(1, &attributes);
    }

    pub fn record_session_outcome(&self, adapter: &'static str, outcome: &str) {
        let attributes = vec![
            KeyValue::new("adapter", adapter),
            KeyValue::new("outcome", outcome.to_string()),
        ];
        self.session_outcomes.add(1, &attributes);
    }

    pub fn record_one_shot_duration(&self, duration_ms: u64) {
        self.one_shot_duration.record(duration_ms, &[]);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 5;
    let end_step: usize = 40;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_boundaries() {
        let parts = (2, 22, 32, 72, 172);
        let get = generate_boundaries(parts);
        let expected = vec![2.0, 12.0, 22.0, 27.0, 32.0, 72.0, 172.0];

        assert_eq!(get, expected);
    }
}
