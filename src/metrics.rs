//! Prometheus metrics for refresh cycles.
//!
//! Instruments are looked up on the global meter provider. Until
//! [`initialize_metrics`] is called they are no-ops.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::{new_view, Aggregation, Instrument, MeterProvider, Stream};
use prometheus::{default_registry, Encoder, TextEncoder};

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub fn initialize_metrics() -> opentelemetry::metrics::Result<()> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("zipagg")
        .build()?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(new_view(
            Instrument::new().name("*duration*"), // Must match histogram name
            Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                boundaries: vec![
                    0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5,
                    5.0, 7.5, 10.0,
                ],
                record_min_max: true,
            }),
        )?)
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Prometheus text exposition of everything registered so far.
pub fn render() -> prometheus::Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&default_registry().gather(), &mut buf)?;
    String::from_utf8(buf).map_err(|err| prometheus::Error::Msg(err.to_string()))
}

/// Instruments recorded by one refresh cycle.
pub(crate) struct CycleMetrics {
    pub(crate) areas_tagged: Counter<u64>,
    pub(crate) areas_incorporated: Counter<u64>,
    pub(crate) groups_merged: Counter<u64>,
    pub(crate) summaries_written: Counter<u64>,
    pub(crate) refresh_duration: Histogram<f64>,
}

impl CycleMetrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter("zipagg");
        Self {
            areas_tagged: meter
                .u64_counter("areas_tagged")
                .with_description("number of raw areas stamped with a modification time")
                .init(),
            areas_incorporated: meter
                .u64_counter("areas_incorporated")
                .with_description("number of new areas merged into city groups")
                .init(),
            groups_merged: meter
                .u64_counter("groups_merged")
                .with_description("number of existing groups a batch was merged into")
                .init(),
            summaries_written: meter
                .u64_counter("summaries_written")
                .with_description("number of summaries overwritten")
                .init(),
            refresh_duration: meter
                .f64_histogram("refresh_duration_seconds")
                .with_description("refresh cycle duration in seconds")
                .init(),
        }
    }
}

pub(crate) fn level_labels(level: &'static str) -> [KeyValue; 1] {
    [KeyValue::new("level", level)]
}

pub(crate) fn summary_labels(level: &'static str, view: &'static str) -> [KeyValue; 2] {
    [KeyValue::new("level", level), KeyValue::new("view", view)]
}

#[test]
fn recorded_counters_are_rendered() {
    initialize_metrics().unwrap();
    let metrics = CycleMetrics::new();
    metrics.areas_tagged.add(3, &[]);
    metrics
        .summaries_written
        .add(2, &summary_labels("city", "incremental"));

    let text = render().unwrap();
    assert!(text.contains("zipagg_areas_tagged"), "{text}");
    assert!(text.contains(r#"view="incremental""#), "{text}");
}

#[test]
fn failed_body_is_still_timed() {
    use opentelemetry::metrics::MeterProvider as _;
    use prometheus::Registry;

    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .unwrap();
    let provider = MeterProvider::builder().with_reader(exporter).build();
    let histogram = provider
        .meter("zipagg_test")
        .f64_histogram("failing_duration_seconds")
        .init();
    let labels = [KeyValue::new("view", "incremental")];

    let res: Result<(), &str> = with_timer!(histogram, labels, Err("commit failed"));
    assert!(res.is_err());

    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    let count = text
        .lines()
        .find(|line| line.starts_with("failing_duration_seconds_count"))
        .unwrap_or_else(|| panic!("{text}"));
    assert!(count.ends_with(" 1"), "{text}");
}
