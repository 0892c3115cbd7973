use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static PIPELINE_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static POLICY_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static EXECUTION_DURATION_SECONDS: OnceLock<Histogram> = OnceLock::new();
static LINEAGE_FAILURES_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static SUPPRESSED_GROUPS_TOTAL: OnceLock<IntCounter> = OnceLock::new();

const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "vba_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create vba_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "vba_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(DURATION_BUCKETS.to_vec()),
                &["route", "method", "outcome"],
            )
            .expect("create vba_gateway_http_request_duration_seconds"),
        )
    })
}

fn pipeline_outcomes_total() -> &'static IntCounterVec {
    PIPELINE_OUTCOMES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "vba_pipeline_outcomes_total",
                    "Query pipeline terminal outcomes.",
                ),
                &["outcome"],
            )
            .expect("create vba_pipeline_outcomes_total"),
        )
    })
}

fn policy_decisions_total() -> &'static IntCounterVec {
    POLICY_DECISIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("vba_policy_decisions_total", "Policy decisions by result."),
                &["result"],
            )
            .expect("create vba_policy_decisions_total"),
        )
    })
}

fn execution_duration_seconds() -> &'static Histogram {
    EXECUTION_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            Histogram::with_opts(
                HistogramOpts::new(
                    "vba_execution_duration_seconds",
                    "Warehouse execution time per request in seconds.",
                )
                .buckets(DURATION_BUCKETS.to_vec()),
            )
            .expect("create vba_execution_duration_seconds"),
        )
    })
}

fn lineage_failures_total() -> &'static IntCounter {
    LINEAGE_FAILURES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "vba_lineage_failures_total",
                "Lineage events that could not be delivered.",
            )
            .expect("create vba_lineage_failures_total"),
        )
    })
}

fn suppressed_groups_total() -> &'static IntCounter {
    SUPPRESSED_GROUPS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "vba_suppressed_groups_total",
                "Result groups withheld by the minimum group size.",
            )
            .expect("create vba_suppressed_groups_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_outcome(outcome: &str) {
    pipeline_outcomes_total().with_label_values(&[outcome]).inc();
}

pub fn observe_policy_decision(result: &str) {
    policy_decisions_total().with_label_values(&[result]).inc();
}

pub fn observe_execution(duration: Duration) {
    execution_duration_seconds().observe(duration.as_secs_f64());
}

pub fn inc_lineage_failure() {
    lineage_failures_total().inc();
}

pub fn add_suppressed_groups(count: u64) {
    suppressed_groups_total().inc_by(count);
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = lineage_failures_total();
    let _ = suppressed_groups_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_exposes_pipeline_collectors() {
        observe_outcome("DENIED");
        observe_policy_decision("DENY");
        observe_http_request("/v1/queries", "POST", 403, Duration::from_millis(3));

        let (body, content_type) = render().expect("render");
        let text = String::from_utf8(body).expect("utf8");
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("vba_pipeline_outcomes_total{outcome=\"DENIED\"}"));
        assert!(text.contains("vba_policy_decisions_total{result=\"DENY\"}"));
        assert!(text.contains("vba_lineage_failures_total"));
        assert!(text.contains("vba_suppressed_groups_total"));
    }
}
