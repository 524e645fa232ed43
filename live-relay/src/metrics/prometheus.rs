//! Prometheus metrics exporter.
//!
//! Exports metrics in Prometheus text format.

use std::sync::Arc;

use super::collector::MetricsCollector;

pub struct PrometheusExporter {
    collector: Arc<MetricsCollector>,
    namespace: String,
}

impl PrometheusExporter {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self::with_namespace(collector, "live_relay")
    }

    pub fn with_namespace(collector: Arc<MetricsCollector>, namespace: impl Into<String>) -> Self {
        Self {
            collector,
            namespace: namespace.into(),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let snapshot = self.collector.snapshot();
        let mut output = String::new();

        // Stream metrics
        let mut states: Vec<_> = snapshot.streams_by_state.iter().collect();
        states.sort();
        let mut total_streams = 0u64;
        for (state, count) in states {
            total_streams += count;
            self.write_gauge_with_labels(
                &mut output,
                "streams_by_state",
                "Number of streams by lifecycle state",
                *count as f64,
                &[("state", state)],
            );
        }
        self.write_gauge(
            &mut output,
            "streams_total",
            "Number of streams held in memory",
            total_streams as f64,
        );
        self.write_gauge(
            &mut output,
            "producers_active",
            "Number of registered producers",
            snapshot.producers_active as f64,
        );

        let mut faults: Vec<_> = snapshot.stream_faults.iter().collect();
        faults.sort();
        for (reason, count) in faults {
            self.write_counter_with_labels(
                &mut output,
                "stream_faults_total",
                "Faults reported by the health sweep",
                *count as f64,
                &[("reason", reason)],
            );
        }
        self.write_counter(
            &mut output,
            "streams_evicted_total",
            "Closed streams released from memory",
            snapshot.streams_evicted as f64,
        );
        self.write_counter(
            &mut output,
            "health_sweeps_total",
            "Completed health sweeps",
            snapshot.sweeps as f64,
        );

        // Ingest metrics
        self.write_gauge(
            &mut output,
            "ingest_processes",
            "Running ingest processes",
            snapshot.ingest_processes as f64,
        );
        self.write_gauge(
            &mut output,
            "ingest_processes_healthy",
            "Running ingest processes that are neither stalled nor exhausted",
            snapshot.ingest_processes_healthy as f64,
        );

        // Consumer metrics
        for (state, count) in [
            ("connecting", snapshot.consumers_connecting),
            ("connected", snapshot.consumers_connected),
        ] {
            self.write_gauge_with_labels(
                &mut output,
                "consumers",
                "Open viewer sessions by state",
                count as f64,
                &[("state", state)],
            );
        }
        self.write_gauge(
            &mut output,
            "consumers_closed",
            "Closed viewer sessions still tracked",
            snapshot.consumers_closed as f64,
        );

        // Per-stream metrics
        let mut streams: Vec<_> = snapshot.streams.iter().collect();
        streams.sort_by(|a, b| a.0.cmp(b.0));
        for (stream_id, gauges) in streams {
            let labels = [("stream_id", stream_id.as_str())];
            self.write_gauge_with_labels(
                &mut output,
                "stream_uptime_seconds",
                "Seconds since the stream went live",
                gauges.uptime_secs as f64,
                &labels,
            );
            self.write_gauge_with_labels(
                &mut output,
                "stream_bytes_per_second",
                "Ingest throughput",
                gauges.bytes_per_sec as f64,
                &labels,
            );
            self.write_counter_with_labels(
                &mut output,
                "stream_restarts_total",
                "Ingest process restarts",
                gauges.restarts as f64,
                &labels,
            );
            self.write_gauge_with_labels(
                &mut output,
                "active_consumers",
                "Open viewer sessions",
                gauges.consumers as f64,
                &labels,
            );
            self.write_gauge_with_labels(
                &mut output,
                "consumer_session_duration_ms",
                "Mean lifetime of closed viewer sessions",
                gauges.average_session_ms as f64,
                &labels,
            );
        }

        output
    }

    fn write_gauge(&self, output: &mut String, name: &str, help: &str, value: f64) {
        self.write_metric(output, name, help, "gauge", value, &[]);
    }

    fn write_gauge_with_labels(
        &self,
        output: &mut String,
        name: &str,
        help: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) {
        self.write_metric(output, name, help, "gauge", value, labels);
    }

    fn write_counter(&self, output: &mut String, name: &str, help: &str, value: f64) {
        self.write_metric(output, name, help, "counter", value, &[]);
    }

    fn write_counter_with_labels(
        &self,
        output: &mut String,
        name: &str,
        help: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) {
        self.write_metric(output, name, help, "counter", value, labels);
    }

    fn write_metric(
        &self,
        output: &mut String,
        name: &str,
        help: &str,
        kind: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) {
        let full_name = format!("{}_{}", self.namespace, name);
        // Labelled series share one header.
        let header = format!("# TYPE {} {}\n", full_name, kind);
        if !output.contains(&header) {
            output.push_str(&format!("# HELP {} {}\n", full_name, help));
            output.push_str(&header);
        }

        if labels.is_empty() {
            output.push_str(&format!("{} {}\n", full_name, value));
            return;
        }
        let labels_str = labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
            .collect::<Vec<_>>()
            .join(",");
        output.push_str(&format!("{}{{{}}} {}\n", full_name, labels_str, value));
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::domain::{ReasonCode, StreamState};
    use crate::metrics::StreamGauges;

    #[test]
    fn test_prometheus_export_empty() {
        let collector = Arc::new(MetricsCollector::new());
        let output = PrometheusExporter::new(collector).export();

        assert!(output.contains("# HELP live_relay_streams_total"));
        assert!(output.contains("# TYPE live_relay_streams_total gauge"));
        assert!(output.contains("live_relay_streams_total 0"));
        assert!(output.contains("live_relay_streams_by_state{state=\"LIVE\"} 0"));
    }

    #[test]
    fn test_prometheus_export_with_data() {
        let collector = Arc::new(MetricsCollector::new());
        collector.set_streams_by_state(&HashMap::from([
            (StreamState::Live, 2),
            (StreamState::Error, 1),
        ]));
        collector.record_fault(ReasonCode::StalledSource);
        collector.set_stream(
            "cam-1",
            StreamGauges {
                uptime_secs: 30,
                consumers: 3,
                ..Default::default()
            },
        );

        let output = PrometheusExporter::new(collector).export();

        assert!(output.contains("live_relay_streams_total 3"));
        assert!(output.contains("live_relay_streams_by_state{state=\"ERROR\"} 1"));
        assert!(output.contains("live_relay_stream_faults_total{reason=\"stalled_source\"} 1"));
        assert!(output.contains("live_relay_stream_uptime_seconds{stream_id=\"cam-1\"} 30"));
        assert!(output.contains("live_relay_active_consumers{stream_id=\"cam-1\"} 3"));
    }

    #[test]
    fn test_labelled_series_share_one_header() {
        let collector = Arc::new(MetricsCollector::new());
        let output = PrometheusExporter::new(collector).export();

        assert_eq!(
            output
                .matches("# TYPE live_relay_streams_by_state gauge")
                .count(),
            1
        );
        assert_eq!(
            output
                .lines()
                .filter(|l| l.starts_with("live_relay_streams_by_state{"))
                .count(),
            StreamState::ALL.len()
        );
    }

    #[test]
    fn test_label_values_are_escaped() {
        assert_eq!(escape_label("a\"b\\c"), "a\\\"b\\\\c");
    }

    #[test]
    fn test_prometheus_custom_namespace() {
        let collector = Arc::new(MetricsCollector::new());
        let output = PrometheusExporter::with_namespace(collector, "custom").export();

        assert!(output.contains("custom_streams_total"));
        assert!(!output.contains("live_relay_"));
    }
}
