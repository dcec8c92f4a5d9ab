use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Prometheus registry for query and operator metrics.
///
/// Series are labelled by `query_id`, so every executed query adds series
/// that stay until [`MetricsRegistry::forget_query`] drops them. Callers that
/// run many queries through one registry should forget each query once its
/// metrics were scraped.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    operator_rows_in: CounterVec,
    operator_rows_out: CounterVec,
    operator_batches_in: CounterVec,
    operator_batches_out: CounterVec,
    partitions_finished: CounterVec,
    queries_cancelled: CounterVec,
    execution_seconds: HistogramVec,
    /// Operator labels seen per query, for [`MetricsRegistry::forget_query`].
    operators: Mutex<HashMap<String, HashSet<String>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Account one batch delivery through an operator.
    pub fn record_operator(
        &self,
        query_id: &str,
        operator: &str,
        rows_in: u64,
        rows_out: u64,
        batches_out: u64,
    ) {
        self.track(query_id, operator);
        let labels = [query_id, operator];
        self.inner
            .operator_rows_in
            .with_label_values(&labels)
            .inc_by(rows_in as f64);
        self.inner
            .operator_rows_out
            .with_label_values(&labels)
            .inc_by(rows_out as f64);
        self.inner
            .operator_batches_in
            .with_label_values(&labels)
            .inc();
        self.inner
            .operator_batches_out
            .with_label_values(&labels)
            .inc_by(batches_out as f64);
    }

    /// Account an operator that emitted output outside of a batch delivery
    /// (the aggregate emits on completion).
    pub fn record_emit(&self, query_id: &str, operator: &str, rows_out: u64) {
        self.track(query_id, operator);
        let labels = [query_id, operator];
        self.inner
            .operator_rows_out
            .with_label_values(&labels)
            .inc_by(rows_out as f64);
        self.inner
            .operator_batches_out
            .with_label_values(&labels)
            .inc();
    }

    pub fn inc_partitions_finished(&self, query_id: &str) {
        self.inner
            .partitions_finished
            .with_label_values(&[query_id])
            .inc();
    }

    pub fn inc_cancelled(&self, query_id: &str) {
        self.inner
            .queries_cancelled
            .with_label_values(&[query_id])
            .inc();
    }

    pub fn observe_execution(&self, query_id: &str, secs: f64) {
        self.inner
            .execution_seconds
            .with_label_values(&[query_id])
            .observe(secs.max(0.0));
    }

    /// Drop every series labelled with `query_id`. Returns whether the query
    /// had recorded anything.
    pub fn forget_query(&self, query_id: &str) -> bool {
        let operators = match self.inner.operators.lock() {
            Ok(mut seen) => seen.remove(query_id).unwrap_or_default(),
            Err(_) => HashSet::new(),
        };
        let mut removed = false;
        for operator in &operators {
            let labels = [query_id, operator.as_str()];
            for counter in [
                &self.inner.operator_rows_in,
                &self.inner.operator_rows_out,
                &self.inner.operator_batches_in,
                &self.inner.operator_batches_out,
            ] {
                removed |= counter.remove_label_values(&labels).is_ok();
            }
        }
        for counter in [&self.inner.partitions_finished, &self.inner.queries_cancelled] {
            removed |= counter.remove_label_values(&[query_id]).is_ok();
        }
        removed |= self
            .inner
            .execution_seconds
            .remove_label_values(&[query_id])
            .is_ok();
        removed
    }

    fn track(&self, query_id: &str, operator: &str) {
        if let Ok(mut seen) = self.inner.operators.lock() {
            seen.entry(query_id.to_string())
                .or_default()
                .insert(operator.to_string());
        }
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let operator_rows_in = counter_vec(
            &registry,
            "strata_operator_rows_in_total",
            "Input rows processed per operator",
            &["query_id", "operator"],
        );
        let operator_rows_out = counter_vec(
            &registry,
            "strata_operator_rows_out_total",
            "Output rows produced per operator",
            &["query_id", "operator"],
        );
        let operator_batches_in = counter_vec(
            &registry,
            "strata_operator_batches_in_total",
            "Input batches processed per operator",
            &["query_id", "operator"],
        );
        let operator_batches_out = counter_vec(
            &registry,
            "strata_operator_batches_out_total",
            "Output batches produced per operator",
            &["query_id", "operator"],
        );
        let partitions_finished = counter_vec(
            &registry,
            "strata_partitions_finished_total",
            "Partition chain instances that signalled completion",
            &["query_id"],
        );
        let queries_cancelled = counter_vec(
            &registry,
            "strata_queries_cancelled_total",
            "Executions stopped by cancellation",
            &["query_id"],
        );
        let execution_seconds = histogram_vec(
            &registry,
            "strata_execution_seconds",
            "Wall time from scan start to completion",
            &["query_id"],
        );

        Self {
            registry,
            operator_rows_in,
            operator_rows_out,
            operator_batches_in,
            operator_batches_out,
            partitions_finished,
            queries_cancelled,
            execution_seconds,
            operators: Mutex::new(HashMap::new()),
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.record_operator("1", "Filter", 10, 4, 1);
        m.record_emit("1", "HashAggregate", 2);
        m.inc_partitions_finished("1");
        m.inc_cancelled("1");
        m.observe_execution("1", 0.01);
        let text = m.render_prometheus();

        assert!(text.contains("strata_operator_rows_in_total"));
        assert!(text.contains("strata_operator_rows_out_total"));
        assert!(text.contains("strata_operator_batches_in_total"));
        assert!(text.contains("strata_operator_batches_out_total"));
        assert!(text.contains("strata_partitions_finished_total"));
        assert!(text.contains("strata_queries_cancelled_total"));
        assert!(text.contains("strata_execution_seconds"));
        assert!(text.contains("HashAggregate"));
    }

    #[test]
    fn forgotten_queries_leave_no_series() {
        let m = MetricsRegistry::new();
        m.record_operator("7", "Filter#1[p0]", 3, 1, 1);
        m.record_emit("7", "HashAggregate#3", 1);
        m.inc_partitions_finished("7");
        m.observe_execution("7", 0.5);
        m.record_operator("8", "Filter#1[p0]", 1, 1, 1);

        assert!(m.forget_query("7"));
        let text = m.render_prometheus();
        assert!(!text.contains("query_id=\"7\""), "{text}");
        assert!(text.contains("query_id=\"8\""));
        assert!(!m.forget_query("7"));
    }
}
