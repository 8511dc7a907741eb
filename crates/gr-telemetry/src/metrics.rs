use dashmap::DashMap;

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Latency distribution. Observations land in the first bucket whose upper
/// bound covers them (plus an overflow slot); the cumulative counts the
/// exposition format wants are computed at export time, so recording is a
/// single slot increment under the map shard's lock.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    /// One slot per bound, plus the overflow slot at the end.
    slots: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    pub fn with_bounds(bounds: Vec<f64>) -> Self {
        let slots = vec![0; bounds.len() + 1];
        Self {
            bounds,
            slots,
            sum: 0.0,
            count: 0,
        }
    }

    pub fn observe(&mut self, value: f64) {
        let slot = self
            .bounds
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.bounds.len());
        self.slots[slot] += 1;
        self.sum += value;
        self.count += 1;
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// `(upper_bound, cumulative_count)` pairs, excluding +Inf.
    fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0u64;
        self.bounds
            .iter()
            .zip(&self.slots)
            .map(|(bound, slot)| {
                running += slot;
                (*bound, running)
            })
            .collect()
    }
}

fn latency_bounds() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
}

// ---------------------------------------------------------------------------
// Sample keys
// ---------------------------------------------------------------------------

/// Render a (name, labels) pair into its exposition-format sample name once
/// at write time. Labels are sorted so the same set always produces the
/// same key regardless of caller order.
fn sample_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut pairs: Vec<(&str, &str)> = labels.to_vec();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    let inner: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    format!("{name}{{{}}}", inner.join(","))
}

/// Whether a rendered sample belongs to `family`.
fn in_family(sample: &str, family: &str) -> bool {
    sample == family
        || (sample.len() > family.len()
            && sample.starts_with(family)
            && sample.as_bytes()[family.len()] == b'{')
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Process-wide metrics: counters with label sets, gauges, histograms.
///
/// Constructed once at startup and passed by reference — there is no global
/// instance. Storage is sharded maps keyed by rendered sample names; the
/// family index only exists so the Prometheus export can group samples and
/// emit `# TYPE` headers.
#[derive(Debug)]
pub struct MetricsCollector {
    counter_samples: DashMap<String, u64>,
    counter_families: DashMap<String, ()>,
    gauges: DashMap<String, i64>,
    histograms: DashMap<String, Histogram>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counter_samples: DashMap::new(),
            counter_families: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
        }
    }

    /// Collector pre-loaded with the standard greenroom latency families.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        for name in [
            "api_request_duration_seconds",
            "pipeline_turn_duration_seconds",
            "delivery_duration_seconds",
            "generation_duration_seconds",
        ] {
            collector
                .histograms
                .insert(name.to_string(), Histogram::with_bounds(latency_bounds()));
        }
        collector
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        self.counter_families.entry(name.to_string()).or_insert(());
        *self
            .counter_samples
            .entry(sample_key(name, labels))
            .or_insert(0) += amount;
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counter_samples
            .get(&sample_key(name, labels))
            .map(|v| *v)
            .unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, value: i64) {
        self.gauges.insert(name.to_string(), value);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        self.gauges.get(name).map(|v| *v).unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Record into a histogram, creating it with the latency bounds when it
    /// has not been pre-registered.
    pub fn record_histogram(&self, name: &str, value: f64) {
        self.histograms
            .entry(name.to_string())
            .or_insert_with(|| Histogram::with_bounds(latency_bounds()))
            .observe(value);
    }

    /// `(sum, count)` for a histogram, if it exists.
    pub fn histogram_stats(&self, name: &str) -> Option<(f64, u64)> {
        self.histograms.get(name).map(|h| (h.sum(), h.count()))
    }

    // -- Export -------------------------------------------------------------

    /// Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        let mut families: Vec<String> =
            self.counter_families.iter().map(|e| e.key().clone()).collect();
        families.sort();
        let samples: Vec<(String, u64)> = self
            .counter_samples
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        for family in families {
            out.push_str(&format!("# TYPE {family} counter\n"));
            let mut members: Vec<&(String, u64)> = samples
                .iter()
                .filter(|(sample, _)| in_family(sample, &family))
                .collect();
            members.sort_by(|a, b| a.0.cmp(&b.0));
            for (sample, value) in members {
                out.push_str(&format!("{sample} {value}\n"));
            }
        }

        let mut gauges: Vec<(String, i64)> = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        gauges.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in gauges {
            out.push_str(&format!("# TYPE {name} gauge\n"));
            out.push_str(&format!("{name} {value}\n"));
        }

        let mut histogram_names: Vec<String> =
            self.histograms.iter().map(|e| e.key().clone()).collect();
        histogram_names.sort();
        for name in histogram_names {
            let Some(histogram) = self.histograms.get(&name) else {
                continue;
            };
            out.push_str(&format!("# TYPE {name} histogram\n"));
            for (bound, cumulative) in histogram.cumulative() {
                out.push_str(&format!("{name}_bucket{{le=\"{bound}\"}} {cumulative}\n"));
            }
            out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", histogram.count()));
            out.push_str(&format!("{name}_sum {}\n", histogram.sum()));
            out.push_str(&format!("{name}_count {}\n", histogram.count()));
        }

        out
    }

    /// JSON snapshot of everything.
    pub fn export_json(&self) -> serde_json::Value {
        let mut counters = serde_json::Map::new();
        for entry in self.counter_samples.iter() {
            counters.insert(entry.key().clone(), serde_json::json!(*entry.value()));
        }

        let mut gauges = serde_json::Map::new();
        for entry in self.gauges.iter() {
            gauges.insert(entry.key().clone(), serde_json::json!(*entry.value()));
        }

        let mut histograms = serde_json::Map::new();
        for entry in self.histograms.iter() {
            histograms.insert(
                entry.key().clone(),
                serde_json::json!({
                    "sum": entry.value().sum(),
                    "count": entry.value().count(),
                }),
            );
        }

        serde_json::json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increment_with_labels() {
        let m = MetricsCollector::new();
        m.increment_counter("messages_total", &[("outcome", "delivered")]);
        m.increment_counter("messages_total", &[("outcome", "delivered")]);
        m.increment_counter("messages_total", &[("outcome", "diverted")]);

        assert_eq!(m.get_counter("messages_total", &[("outcome", "delivered")]), 2);
        assert_eq!(m.get_counter("messages_total", &[("outcome", "diverted")]), 1);
        assert_eq!(m.get_counter("messages_total", &[("outcome", "dropped")]), 0);
    }

    #[test]
    fn label_order_does_not_split_series() {
        let m = MetricsCollector::new();
        m.increment_counter("api_requests_total", &[("method", "GET"), ("status", "200")]);
        m.increment_counter("api_requests_total", &[("status", "200"), ("method", "GET")]);

        assert_eq!(
            m.get_counter("api_requests_total", &[("status", "200"), ("method", "GET")]),
            2
        );
    }

    #[test]
    fn gauge_set_and_overwrite() {
        let m = MetricsCollector::new();
        m.set_gauge("active_lanes", 4);
        assert_eq!(m.get_gauge("active_lanes"), 4);
        m.set_gauge("active_lanes", 2);
        assert_eq!(m.get_gauge("active_lanes"), 2);
    }

    #[test]
    fn histogram_records_sum_and_count() {
        let m = MetricsCollector::with_defaults();
        m.record_histogram("delivery_duration_seconds", 0.5);
        m.record_histogram("delivery_duration_seconds", 1.0);

        let (sum, count) = m.histogram_stats("delivery_duration_seconds").unwrap();
        assert_eq!(count, 2);
        assert!((sum - 1.5).abs() < 1e-9);
        assert!(m.histogram_stats("unknown").is_none());
    }

    #[test]
    fn histogram_buckets_accumulate_at_export() {
        let mut h = Histogram::with_bounds(vec![1.0, 5.0, 10.0]);
        h.observe(0.5);
        h.observe(0.7);
        h.observe(4.0);
        h.observe(100.0); // overflow slot

        let cumulative = h.cumulative();
        assert_eq!(cumulative, vec![(1.0, 2), (5.0, 3), (10.0, 3)]);
        assert_eq!(h.count(), 4);
    }

    #[test]
    fn prometheus_export_shape() {
        let m = MetricsCollector::new();
        m.increment_counter("backpressure_drop", &[("user", "u1")]);
        m.set_gauge("active_lanes", 1);
        m.record_histogram("api_request_duration_seconds", 0.1);

        let out = m.export_prometheus();
        assert!(out.contains("# TYPE backpressure_drop counter"));
        assert!(out.contains("backpressure_drop{user=\"u1\"} 1"));
        assert!(out.contains("# TYPE active_lanes gauge"));
        assert!(out.contains("active_lanes 1"));
        assert!(out.contains("# TYPE api_request_duration_seconds histogram"));
        assert!(out.contains("api_request_duration_seconds_bucket{le=\"+Inf\"} 1"));
        assert!(out.contains("api_request_duration_seconds_count 1"));
    }

    #[test]
    fn export_groups_samples_under_their_family() {
        let m = MetricsCollector::new();
        m.increment_counter("turns", &[("outcome", "staged")]);
        // A family sharing a prefix must not swallow the other's samples.
        m.increment_counter("turns_total", &[("outcome", "staged")]);

        let out = m.export_prometheus();
        let turns_header = out.find("# TYPE turns counter").unwrap();
        let turns_total_header = out.find("# TYPE turns_total counter").unwrap();
        assert!(turns_header < turns_total_header);
        assert!(out.contains("turns{outcome=\"staged\"} 1"));
        assert!(out.contains("turns_total{outcome=\"staged\"} 1"));
    }

    #[test]
    fn json_export_shape() {
        let m = MetricsCollector::new();
        m.increment_counter("messages_total", &[]);
        m.set_gauge("active_lanes", 3);

        let json = m.export_json();
        assert_eq!(json["gauges"]["active_lanes"], 3);
        assert_eq!(json["counters"]["messages_total"], 1);
    }
}
