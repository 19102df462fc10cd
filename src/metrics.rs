use prometheus::{Encoder as _, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

const LATENCY_BUCKETS_MS: &[f64] = &[
    0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// Processed/succeeded/failed counters plus an elapsed-time histogram, the
/// shape shared by the RPC side and the replay side.
#[derive(Debug, Clone)]
pub struct OutcomeMetrics {
    pub processed: IntCounter,
    pub succeeded: IntCounter,
    pub failed: IntCounter,
    pub elapsed_ms: Histogram,
}

impl OutcomeMetrics {
    fn register(registry: &Registry, prefix: &str, what: &str) -> prometheus::Result<Self> {
        let processed = IntCounter::new(
            format!("{prefix}_processed_total"),
            format!("Total {what} processed"),
        )?;
        let succeeded = IntCounter::new(
            format!("{prefix}_processed_succ"),
            format!("Total {what} processed successfully"),
        )?;
        let failed = IntCounter::new(
            format!("{prefix}_processed_fail"),
            format!("Total {what} that failed"),
        )?;
        let elapsed_ms = Histogram::with_opts(
            HistogramOpts::new(
                format!("{prefix}_process_time_ms"),
                format!("Time spent processing {what} in milliseconds"),
            )
            .buckets(LATENCY_BUCKETS_MS.to_vec()),
        )?;

        registry.register(Box::new(processed.clone()))?;
        registry.register(Box::new(succeeded.clone()))?;
        registry.register(Box::new(failed.clone()))?;
        registry.register(Box::new(elapsed_ms.clone()))?;

        Ok(Self {
            processed,
            succeeded,
            failed,
            elapsed_ms,
        })
    }

    pub fn observe(&self, ok: bool, elapsed_ms: f64) {
        self.processed.inc();
        if ok {
            self.succeeded.inc();
        } else {
            self.failed.inc();
        }
        self.elapsed_ms.observe(elapsed_ms);
    }
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub requests: OutcomeMetrics,
    pub replay: OutcomeMetrics,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let requests = OutcomeMetrics::register(&registry, "req", "requests")?;
        let replay = OutcomeMetrics::register(&registry, "consumer", "replayed records")?;
        Ok(Self {
            registry,
            requests,
            replay,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of everything in the registry.
    pub fn encode_text(&self) -> Result<(String, String), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        let body = String::from_utf8(buf)
            .map_err(|e| prometheus::Error::Msg(format!("metrics are not utf-8: {e}")))?;
        Ok((encoder.format_type().to_string(), body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_counts_outcomes() {
        let m = Metrics::new().unwrap();
        m.requests.observe(true, 1.0);
        m.requests.observe(false, 3.0);
        m.replay.observe(true, 2.0);

        assert_eq!(m.requests.processed.get(), 2);
        assert_eq!(m.requests.succeeded.get(), 1);
        assert_eq!(m.requests.failed.get(), 1);
        assert_eq!(m.requests.elapsed_ms.get_sample_count(), 2);
        assert_eq!(m.replay.processed.get(), 1);
    }

    #[test]
    fn text_exposition_names_every_series() {
        let m = Metrics::new().unwrap();
        m.replay.observe(false, 12.0);
        let (content_type, body) = m.encode_text().unwrap();
        assert!(content_type.starts_with("text/plain"));
        for name in [
            "req_processed_total",
            "req_processed_succ",
            "req_processed_fail",
            "req_process_time_ms",
            "consumer_processed_total",
            "consumer_processed_succ",
            "consumer_processed_fail",
            "consumer_process_time_ms",
        ] {
            assert!(body.contains(name), "missing {name}");
        }
        assert!(body.contains("consumer_processed_fail 1"));
    }

    #[test]
    fn registries_are_independent() {
        // Two contexts in one process must not collide on registration.
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.requests.observe(true, 1.0);
        assert_eq!(b.requests.processed.get(), 0);
    }
}
