use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::engine::EngineError;

// ── Allocation outcomes ─────────────────────────────────────────

/// Counter: reservation mutations. Labels: op, status.
pub const RESERVATIONS_TOTAL: &str = "encore_reservations_total";

/// Counter: roster applications and departures. Labels: op, status.
pub const ROSTER_TOTAL: &str = "encore_roster_total";

/// Counter: team creation, update and removal. Labels: op, status.
pub const TEAMS_TOTAL: &str = "encore_teams_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "encore_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "encore_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "encore_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short status label for an operation result: "ok" or the error class.
pub fn status_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    }
}

pub fn record_outcome<T>(metric: &'static str, op: &'static str, result: &Result<T, EngineError>) {
    metrics::counter!(metric, "op" => op, "status" => status_label(result)).increment(1);
}

/// Thread-local recorder that keeps `(op, status)` labels of every counter
/// hit, for asserting on outcome metrics in tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct OutcomeRecorder {
    hits: std::sync::Mutex<Vec<(String, String, String)>>,
}

#[cfg(test)]
impl OutcomeRecorder {
    pub(crate) fn outcomes(&self, metric: &str) -> Vec<(String, String)> {
        self.hits
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _, _)| name == metric)
            .map(|(_, op, status)| (op.clone(), status.clone()))
            .collect()
    }
}

#[cfg(test)]
impl metrics::Recorder for OutcomeRecorder {
    fn describe_counter(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
    fn describe_gauge(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
    fn describe_histogram(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}

    fn register_counter(&self, key: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Counter {
        let label = |name: &str| {
            key.labels()
                .find(|l| l.key() == name)
                .map(|l| l.value().to_string())
                .unwrap_or_default()
        };
        self.hits
            .lock()
            .unwrap()
            .push((key.name().to_string(), label("op"), label("status")));
        metrics::Counter::noop()
    }

    fn register_gauge(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Gauge {
        metrics::Gauge::noop()
    }

    fn register_histogram(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Histogram {
        metrics::Histogram::noop()
    }
}
