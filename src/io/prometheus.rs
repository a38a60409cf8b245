//! Scrape endpoint for the coordinator
//!
//! `GET /metrics` renders counters, occupancy and latency histograms in the
//! Prometheus text format; `GET /health` is a liveness probe.

use crate::infra::metrics::{LatencySnapshot, Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS};
use crate::io::protocol::Statistics;
use crate::services::coordinator::Coordinator;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Text exposition buffer; every sample carries the site label
struct Exposition<'a> {
    out: String,
    site: &'a str,
}

impl<'a> Exposition<'a> {
    fn new(site: &'a str) -> Self {
        Self { out: String::with_capacity(4096), site }
    }

    fn header(&mut self, name: &str, help: &str, kind: &str) {
        let _ = write!(self.out, "# HELP {name} {help}\n# TYPE {name} {kind}\n");
    }

    fn sample(&mut self, name: &str, value: impl std::fmt::Display) {
        let _ = writeln!(self.out, "{name}{{site=\"{}\"}} {value}", self.site);
    }

    fn counter(&mut self, name: &str, help: &str, value: u64) {
        self.header(name, help, "counter");
        self.sample(name, value);
    }

    fn gauge(&mut self, name: &str, help: &str, value: u64) {
        self.header(name, help, "gauge");
        self.sample(name, value);
    }

    fn gauge_f64(&mut self, name: &str, help: &str, value: f64) {
        self.header(name, help, "gauge");
        self.sample(name, format_args!("{value:.6}"));
    }

    /// Buckets are emitted cumulatively, ending with `+Inf`
    fn histogram(&mut self, name: &str, help: &str, snapshot: &LatencySnapshot) {
        self.header(name, help, "histogram");
        let bounds = METRICS_BUCKET_BOUNDS.iter().map(|b| b.to_string()).chain(std::iter::once("+Inf".to_string()));
        let mut running = 0u64;
        for (count, le) in snapshot.buckets.iter().zip(bounds) {
            running += count;
            let _ = writeln!(self.out, "{name}_bucket{{site=\"{}\",le=\"{le}\"}} {running}", self.site);
        }
        self.sample(&format!("{name}_sum"), snapshot.avg_us * snapshot.count);
        self.sample(&format!("{name}_count"), snapshot.count);
    }

    fn finish(self) -> String {
        self.out
    }
}

/// Render one scrape. Histograms restart after every scrape.
fn render(metrics: &Metrics, stats: &Statistics, site_id: &str) -> String {
    let summary = metrics.report(stats.occupied, stats.total);
    let mut page = Exposition::new(site_id);
    event_section(&mut page, &summary);
    facility_section(&mut page, stats);
    floor_section(&mut page, &summary);
    page.finish()
}

fn event_section(page: &mut Exposition<'_>, summary: &MetricsSummary) {
    page.counter("parking_events_total", "Total events handled", summary.events_total);
    page.gauge_f64("parking_events_per_sec", "Events handled per second", summary.events_per_sec);
    page.histogram("parking_event_latency_us", "Event handling latency in microseconds", &summary.event_latency);
    page.gauge("parking_event_latency_p99_us", "99th percentile event handling latency", summary.event_latency.p99_us);

    let counters = [
        ("parking_entries_granted_total", "Entries granted", summary.entries_granted),
        ("parking_exits_granted_total", "Exits granted", summary.exits_granted),
        ("parking_denials_total", "Events answered granted=false", summary.denials),
        ("parking_duplicate_entries_total", "Entries rejected as duplicates", summary.duplicate_entries),
        ("parking_unknown_exits_total", "Exits with no matching entry", summary.unknown_exits),
        ("parking_replays_total", "Retransmitted events answered from the ledger", summary.replays),
        ("parking_events_recorded_total", "FAULT and MAINTENANCE events recorded", summary.events_recorded),
    ];
    for (name, help, value) in counters {
        page.counter(name, help, value);
    }
    page.gauge_f64("parking_revenue_total", "Fees billed since start", summary.revenue_total);
}

fn facility_section(page: &mut Exposition<'_>, stats: &Statistics) {
    page.gauge("parking_spaces_occupied", "Occupied spaces", stats.occupied.into());
    page.gauge("parking_spaces_free", "Free spaces", stats.free.into());
    page.gauge("parking_spaces_total", "Total spaces", stats.total.into());
    page.gauge_f64("parking_revenue_window", "Fees billed in the statistics window", stats.revenue_window);
    page.gauge("parking_facility_closed", "1 when the facility is closed to entries", u64::from(stats.facility_closed));
    page.gauge("parking_floors_blocked", "Floors blocked to entries", stats.blocked_floors.len() as u64);
    page.gauge("parking_connected_clients", "Floor controllers connected", stats.connected_clients);
}

/// Populated when floor controllers share the process (simulation)
fn floor_section(page: &mut Exposition<'_>, summary: &MetricsSummary) {
    page.counter("parking_bus_transactions_total", "Bus transactions", summary.bus_transactions);
    page.counter("parking_bus_faults_total", "Bus transactions that faulted", summary.bus_faults);
    page.histogram("parking_bus_latency_us", "Bus transaction latency in microseconds", &summary.bus_latency);
    page.counter("parking_lane_faults_total", "Lane FAULT transitions", summary.lane_faults);
    page.counter("parking_passages_total", "Completed barrier cycles", summary.passages);
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    coordinator: Arc<Coordinator>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let stats = coordinator.get_statistics();
            let body = render(&metrics, &stats, &site_id);
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
        }
        (&Method::GET, "/health") => Response::builder().status(StatusCode::OK).body(Full::new(Bytes::from("ok"))),
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Full::new(Bytes::from("Not Found"))),
    };
    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

/// Serve /metrics and /health until shutdown
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    coordinator: Arc<Coordinator>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    let site_id = Arc::new(site_id);
    info!(port = %port, site = %site_id, "metrics_endpoint_listening");

    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!(error = %e, "metrics_accept_failed");
                    continue;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("metrics_endpoint_stopped");
                    return Ok(());
                }
                continue;
            }
        };

        let (metrics, coordinator, site_id) = (metrics.clone(), coordinator.clone(), site_id.clone());
        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, metrics.clone(), coordinator.clone(), site_id.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
                error!(error = %e, "metrics_connection_error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Event, EventKind, FloorId, Plate};
    use crate::io::store::MemoryStore;
    use crate::services::coordinator::CoordinatorSettings;

    #[test]
    fn test_format_contains_core_metrics() {
        let metrics = Arc::new(Metrics::new());
        let coordinator =
            Coordinator::new(CoordinatorSettings::default(), Arc::new(MemoryStore::new()), metrics.clone());
        coordinator.handle_event(Event::new(Plate::new("ABC1234"), EventKind::Entry, 0.95, FloorId::new("ground")));

        let output = render(&metrics, &coordinator.get_statistics(), "test");
        assert!(output.contains("parking_events_total{site=\"test\"} 1"));
        assert!(output.contains("parking_entries_granted_total{site=\"test\"} 1"));
        assert!(output.contains("parking_spaces_occupied{site=\"test\"} 1"));
        assert!(output.contains("parking_spaces_free{site=\"test\"} 7"));
        assert!(output.contains("parking_event_latency_us_count{site=\"test\"} 1"));
        assert!(output.contains("le=\"+Inf\""));
    }

    #[test]
    fn test_histogram_is_cumulative() {
        let mut snapshot = LatencySnapshot { count: 3, avg_us: 150, ..LatencySnapshot::default() };
        snapshot.buckets[0] = 1;
        snapshot.buckets[1] = 2;
        let mut page = Exposition::new("s");
        page.histogram("x", "help", &snapshot);
        let output = page.finish();
        assert!(output.contains("x_bucket{site=\"s\",le=\"200\"} 3"));
        assert!(output.contains("x_bucket{site=\"s\",le=\"+Inf\"} 3"));
        assert!(output.contains("x_sum{site=\"s\"} 450"));
    }
}
