//! Prometheus metrics for the server
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Sink for connection and query lifecycle events. The server's own
/// prometheus-backed implementation is [`MetricsListener`]; embedders can
/// plug in their own.
pub trait ServerEventListener: Send + Sync {
    fn client_connected(&self);
    fn client_disconnected(&self);
    fn query_started(&self);
    fn query_completed(&self, success: bool, duration: Duration);
}

/// [`ServerEventListener`] backed by the global prometheus registry.
#[derive(Debug, Default)]
pub struct MetricsListener;

impl ServerEventListener for MetricsListener {
    fn client_connected(&self) {
        metrics().record_connection_accepted();
    }

    fn client_disconnected(&self) {
        metrics().record_connection_closed();
    }

    fn query_started(&self) {
        metrics().queries_in_flight.inc();
    }

    fn query_completed(&self, _success: bool, _duration: Duration) {
        metrics().queries_in_flight.dec();
    }
}

/// Server metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Connection metrics
    /// Total client connections accepted
    pub connections_total: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,
    /// Total client connections closed
    pub connections_closed: IntCounter,

    // Query metrics
    /// Total queries processed
    pub queries_total: IntCounter,
    /// Query errors
    pub query_errors_total: IntCounter,
    /// Queries currently executing
    pub queries_in_flight: IntGauge,
    /// Query latency histogram (in seconds)
    pub query_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "marlin_connections_total",
            "Total number of client connections accepted",
        )
        .unwrap();

        let connections_active = IntGauge::new(
            "marlin_connections_active",
            "Current number of active client connections",
        )
        .unwrap();

        let connections_closed = IntCounter::new(
            "marlin_connections_closed_total",
            "Total number of client connections closed",
        )
        .unwrap();

        let queries_total =
            IntCounter::new("marlin_queries_total", "Total number of queries processed").unwrap();

        let query_errors_total = IntCounter::new(
            "marlin_query_errors_total",
            "Total number of failed queries",
        )
        .unwrap();

        let queries_in_flight = IntGauge::new(
            "marlin_queries_in_flight",
            "Number of queries currently executing",
        )
        .unwrap();

        let query_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("marlin_query_duration_seconds", "Query latency in seconds")
                .buckets(vec![
                    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
                    5.0, 10.0,
                ]),
        )
        .unwrap();

        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_closed.clone()))
            .unwrap();
        registry.register(Box::new(queries_total.clone())).unwrap();
        registry
            .register(Box::new(query_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(queries_in_flight.clone()))
            .unwrap();
        registry
            .register(Box::new(query_duration_seconds.clone()))
            .unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            queries_total,
            query_errors_total,
            queries_in_flight,
            query_duration_seconds,
        }
    }

    /// Record a query execution
    pub fn record_query(&self, success: bool, duration_secs: f64) {
        self.queries_total.inc();
        if !success {
            self.query_errors_total.inc();
        }
        self.query_duration_seconds.observe(duration_secs);
    }

    /// Record a new connection
    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record a connection closed
    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
        self.connections_closed.inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        match req.uri().path() {
            "/metrics" => {
                let body = metrics().gather();
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap())
            }
            "/health" => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("OK")))
                .unwrap()),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("Not Found")))
                .unwrap()),
        }
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
