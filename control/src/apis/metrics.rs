//! Controller metrics
//!
//! All metrics live in one registry, exposed as Prometheus text through
//! [`gather_controller_metrics`] and, when configured, on `/metrics`.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder, TEXT_FORMAT,
};
use std::convert::Infallible;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Reconciliation duration per resource kind
    static ref RECONCILIATION_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "reconciliation_duration_seconds",
            "Reconciliation duration in seconds",
        );
        let histogram = HistogramVec::new(opts, &["kind"])
            .expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Reconciliations per resource kind and result
    static ref RECONCILIATIONS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "reconciliations_total",
            "Total number of reconciliations",
        );
        let counter = IntCounterVec::new(opts, &["kind", "result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Writes of derived resources (created, updated, unchanged, deleted)
    static ref DERIVED_WRITES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "derived_resource_writes_total",
            "Derived resource apply outcomes",
        );
        let counter = IntCounterVec::new(opts, &["kind", "action"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Watch events dropped by the change filter
    static ref FILTER_DROPS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "filter_dropped_events_total",
            "Watch events rejected by the change filter",
        );
        let counter = IntCounterVec::new(opts, &["kind", "reason"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };
}

/// Record one reconciliation of `kind`
pub fn record_reconciliation(kind: &str, duration_secs: f64, result: &str) {
    RECONCILIATION_DURATION
        .with_label_values(&[kind])
        .observe(duration_secs);

    RECONCILIATIONS_TOTAL
        .with_label_values(&[kind, result])
        .inc();
}

/// Count a failed reconciliation; the duration is not observed
pub fn record_reconciliation_error(kind: &str, result: &str) {
    RECONCILIATIONS_TOTAL
        .with_label_values(&[kind, result])
        .inc();
}

pub fn record_derived_write(kind: &str, action: &str) {
    DERIVED_WRITES_TOTAL.with_label_values(&[kind, action]).inc();
}

pub fn record_filter_drop(kind: &str, reason: &str) {
    FILTER_DROPS_TOTAL.with_label_values(&[kind, reason]).inc();
}

/// Gather controller metrics
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}

fn metrics_response(method: &Method, path: &str) -> Response<Full<Bytes>> {
    if method != Method::GET || path != "/metrics" {
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }

    match gather_controller_metrics() {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
            response
        }
        Err(e) => {
            error!("{}", e);
            let mut response = Response::new(Full::new(Bytes::from(e)));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

/// Serve `/metrics` on `addr` until the task is dropped
pub async fn serve_metrics(addr: &str) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics endpoint listening on {}", addr);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Accept error on {}: {}", addr, e);
                continue;
            }
        };
        debug!("Metrics scrape from {}", peer);

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                Ok::<_, Infallible>(metrics_response(req.method(), req.uri().path()))
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Metrics connection error: {}", e);
            }
        });
    }
}
