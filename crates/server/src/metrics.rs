use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::Engine;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::info;

/// Counter surface of the protocol core, exposed as Prometheus text.
#[derive(Default)]
pub struct Metrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    // Index 1..=5 by FLAP channel; slot 0 collects everything else.
    flaps_in: [AtomicU64; 6],
    flaps_out: [AtomicU64; 6],
    snacs: Mutex<HashMap<(u16, u16), u64>>,
    auth_success: AtomicU64,
    auth_failure: AtomicU64,
    messages_delivered: AtomicU64,
    messages_queued: AtomicU64,
    presence_events: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_flap_in(&self, channel: u8) {
        self.flaps_in[channel_slot(channel)].fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_flap_out(&self, channel: u8) {
        self.flaps_out[channel_slot(channel)].fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_snac(&self, family: u16, subtype: u16) {
        let mut snacs = self.snacs.lock().expect("snac counter lock");
        *snacs.entry((family, subtype)).or_insert(0) += 1;
    }

    pub fn mark_auth_success(&self) {
        self.auth_success.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_auth_failure(&self) {
        self.auth_failure.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_message_queued(&self) {
        self.messages_queued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_presence_event(&self) {
        self.presence_events.fetch_add(1, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "# TYPE oscard_connections_opened_total counter\noscard_connections_opened_total {}\n\
            # TYPE oscard_connections_closed_total counter\noscard_connections_closed_total {}\n",
            self.connections_opened.load(Ordering::SeqCst),
            self.connections_closed.load(Ordering::SeqCst),
        );
        out.push_str("# TYPE oscard_flaps_in_total counter\n");
        for (slot, counter) in self.flaps_in.iter().enumerate() {
            let _ = writeln!(
                out,
                "oscard_flaps_in_total{{channel=\"{}\"}} {}",
                channel_label(slot),
                counter.load(Ordering::SeqCst)
            );
        }
        out.push_str("# TYPE oscard_flaps_out_total counter\n");
        for (slot, counter) in self.flaps_out.iter().enumerate() {
            let _ = writeln!(
                out,
                "oscard_flaps_out_total{{channel=\"{}\"}} {}",
                channel_label(slot),
                counter.load(Ordering::SeqCst)
            );
        }
        out.push_str("# TYPE oscard_snacs_total counter\n");
        let mut snacs: Vec<((u16, u16), u64)> = {
            let guard = self.snacs.lock().expect("snac counter lock");
            guard.iter().map(|(key, count)| (*key, *count)).collect()
        };
        snacs.sort_unstable();
        for ((family, subtype), count) in snacs {
            let _ = writeln!(
                out,
                "oscard_snacs_total{{family=\"0x{:04x}\",subtype=\"0x{:04x}\"}} {}",
                family, subtype, count
            );
        }
        let _ = write!(
            out,
            "# TYPE oscard_auth_success_total counter\noscard_auth_success_total {}\n\
            # TYPE oscard_auth_failure_total counter\noscard_auth_failure_total {}\n\
            # TYPE oscard_messages_delivered_total counter\noscard_messages_delivered_total {}\n\
            # TYPE oscard_messages_queued_total counter\noscard_messages_queued_total {}\n\
            # TYPE oscard_presence_events_total counter\noscard_presence_events_total {}\n",
            self.auth_success.load(Ordering::SeqCst),
            self.auth_failure.load(Ordering::SeqCst),
            self.messages_delivered.load(Ordering::SeqCst),
            self.messages_queued.load(Ordering::SeqCst),
            self.presence_events.load(Ordering::SeqCst),
        );
        out
    }
}

fn channel_slot(channel: u8) -> usize {
    match channel {
        1..=5 => channel as usize,
        _ => 0,
    }
}

fn channel_label(slot: usize) -> &'static str {
    match slot {
        1 => "1",
        2 => "2",
        3 => "3",
        4 => "4",
        5 => "5",
        _ => "other",
    }
}

#[derive(Clone)]
struct EndpointState {
    metrics: Arc<Metrics>,
    basic_auth: Option<(String, String)>,
}

/// Serves `/metrics` until the task is aborted at shutdown.
pub async fn serve_endpoint(
    addr: String,
    metrics: Arc<Metrics>,
    basic_auth: Option<(String, String)>,
) -> Result<(), std::io::Error> {
    let state = EndpointState {
        metrics,
        basic_auth,
    };
    let router = Router::new()
        .route("/metrics", get(metrics_endpoint))
        .with_state(state);
    let listener = TcpListener::bind(&addr).await?;
    info!(address = %addr, "metrics endpoint started");
    axum::serve(listener, router).await
}

async fn metrics_endpoint(State(state): State<EndpointState>, headers: HeaderMap) -> Response {
    if let Some((user, password)) = &state.basic_auth {
        let expected = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"))
        );
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let authorized: bool = presented.as_bytes().ct_eq(expected.as_bytes()).into();
        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"oscard\"")],
                "unauthorized",
            )
                .into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode_prometheus(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_carries_counters() {
        let metrics = Metrics::new();
        metrics.mark_connection_opened();
        metrics.mark_flap_in(2);
        metrics.mark_flap_in(2);
        metrics.mark_flap_out(1);
        metrics.mark_flap_in(9);
        metrics.mark_snac(0x0004, 0x0006);
        metrics.mark_auth_failure();
        metrics.mark_message_queued();
        let text = metrics.encode_prometheus();
        assert!(text.contains("oscard_connections_opened_total 1"));
        assert!(text.contains("oscard_flaps_in_total{channel=\"2\"} 2"));
        assert!(text.contains("oscard_flaps_out_total{channel=\"1\"} 1"));
        assert!(text.contains("oscard_flaps_in_total{channel=\"other\"} 1"));
        assert!(text.contains("oscard_snacs_total{family=\"0x0004\",subtype=\"0x0006\"} 1"));
        assert!(text.contains("oscard_auth_failure_total 1"));
        assert!(text.contains("oscard_messages_queued_total 1"));
    }

    #[test]
    fn snac_series_sorted() {
        let metrics = Metrics::new();
        metrics.mark_snac(0x0017, 0x0002);
        metrics.mark_snac(0x0001, 0x0003);
        let text = metrics.encode_prometheus();
        let first = text.find("family=\"0x0001\"").unwrap();
        let second = text.find("family=\"0x0017\"").unwrap();
        assert!(first < second);
    }
}
