//! A minimal HTTP-01 challenge responder: serves
//! `/.well-known/acme-challenge/<token>` from an in-memory map the ACME
//! client fills in while an order is pending. Meant to be bound on port 80
//! alongside (not instead of) whatever else answers that port.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use super::acme::Http01Responder;

#[derive(Default)]
pub struct InMemoryHttp01Responder {
    challenges: Mutex<HashMap<String, String>>,
}

impl Http01Responder for InMemoryHttp01Responder {
    fn set_challenge(&self, token: String, key_authorization: String) {
        self.challenges.lock().insert(token, key_authorization);
    }

    fn clear_challenge(&self, token: &str) {
        self.challenges.lock().remove(token);
    }
}

async fn serve_challenge(
    State(responder): State<Arc<InMemoryHttp01Responder>>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    match responder.challenges.lock().get(&token).cloned() {
        Some(key_authorization) => (StatusCode::OK, key_authorization),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

/// Runs the HTTP-01 responder until the process stops. Intended to be
/// spawned once, only when ACME with `TLS_ACME_CHALLENGE=HTTP-01` is
/// configured.
pub async fn run(addr: &str, responder: Arc<InMemoryHttp01Responder>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/.well-known/acme-challenge/:token", get(serve_challenge))
        .with_state(responder);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
