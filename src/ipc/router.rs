use tracing::debug;

use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    debug!(id = %req.id, method = %req.method, "request");
    let resp = dispatch(state, &req).unwrap_or_else(|| {
        err(
            &req.id,
            "not_implemented",
            format!("unknown method: {}", req.method),
            None,
        )
    });
    let ok = resp.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
    debug!(id = %req.id, ok, "response");
    resp
}

fn dispatch(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if let Some(resp) = handlers::core::try_handle(state, req) {
        return Some(resp);
    }
    if let Some(resp) = handlers::program::try_handle(state, req) {
        return Some(resp);
    }
    if let Some(resp) = handlers::instruments::try_handle(state, req) {
        return Some(resp);
    }
    if let Some(resp) = handlers::assessment::try_handle(state, req) {
        return Some(resp);
    }
    if let Some(resp) = handlers::self_assessment::try_handle(state, req) {
        return Some(resp);
    }
    None
}
