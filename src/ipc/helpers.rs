use rusqlite::Connection;

use super::error::err;
use super::types::{AppState, Request};
use crate::errors::CoreError;
use crate::workflow::{self, RequestContext};

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "no workspace selected", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("missing params.{}", key),
                None,
            )
        })
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Core errors carry their envelope code already; this is the one mapping
/// point from `CoreError` to the wire.
pub fn core_err(req: &Request, e: CoreError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

/// Establish the caller for methods that take a `userId` param.
pub fn request_context(
    conn: &Connection,
    req: &Request,
) -> Result<RequestContext, serde_json::Value> {
    let user_id = required_str(req, "userId")?;
    workflow::load_context(conn, &user_id).map_err(|e| core_err(req, e))
}
