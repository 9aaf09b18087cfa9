use std::path::PathBuf;

use serde_json::{json, Value};
use tracing::info;

use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::optional_str;
use crate::ipc::types::{AppState, Request};

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "health" => health(state, req),
        "workspace.select" => workspace_select(state, req),
        "workspace.backup" => workspace_backup(state, req),
        _ => return None,
    };
    Some(resp.unwrap_or_else(|e| e))
}

fn health(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    Ok(ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy()),
        }),
    ))
}

fn workspace_select(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let path = match req.params.get("path").and_then(|v| v.as_str()) {
        Some(p) => PathBuf::from(p),
        None => return Err(err(&req.id, "bad_params", "missing params.path", None)),
    };
    let conn = db::open_db(&path)
        .map_err(|e| err(&req.id, "db_open_failed", format!("{e:#}"), None))?;
    info!(path = %path.display(), "workspace opened");
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    Ok(ok(
        &req.id,
        json!({ "workspacePath": path.to_string_lossy() }),
    ))
}

fn workspace_backup(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let workspace = match &state.workspace {
        Some(p) => p.clone(),
        None => return Err(err(&req.id, "no_workspace", "no workspace selected", None)),
    };
    let dest = optional_str(req, "destDir").map(PathBuf::from);
    let summary = backup::backup_workspace(&workspace, dest.as_deref())
        .map_err(|e| err(&req.id, "backup_failed", format!("{e:#}"), None))?;
    info!(bundle = %summary.bundle_path.display(), "workspace backup written");
    Ok(ok(
        &req.id,
        json!({
            "bundlePath": summary.bundle_path.to_string_lossy(),
            "bundleFormat": summary.bundle_format,
            "dbSha256": summary.db_sha256,
        }),
    ))
}
