use serde_json::json;
use std::path::PathBuf;

use crate::auth::Action;
use crate::backup;
use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{authorize, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn workspace_path(state: &AppState) -> Result<PathBuf, HandlerErr> {
    state
        .workspace
        .clone()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn handle_export(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::WorkspaceAdmin, None)?;
    let workspace = workspace_path(state)?;
    let out_path = PathBuf::from(required_str(req, "outPath")?);

    let summary = backup::export_workspace_bundle(&workspace, &out_path)
        .map_err(|e| HandlerErr::new("backup_failed", format!("{e:?}")))?;
    Ok(json!({
        "outPath": out_path.to_string_lossy(),
        "bundleFormat": summary.bundle_format,
        "dbSha256": summary.db_sha256,
    }))
}

fn handle_import(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::WorkspaceAdmin, None)?;
    let workspace = workspace_path(state)?;
    let in_path = PathBuf::from(required_str(req, "inPath")?);

    // Drop the live connection before swapping the database file.
    state.db = None;
    let summary = backup::import_workspace_bundle(&in_path, &workspace)
        .map_err(|e| HandlerErr::new("backup_failed", format!("{e:?}")));
    let reopened = db::open_db(&workspace)
        .map_err(|e| HandlerErr::new("db_open_failed", format!("{e:?}")))?;
    state.db = Some(reopened);
    let summary = summary?;

    Ok(json!({
        "bundleFormat": summary.bundle_format_detected,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "backup.export" => handle_export(state, req),
        "backup.import" => handle_import(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
