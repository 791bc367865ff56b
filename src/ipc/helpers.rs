use rusqlite::Connection;
use serde::de::DeserializeOwned;

use crate::auth::{self, Action, Actor};
use crate::calc::CalcError;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub struct HandlerErr {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, &self.code, self.message, self.details)
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

pub fn db_conn<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn require_actor(req: &Request) -> Result<&Actor, HandlerErr> {
    req.actor
        .as_ref()
        .ok_or_else(|| HandlerErr::new("unauthenticated", "request carries no actor identity"))
}

pub fn authorize(req: &Request, action: Action, owner: Option<&str>) -> Result<(), HandlerErr> {
    let actor = require_actor(req)?;
    auth::authorize(action, actor, owner)
        .map_err(|denied| HandlerErr::new("forbidden", denied.message))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, HandlerErr> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

/// Typed input structs are deserialized from params in one step so the
/// whole payload is validated before any write happens.
pub fn parse_params<T: DeserializeOwned>(req: &Request) -> Result<T, HandlerErr> {
    serde_json::from_value(req.params.clone())
        .map_err(|e| HandlerErr::new("bad_params", e.to_string()))
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
