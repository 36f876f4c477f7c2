//! Request routing and JSON handlers.
//!
//! Every engine call runs on the blocking pool: a source changeover sleeps
//! through the settling interval while holding the engine lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use relaybank_kernel::SwitchEngine;
use relaybank_types::{ChannelId, GroupId, Level, RelayError};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{error, warn};

use crate::http::{Request, Response};

const ROUTES: &[(&str, &str)] = &[
    ("POST", "/api/relay"),
    ("POST", "/api/input"),
    ("POST", "/api/output"),
    ("GET", "/api/status"),
    ("POST", "/api/emergency-off"),
    ("GET", "/api/health"),
];

#[derive(Debug, Deserialize)]
struct RelayRequest {
    relay_id: u32,
    state: Level,
}

#[derive(Debug, Deserialize)]
struct InputRequest {
    #[serde(default)]
    group: Option<String>,
    source: String,
}

#[derive(Debug, Deserialize)]
struct OutputRequest {
    output: usize,
    state: Level,
}

/// HTTP status for an engine error.
pub fn status_for(err: &RelayError) -> u16 {
    match err {
        RelayError::Configuration(_) | RelayError::InterlockViolation { .. } => 400,
        RelayError::Uninitialized => 503,
        RelayError::HardwareRead { .. }
        | RelayError::HardwareWrite { .. }
        | RelayError::HardwareInit(_) => 500,
    }
}

fn error_response(status: u16, message: impl Into<String>, kind: &str) -> Response {
    Response::json(status, json!({ "error": message.into(), "kind": kind }))
}

fn relay_error(err: &RelayError) -> Response {
    error_response(status_for(err), err.to_string(), err.kind())
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response> {
    serde_json::from_slice(body)
        .map_err(|e| error_response(400, format!("invalid request body: {e}"), "bad_request"))
}

/// Run `f` against the engine on the blocking pool.
async fn blocking<T, F>(engine: &Arc<SwitchEngine>, f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&SwitchEngine) -> Result<T, RelayError> + Send + 'static,
{
    let engine = Arc::clone(engine);
    match tokio::task::spawn_blocking(move || f(engine.as_ref())).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            if status_for(&e) >= 500 {
                error!(kind = e.kind(), error = %e, "request failed");
            } else {
                warn!(kind = e.kind(), error = %e, "request rejected");
            }
            Err(relay_error(&e))
        }
        Err(e) => {
            error!(error = %e, "engine task panicked");
            Err(error_response(500, "internal error", "internal"))
        }
    }
}

/// Route `req` to its handler.
pub async fn dispatch(engine: &Arc<SwitchEngine>, req: &Request) -> Response {
    let result = match (req.method.as_str(), req.path.as_str()) {
        ("POST", "/api/relay") => relay(engine, &req.body).await,
        ("POST", "/api/input") => input(engine, &req.body).await,
        ("POST", "/api/output") => output(engine, &req.body).await,
        ("GET", "/api/status") => status(engine).await,
        ("POST", "/api/emergency-off") => emergency_off(engine).await,
        ("GET", "/api/health") => Ok(health(engine)),
        (_, path) if ROUTES.iter().any(|&(_, p)| p == path) => Err(error_response(
            405,
            format!("method {} not allowed on {path}", req.method),
            "method_not_allowed",
        )),
        (_, path) => Err(error_response(404, format!("no route for {path}"), "not_found")),
    };
    result.unwrap_or_else(|resp| resp)
}

async fn relay(engine: &Arc<SwitchEngine>, body: &[u8]) -> Result<Response, Response> {
    let req: RelayRequest = parse_body(body)?;
    let state = blocking(engine, move |e| e.set_channel(ChannelId(req.relay_id), req.state)).await?;
    Ok(Response::json(
        200,
        json!({
            "success": true,
            "relay": {
                "id": state.id,
                "key": state.key,
                "name": state.name,
                "role": state.role,
                "state": state.level,
            },
        }),
    ))
}

/// Resolve the group named by the request, or the only configured group.
fn resolve_group(engine: &SwitchEngine, named: Option<String>) -> Result<GroupId, RelayError> {
    if let Some(name) = named {
        return Ok(GroupId::new(name));
    }
    match engine.registry().groups().as_slice() {
        [only] => Ok((*only).clone()),
        _ => Err(RelayError::Configuration(
            "group is required when several groups are configured".to_string(),
        )),
    }
}

async fn input(engine: &Arc<SwitchEngine>, body: &[u8]) -> Result<Response, Response> {
    let req: InputRequest = parse_body(body)?;
    let group = resolve_group(engine, req.group).map_err(|e| relay_error(&e))?;

    let registry = engine.registry();
    if !registry.has_group(&group) {
        return Err(relay_error(&RelayError::Configuration(format!(
            "unknown group '{group}'"
        ))));
    }
    let members = registry.channels_in_group(&group);
    let source = if req.source.eq_ignore_ascii_case("off") {
        None
    } else {
        match registry.by_key(&req.source) {
            Some(ch) if ch.in_group(&group) => Some(ch.id),
            _ => {
                let keys: Vec<&str> = members.iter().map(|c| c.key.as_str()).collect();
                return Err(relay_error(&RelayError::Configuration(format!(
                    "invalid source '{}'; use {} or off",
                    req.source,
                    keys.join(", ")
                ))));
            }
        }
    };

    let target = group.clone();
    let status = blocking(engine, move |e| e.select_exclusive_source(&target, source)).await?;

    let inputs: BTreeMap<&str, Level> = members
        .iter()
        .map(|c| {
            let level = if Some(c.id) == status.active { Level::On } else { Level::Off };
            (c.key.as_str(), level)
        })
        .collect();
    let active_source = status
        .active
        .and_then(|id| members.iter().find(|c| c.id == id))
        .map(|c| c.key.clone());

    Ok(Response::json(
        200,
        json!({
            "success": true,
            "group": group,
            "active_source": active_source,
            "inputs": inputs,
        }),
    ))
}

async fn output(engine: &Arc<SwitchEngine>, body: &[u8]) -> Result<Response, Response> {
    let req: OutputRequest = parse_body(body)?;
    let channel = engine
        .registry()
        .output(req.output)
        .map_err(|e| relay_error(&e))?;
    let id = channel.id;
    let state = blocking(engine, move |e| e.set_channel(id, req.state)).await?;
    Ok(Response::json(
        200,
        json!({
            "success": true,
            "output": {
                "number": req.output,
                "id": state.id,
                "name": state.name,
                "state": state.level,
            },
        }),
    ))
}

async fn status(engine: &Arc<SwitchEngine>) -> Result<Response, Response> {
    let snapshot = blocking(engine, |e| e.current_state()).await?;
    let active_sources: BTreeMap<&str, Option<&str>> = snapshot
        .groups
        .iter()
        .map(|g| {
            let key = g
                .active
                .and_then(|id| snapshot.channel(id))
                .map(|c| c.key.as_str());
            (g.group.as_str(), key)
        })
        .collect();
    Ok(Response::json(
        200,
        json!({
            "system": "online",
            "timestamp": snapshot.taken_at.timestamp(),
            "active_sources": active_sources,
            "channels": snapshot.channels,
        }),
    ))
}

async fn emergency_off(engine: &Arc<SwitchEngine>) -> Result<Response, Response> {
    let report = blocking(engine, |e| e.force_all_off()).await?;
    let ok = report.all_confirmed();
    let message = if ok {
        "all relays turned off"
    } else {
        "some relays failed to confirm off"
    };
    Ok(Response::json(
        if ok { 200 } else { 500 },
        json!({
            "success": ok,
            "message": message,
            "results": report.outcomes,
            "timestamp": Utc::now().timestamp(),
        }),
    ))
}

/// Lock-free: answers even while a changeover is settling.
fn health(engine: &SwitchEngine) -> Response {
    Response::json(
        200,
        json!({
            "status": "healthy",
            "hardware_initialized": engine.is_initialized(),
            "driver": engine.driver_name(),
            "settle_ms": engine.settle().as_millis() as u64,
            "relay_configuration": engine.registry().all_channels(),
            "timestamp": Utc::now().timestamp(),
        }),
    )
}
