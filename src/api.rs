use std::{collections::BTreeMap, fs, path::Path, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::Uri,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::UnixListener;
use tracing as log;

use crate::engine::Engine;

/// Serve the volume-driver protocol on a Unix socket until the process is
/// stopped. A stale socket from a previous run is removed before binding.
pub async fn serve(engine: Arc<Engine>, socket: &Path) -> Result<()> {
    if let Some(dir) = socket.parent()
        && !dir.exists()
    {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    if socket.exists() {
        fs::remove_file(socket)
            .with_context(|| format!("remove stale socket {}", socket.display()))?;
    }

    let listener =
        UnixListener::bind(socket).with_context(|| format!("bind {}", socket.display()))?;
    log::info!("listening on {}", socket.display());

    axum::serve(listener, router(engine))
        .await
        .context("serve volume driver socket")
}

pub fn router(engine: Arc<Engine>) -> Router {
    // the driver protocol posts to dotted paths, so a single fallback
    // handler dispatches on the raw path
    Router::new().fallback(handle).with_state(engine)
}

async fn handle(State(engine): State<Arc<Engine>>, uri: Uri, body: Bytes) -> Json<Value> {
    let path = uri.path().to_string();
    let reply = tokio::task::spawn_blocking(move || dispatch(&engine, &path, &body)).await;
    match reply {
        Ok(value) => Json(value),
        Err(e) => Json(json!({ "Err": format!("internal error: {e}") })),
    }
}

/// One protocol call. Every outcome is a JSON object; failures carry the
/// message in `Err` and still answer with HTTP 200, as the runtime expects.
pub fn dispatch(engine: &Arc<Engine>, path: &str, body: &[u8]) -> Value {
    log::debug!("{path} {}", String::from_utf8_lossy(body));
    let reply = match path {
        "/Plugin.Activate" => Ok(json!({ "Implements": ["VolumeDriver"] })),
        "/VolumeDriver.Create" => create(engine, body),
        "/VolumeDriver.Remove" => remove(engine, body),
        "/VolumeDriver.Mount" => mount(engine, body),
        "/VolumeDriver.Path" => path_of(engine, body),
        "/VolumeDriver.Unmount" => unmount(engine, body),
        "/VolumeDriver.Get" => get(engine, body),
        "/VolumeDriver.List" => Ok(list(engine)),
        "/VolumeDriver.Capabilities" => Ok(json!({ "Capabilities": { "Scope": "local" } })),
        _ => Err(anyhow::anyhow!("Not supported")),
    };
    reply.unwrap_or_else(|e| {
        log::warn!("{path} failed: {e:#}");
        json!({ "Err": format!("{e:#}") })
    })
}

#[derive(Deserialize)]
struct NameRequest {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Deserialize)]
struct CreateRequest {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Opts", default)]
    opts: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
struct SessionRequest {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "ID", default)]
    id: String,
}

fn parse<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T> {
    serde_json::from_slice(body).context("parse request body")
}

fn create(engine: &Arc<Engine>, body: &[u8]) -> Result<Value> {
    let req: CreateRequest = parse(body)?;
    engine.create(&req.name, &req.opts.unwrap_or_default())?;
    Ok(json!({}))
}

fn remove(engine: &Arc<Engine>, body: &[u8]) -> Result<Value> {
    let req: NameRequest = parse(body)?;
    engine.remove(&req.name)?;
    Ok(json!({}))
}

fn mount(engine: &Arc<Engine>, body: &[u8]) -> Result<Value> {
    let req: SessionRequest = parse(body)?;
    let data = engine.mount(&req.name, &req.id)?;
    Ok(json!({ "Mountpoint": data.display().to_string() }))
}

fn unmount(engine: &Arc<Engine>, body: &[u8]) -> Result<Value> {
    let req: SessionRequest = parse(body)?;
    engine.unmount(&req.name, &req.id)?;
    Ok(json!({}))
}

fn path_of(engine: &Arc<Engine>, body: &[u8]) -> Result<Value> {
    let req: NameRequest = parse(body)?;
    let data = engine.path(&req.name)?;
    Ok(json!({ "Mountpoint": data.display().to_string() }))
}

fn get(engine: &Arc<Engine>, body: &[u8]) -> Result<Value> {
    let req: NameRequest = parse(body)?;
    let info = engine.get(&req.name)?;
    Ok(json!({
        "Volume": {
            "Name": info.name,
            "Mountpoint": info.mountpoint.display().to_string(),
            "Status": { "mounted": info.mounted },
        }
    }))
}

fn list(engine: &Arc<Engine>) -> Value {
    let volumes: Vec<Value> = engine
        .list()
        .into_iter()
        .map(|(name, data)| {
            json!({ "Name": name, "Mountpoint": data.display().to_string() })
        })
        .collect();
    json!({ "Volumes": volumes })
}
