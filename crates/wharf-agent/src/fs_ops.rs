//! Filesystem operation handlers.
//!
//! Every path is rewritten through [`safe_path::resolve`] before it reaches
//! the OS, so handlers never see anything outside the workspace root.

use std::path::Path;
use std::time::UNIX_EPOCH;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};

use crate::error::{AgentError, OpResult};
use crate::safe_path;

fn decode_content(content: &str, encoding: Option<&str>) -> OpResult<Vec<u8>> {
    match encoding {
        None | Some("utf8") | Some("utf-8") => Ok(content.as_bytes().to_vec()),
        Some("base64") => BASE64
            .decode(content)
            .map_err(|e| AgentError::Filesystem(format!("invalid base64 content: {e}"))),
        Some(other) => Err(AgentError::Filesystem(format!(
            "unsupported encoding: {other}"
        ))),
    }
}

pub async fn read_file(workspace: &Path, path: &str, encoding: Option<&str>) -> OpResult<Value> {
    let target = safe_path::resolve(workspace, path);
    let bytes = tokio::fs::read(&target).await.map_err(AgentError::fs)?;
    let content = match encoding {
        None | Some("utf8") | Some("utf-8") => String::from_utf8_lossy(&bytes).into_owned(),
        Some("base64") => BASE64.encode(&bytes),
        Some(other) => {
            return Err(AgentError::Filesystem(format!(
                "unsupported encoding: {other}"
            )))
        }
    };
    Ok(json!({ "content": content }))
}

pub async fn write_file(
    workspace: &Path,
    path: &str,
    content: Option<&str>,
    encoding: Option<&str>,
) -> OpResult<Value> {
    let content = content.ok_or_else(|| {
        AgentError::Filesystem(format!("writeFile requires content for {path:?}"))
    })?;
    let bytes = decode_content(content, encoding)?;
    let target = safe_path::resolve(workspace, path);
    tokio::fs::write(&target, bytes)
        .await
        .map_err(AgentError::fs)?;
    Ok(Value::Null)
}

pub async fn rm(workspace: &Path, path: &str, recursive: bool) -> OpResult<Value> {
    let target = safe_path::resolve(workspace, path);
    let meta = tokio::fs::symlink_metadata(&target)
        .await
        .map_err(AgentError::fs)?;
    if meta.is_dir() {
        if recursive {
            tokio::fs::remove_dir_all(&target)
                .await
                .map_err(AgentError::fs)?;
        } else {
            tokio::fs::remove_dir(&target)
                .await
                .map_err(AgentError::fs)?;
        }
    } else {
        tokio::fs::remove_file(&target)
            .await
            .map_err(AgentError::fs)?;
    }
    Ok(Value::Null)
}

pub async fn readdir(workspace: &Path, path: &str) -> OpResult<Value> {
    let target = safe_path::resolve(workspace, path);
    let mut dir = tokio::fs::read_dir(&target).await.map_err(AgentError::fs)?;
    let mut entries = Vec::new();
    while let Some(entry) = dir.next_entry().await.map_err(AgentError::fs)? {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        entries.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "isDirectory": is_dir,
        }));
    }
    entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Ok(json!({ "entries": entries }))
}

pub async fn mkdir(workspace: &Path, path: &str, recursive: bool) -> OpResult<Value> {
    let target = safe_path::resolve(workspace, path);
    if recursive {
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(AgentError::fs)?;
    } else {
        tokio::fs::create_dir(&target)
            .await
            .map_err(AgentError::fs)?;
    }
    Ok(Value::Null)
}

pub async fn stat(workspace: &Path, path: &str) -> OpResult<Value> {
    let target = safe_path::resolve(workspace, path);
    let meta = tokio::fs::metadata(&target).await.map_err(AgentError::fs)?;
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Ok(json!({
        "isFile": meta.is_file(),
        "isDirectory": meta.is_dir(),
        "size": meta.len(),
        "mtimeMs": mtime_ms,
    }))
}

/// Bulk-write a JSON tree of file contents under `path`. Object values are
/// directories, string values are file contents. Permissions and
/// timestamps are not applied, contents only.
pub async fn mount(workspace: &Path, path: &str, tree: Option<&Value>) -> OpResult<Value> {
    let tree = tree
        .and_then(Value::as_object)
        .ok_or_else(|| AgentError::Filesystem("mount requires an object tree".to_string()))?;
    let root = safe_path::resolve(workspace, path);
    tokio::fs::create_dir_all(&root)
        .await
        .map_err(AgentError::fs)?;

    // Iterative walk; the tree comes off the wire, so no recursion depth
    // guarantees.
    let mut stack: Vec<(std::path::PathBuf, &serde_json::Map<String, Value>)> =
        vec![(root, tree)];
    while let Some((dir, entries)) = stack.pop() {
        for (name, value) in entries {
            // Entry names are single components; anything else is remapped
            // the same way user paths are.
            let target = safe_path::resolve(&dir, name);
            match value {
                Value::String(content) => {
                    tokio::fs::write(&target, content.as_bytes())
                        .await
                        .map_err(AgentError::fs)?;
                }
                Value::Object(children) => {
                    tokio::fs::create_dir_all(&target)
                        .await
                        .map_err(AgentError::fs)?;
                    stack.push((target, children));
                }
                other => {
                    return Err(AgentError::Filesystem(format!(
                        "mount entry {name:?} must be a string or object, got {other}"
                    )));
                }
            }
        }
    }
    Ok(Value::Null)
}
