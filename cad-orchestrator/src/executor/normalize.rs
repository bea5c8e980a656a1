//! Export normalization: collapse a (possibly multi-file) export into one
//! self-contained string

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Read an export file and return it as a single payload.
///
/// Text glTF has its sibling-file buffer and image URIs rewritten as inline
/// base64 data URIs. Other text is returned unchanged, including text that
/// fails to parse as JSON. Non-text files become a base64 data URI.
pub fn normalize_export(path: &Path) -> io::Result<String> {
    let bytes = std::fs::read(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    match String::from_utf8(bytes) {
        Ok(text) => Ok(inline_gltf_text(&text, dir).unwrap_or(text)),
        Err(e) => Ok(data_uri(binary_mime(path), e.as_bytes())),
    }
}

/// `data:` URI for arbitrary bytes
pub fn data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

fn binary_mime(path: &Path) -> &'static str {
    match extension(path).as_deref() {
        Some("glb") => "model/gltf-binary",
        _ => "application/octet-stream",
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

/// Inline external resources of a glTF JSON document. Returns `None` when
/// the text is not a JSON object.
fn inline_gltf_text(text: &str, dir: &Path) -> Option<String> {
    let mut doc: Value = serde_json::from_str(text).ok()?;
    if !doc.is_object() {
        return None;
    }

    let mut inlined = 0usize;
    for (key, default_mime) in [("buffers", "application/octet-stream"), ("images", "")] {
        let Some(entries) = doc.get_mut(key).and_then(Value::as_array_mut) else {
            continue;
        };
        for entry in entries {
            if inline_entry(entry, dir, default_mime) {
                inlined += 1;
            }
        }
    }

    debug!(inlined, "Normalized glTF export");
    serde_json::to_string(&doc).ok()
}

fn inline_entry(entry: &mut Value, dir: &Path, default_mime: &str) -> bool {
    let Some(uri) = entry.get("uri").and_then(Value::as_str) else {
        return false;
    };
    if uri.starts_with("data:") {
        return false;
    }
    let Some(path) = sibling_path(dir, uri) else {
        return false;
    };
    let Ok(bytes) = std::fs::read(&path) else {
        return false;
    };

    let mime = match default_mime {
        "" => image_mime(&path),
        mime => mime,
    };
    entry["uri"] = Value::String(data_uri(mime, &bytes));
    true
}

fn image_mime(path: &Path) -> &'static str {
    match extension(path).as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Resolve a relative URI inside `dir`; anything that could escape it is
/// refused
fn sibling_path(dir: &Path, uri: &str) -> Option<PathBuf> {
    let relative = Path::new(uri);
    if uri.contains("://")
        || !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }
    Some(dir.join(relative))
}
