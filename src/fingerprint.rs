//! Content-addressed fingerprints for artifacts and phase configuration.
//!
//! Every change-detection decision in the runner reduces to comparing the
//! hex digests produced here:
//! - files are hashed streaming (SHA-256 over raw bytes);
//! - directories are hashed over a canonical listing `name\0digest\n`
//!   sorted by relative path;
//! - configuration sections are hashed over a canonical JSON serialization
//!   (sorted keys, nulls and empty containers removed, compact separators).

use std::fs;
use std::io::Read;
use std::path::Path;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::DubResult;

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_digest(hasher)
}

#[must_use]
pub fn hash_string(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Streaming SHA-256 over file contents.
pub fn hash_file(path: &Path) -> DubResult<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex_digest(hasher))
}

/// Digest of a canonical directory listing.
///
/// Each regular file below `path` contributes one line `name\0digest\n`
/// where `name` is the `/`-separated relative path. Lines are sorted by
/// name, so the digest is independent of directory iteration order.
pub fn hash_dir(path: &Path) -> DubResult<String> {
    let mut entries = Vec::new();
    collect_files(path, path, &mut entries)?;
    entries.sort();

    let mut hasher = Sha256::new();
    for rel in entries {
        let digest = hash_file(&path.join(&rel))?;
        hasher.update(rel.as_bytes());
        hasher.update(b"\0");
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex_digest(hasher))
}

/// Hash an artifact path, dispatching on file vs directory.
pub fn hash_artifact(path: &Path) -> DubResult<String> {
    if path.is_dir() {
        hash_dir(path)
    } else {
        hash_file(path)
    }
}

/// Canonical JSON serialization used for config fingerprints.
///
/// Keys are emitted in sorted order, `null` values and empty objects or
/// arrays are dropped recursively, and separators are compact. Two configs
/// that differ only in key order or absent-vs-null fields fingerprint
/// identically.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    match prune(value) {
        Some(cleaned) => to_canonical_string(&cleaned),
        None => "null".to_owned(),
    }
}

/// Fingerprint of a phase's effective configuration section.
#[must_use]
pub fn config_fingerprint(section: &Value) -> String {
    hash_string(&canonical_json(section))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> DubResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(rel);
        }
    }
    Ok(())
}

fn prune(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let mut cleaned = Map::new();
            for (key, inner) in map {
                if let Some(kept) = prune(inner) {
                    cleaned.insert(key.clone(), kept);
                }
            }
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        Value::Array(items) => {
            let cleaned: Vec<Value> = items.iter().filter_map(prune).collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Array(cleaned))
            }
        }
        other => Some(other.clone()),
    }
}

fn to_canonical_string(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body = keys
                .iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string serializes"),
                        to_canonical_string(&map[*k])
                    )
                })
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body = items
                .iter()
                .map(to_canonical_string)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{body}]")
        }
        other => serde_json::to_string(other).expect("scalar serializes"),
    }
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
