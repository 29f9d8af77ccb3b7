//! License activation and binding cache
//!
//! Enforcement happens exactly once, at startup. The binding — a digest
//! of `url|key|server_id` — is cached on disk after a successful
//! activation, so restarts (and offline starts) skip the network call
//! as long as the config has not changed. Nothing else in the process
//! consults licensing.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::LicenseConfig;
use crate::error::{Error, Result};

#[derive(Serialize)]
struct ActivateRequest<'a> {
    license: &'a str,
    server_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ActivateResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    used: i64,
    #[serde(default)]
    limit: i64,
    #[serde(default)]
    #[allow(dead_code)]
    newly_bound: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    binding: String,
    validated_at: u64,
}

/// Validate the license or fail startup.
pub async fn enforce(cfg: &LicenseConfig) -> Result<()> {
    let base = cfg.url.trim().trim_end_matches('/').to_string();
    let key = cfg.key.trim();
    if base.is_empty() || key.is_empty() {
        return Err(Error::License("license config missing".into()));
    }

    let server_id = match cfg.server_id.trim() {
        "" => compute_server_id(),
        sid => sid.to_string(),
    };

    let binding = binding_key(&base, key, &server_id);
    let path = cache_path();
    if is_cached(&path, &binding) {
        debug!("license binding cached, skipping activation");
        return Ok(());
    }

    activate(&base, key, &server_id, Duration::from_secs(cfg.timeout_sec)).await?;

    if let Err(e) = write_cache(&path, &binding) {
        warn!("failed to write license cache {}: {}", path.display(), e);
    }
    Ok(())
}

fn binding_key(base: &str, key: &str, server_id: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}|{}", base, key, server_id).as_bytes());
    hex::encode(digest)
}

fn cache_path() -> PathBuf {
    if let Ok(p) = std::env::var("PAQET_LICENSE_CACHE") {
        let p = p.trim();
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    if cfg!(windows) {
        let program_data = std::env::var("ProgramData")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| r"C:\ProgramData".to_string());
        PathBuf::from(program_data).join("paqet").join("license-cache.json")
    } else {
        PathBuf::from("/var/lib/paqet/license-cache.json")
    }
}

fn is_cached(path: &std::path::Path, binding: &str) -> bool {
    let Ok(bytes) = std::fs::read(path) else {
        return false;
    };
    let Ok(entry) = serde_json::from_slice::<CacheEntry>(&bytes) else {
        return false;
    };
    entry.binding.trim() == binding
}

fn write_cache(path: &std::path::Path, binding: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let entry = CacheEntry {
        binding: binding.to_string(),
        validated_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    };
    let payload = serde_json::to_vec(&entry)?;
    std::fs::write(path, payload)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

async fn activate(base: &str, key: &str, server_id: &str, timeout: Duration) -> Result<()> {
    let body = serde_json::to_vec(&ActivateRequest {
        license: key,
        server_id,
    })
    .map_err(|e| Error::License(format!("failed to encode activation request: {}", e)))?;

    let request = Request::post(format!("{}/v1/activate", base))
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| Error::License(format!("failed to build activation request: {}", e)))?;

    let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build_http();

    let response = tokio::time::timeout(timeout, client.request(request))
        .await
        .map_err(|_| Error::License("license server timed out".into()))?
        .map_err(|e| Error::License(format!("license server unreachable: {}", e)))?;

    let status = response.status();
    let body = tokio::time::timeout(timeout, response.into_body().collect())
        .await
        .map_err(|_| Error::License("license server timed out".into()))?
        .map_err(|e| Error::License(format!("license response truncated: {}", e)))?
        .to_bytes();

    let mut res: ActivateResponse = serde_json::from_slice(&body).unwrap_or_default();

    if status != StatusCode::OK || !res.ok {
        if res.reason.is_empty() {
            res.reason = String::from_utf8_lossy(&body).trim().to_string();
        }
        if res.reason.is_empty() {
            res.reason = if status != StatusCode::OK {
                "forbidden".into()
            } else {
                "denied".into()
            };
        }
        return Err(Error::License(format!(
            "license denied: reason={} used={} limit={}",
            res.reason, res.used, res.limit
        )));
    }

    Ok(())
}

/// Stable per-machine identifier: machine-id where available, hostname
/// otherwise. Oversized ids collapse to a digest form.
fn compute_server_id() -> String {
    let machine_id = read_first_non_empty(&["/etc/machine-id", "/var/lib/dbus/machine-id"]);
    let hostname = read_hostname();

    let base = if !machine_id.is_empty() {
        machine_id
    } else if !hostname.is_empty() {
        hostname.clone()
    } else {
        "unknown".to_string()
    };

    let combined = if !hostname.is_empty() && !base.contains(&hostname) {
        format!("{}-{}", hostname, base)
    } else {
        base
    };
    let combined = combined.trim().to_string();

    if combined.len() <= 128 {
        combined
    } else {
        format!("sid-{}", hex::encode(Sha256::digest(combined.as_bytes())))
    }
}

fn read_first_non_empty(paths: &[&str]) -> String {
    for path in paths {
        if let Ok(content) = std::fs::read_to_string(path) {
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    String::new()
}

fn read_hostname() -> String {
    if let Ok(content) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let trimmed = content.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    for var in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(v) = std::env::var(var) {
            let trimmed = v.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
    }
    String::new()
}
