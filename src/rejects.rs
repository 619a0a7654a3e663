//! Archive of inbound payloads that failed validation, for offline analysis.
//!
//! Files land in `{dir}/{kind}/{timestamp}_{device}.json`. Writing is
//! best-effort: errors are logged and swallowed so ingestion never stalls on
//! a full disk.

use std::path::PathBuf;

use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RejectArchive {
    dir: PathBuf,
}

impl RejectArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write `payload` under `kind` (e.g. `"data"`), suffixed with the device
    /// id when one could be read from it. Returns the path on success.
    pub async fn save(&self, kind: &str, device_id: Option<&str>, payload: &[u8]) -> Option<PathBuf> {
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let filename = match device_id.map(sanitize).filter(|s| !s.is_empty()) {
            Some(device) => format!("{ts}_{device}.json"),
            None => format!("{ts}.json"),
        };

        let dir = self.dir.join(sanitize(kind));
        let path = dir.join(filename);

        if let Err(e) = fs::create_dir_all(&dir).await {
            warn!(path = %path.display(), error = %e, "Failed to create reject directory");
            return None;
        }

        // Pretty-print valid JSON; keep anything else byte for byte.
        let content = serde_json::from_slice::<serde_json::Value>(payload)
            .ok()
            .and_then(|v| serde_json::to_vec_pretty(&v).ok())
            .unwrap_or_else(|| payload.to_vec());

        match fs::write(&path, &content).await {
            Ok(()) => {
                debug!(path = %path.display(), bytes = content.len(), "Rejected payload archived");
                Some(path)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to archive rejected payload");
                None
            }
        }
    }
}

/// Keep device ids from escaping the archive directory.
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
