//! Output directory synchronizer
//!
//! Polls the transcoder's output directory on a short fixed interval and
//! hands new or changed artifacts to the uploader. A per-session
//! [`Ledger`] keeps segments exactly-once and re-sends the manifest whenever
//! its modification time advances. Polling instead of OS file-watch APIs is
//! deliberate: the directory is small and a 1 s scan is prompt enough.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::uploader::ArtifactSink;

/// In-memory record of which artifacts have been uploaded and when.
///
/// Owned by exactly one synchronizer for the lifetime of one session and
/// never persisted; after a process restart the manifest and any segments
/// still on disk are re-uploaded, which the backend tolerates.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: HashMap<String, SystemTime>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once an artifact has been uploaded at least once.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Timestamp recorded for the last successful upload of `name`.
    pub fn last_upload(&self, name: &str) -> Option<SystemTime> {
        self.entries.get(name).copied()
    }

    /// Record a successful upload.
    pub fn record(&mut self, name: &str, at: SystemTime) {
        self.entries.insert(name.to_string(), at);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scan `output_dir` every `interval` until the token fires, uploading new
/// segments and manifest changes through `sink`.
pub async fn run(
    token: CancellationToken,
    output_dir: PathBuf,
    sink: Arc<dyn ArtifactSink>,
    interval: Duration,
) {
    let mut ledger = Ledger::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!("synchronizer stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = scan_tick(&output_dir, sink.as_ref(), &mut ledger).await {
                    tracing::warn!(
                        dir = %output_dir.display(),
                        error = %e,
                        "failed to read output directory"
                    );
                }
            }
        }
    }
}

/// One scan pass over the output directory.
///
/// Artifact handling is independent per file: a read or upload failure is
/// logged and skipped without touching the rest of the tick. Returns `Err`
/// only when the directory itself cannot be listed.
pub async fn scan_tick(
    output_dir: &Path,
    sink: &dyn ArtifactSink,
    ledger: &mut Ledger,
) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(output_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();

        let metadata = match entry.metadata().await {
            Ok(m) => m,
            Err(e) => {
                // Segments get deleted under us by the transcoder's rolling window
                tracing::debug!(artifact = %name, error = %e, "could not stat artifact");
                continue;
            }
        };
        if metadata.is_dir() {
            continue;
        }

        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".m3u8") {
            sync_manifest(&entry.path(), &name, &metadata, sink, ledger).await;
        } else if lower.ends_with(".ts") {
            sync_segment(&entry.path(), &name, sink, ledger).await;
        }
        // Everything else in the directory is ignored
    }

    Ok(())
}

/// Upload the manifest when its mtime advanced past the ledger entry.
/// The entry moves only on success, so a failed upload retries next tick.
async fn sync_manifest(
    path: &Path,
    name: &str,
    metadata: &std::fs::Metadata,
    sink: &dyn ArtifactSink,
    ledger: &mut Ledger,
) {
    let mtime = match metadata.modified() {
        Ok(t) => t,
        Err(e) => {
            tracing::debug!(artifact = %name, error = %e, "manifest has no usable mtime");
            return;
        }
    };

    if let Some(last) = ledger.last_upload(name) {
        if mtime <= last {
            return;
        }
    }

    let data = match tokio::fs::read(path).await {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(artifact = %name, error = %e, "failed to read manifest");
            return;
        }
    };

    match sink.upload_manifest(&data).await {
        Ok(()) => {
            ledger.record(name, mtime);
            tracing::debug!(artifact = %name, bytes = data.len(), "manifest uploaded");
        }
        Err(AgentError::Cancelled) => {}
        Err(e) => {
            tracing::warn!(artifact = %name, error = %e, "manifest upload failed");
        }
    }
}

/// Upload a segment exactly once: absent from the ledger means not yet
/// delivered, and it is recorded only after the upload succeeds.
async fn sync_segment(path: &Path, name: &str, sink: &dyn ArtifactSink, ledger: &mut Ledger) {
    if ledger.contains(name) {
        return;
    }

    let data = match tokio::fs::read(path).await {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(artifact = %name, error = %e, "failed to read segment");
            return;
        }
    };

    match sink.upload_segment(name, &data).await {
        Ok(()) => {
            ledger.record(name, SystemTime::now());
            tracing::info!(artifact = %name, bytes = data.len(), "segment uploaded");
        }
        Err(AgentError::Cancelled) => {}
        Err(e) => {
            tracing::warn!(artifact = %name, error = %e, "segment upload failed");
        }
    }
}
