//! Transcoder supervision
//!
//! Owns the external ffmpeg process that turns the RTSP feed into HLS
//! segments on local disk. The process is modeled as a black-box capability
//! (`start` / `wait` / `stop`) behind traits so the session loop and its
//! tests never depend on a real binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::error::{AgentError, Result};

/// Name of the rolling manifest written into the output directory.
pub const MANIFEST_FILENAME: &str = "playlist.m3u8";

/// A running transcoder process.
#[async_trait]
pub trait TranscoderProcess: Send + std::fmt::Debug {
    /// Block until the process exits.
    ///
    /// A healthy transcoder runs until stopped, so any exit is a session
    /// failure: non-zero exits carry the code or signal, and a zero exit is
    /// reported as "exited unexpectedly". `Ok` exists for fakes.
    async fn wait(&mut self) -> Result<()>;

    /// Ask the process to terminate. Never blocks; the owner joins `wait`.
    fn stop(&mut self);
}

/// Capability to launch a transcoder for one session.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Clear and recreate `output_dir`, then launch the transcoder reading
    /// `source_url` and writing segments plus [`MANIFEST_FILENAME`] into it.
    async fn start(
        &self,
        source_url: &str,
        output_dir: &Path,
    ) -> Result<Box<dyn TranscoderProcess>>;
}

/// ffmpeg-backed transcoder: audio disabled, video copied without
/// re-encoding, RTSP forced to TCP, short-segment HLS output with
/// old-segment deletion.
pub struct FfmpegTranscoder {
    binary: String,
    rtsp_transport: String,
    extra_args: Vec<String>,
}

impl FfmpegTranscoder {
    pub fn new(settings: &Settings) -> Self {
        Self {
            binary: settings.ffmpeg.path.clone(),
            rtsp_transport: settings.ffmpeg.rtsp_transport.clone(),
            extra_args: settings.ffmpeg.extra_args.clone(),
        }
    }

    fn build_args(&self, source_url: &str, manifest_path: &Path) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-rtsp_transport".to_string(),
            self.rtsp_transport.clone(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args.extend([
            "-i".to_string(),
            source_url.to_string(),
            "-an".to_string(),
            "-c:v".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            "2".to_string(),
            "-hls_list_size".to_string(),
            "6".to_string(),
            "-hls_flags".to_string(),
            "delete_segments".to_string(),
            "-y".to_string(),
            manifest_path.to_string_lossy().into_owned(),
        ]);
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn start(
        &self,
        source_url: &str,
        output_dir: &Path,
    ) -> Result<Box<dyn TranscoderProcess>> {
        reset_output_dir(output_dir).await?;

        let manifest_path = output_dir.join(MANIFEST_FILENAME);
        let args = self.build_args(source_url, &manifest_path);

        tracing::info!(
            binary = %self.binary,
            output = %output_dir.display(),
            "starting transcoder"
        );

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::TranscoderStart {
                binary: self.binary.clone(),
                source,
            })?;

        let drain = child.stderr.take().map(|stderr| tokio::spawn(drain_stderr(stderr)));

        Ok(Box::new(FfmpegProcess { child, drain }))
    }
}

/// Handle to a spawned ffmpeg process plus its stderr drain task.
#[derive(Debug)]
struct FfmpegProcess {
    child: Child,
    drain: Option<JoinHandle<()>>,
}

#[async_trait]
impl TranscoderProcess for FfmpegProcess {
    async fn wait(&mut self) -> Result<()> {
        let status = self.child.wait().await?;

        // The drain task ends on stderr EOF once the child is gone.
        if let Some(drain) = self.drain.take() {
            let _ = drain.await;
        }

        match status.code() {
            Some(0) => Err(AgentError::TranscoderEnded),
            Some(code) => Err(AgentError::TranscoderExited { code }),
            None => Err(AgentError::TranscoderSignaled {
                signal: exit_signal(&status),
            }),
        }
    }

    fn stop(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                return;
            }
        }

        let _ = self.child.start_kill();
    }
}

/// Clear and recreate the session output directory so stale segments from a
/// prior crash are never re-served.
async fn reset_output_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// Read the child's stderr line by line and surface each non-empty line as a
/// diagnostic. Runs as its own task so a full pipe can never stall ffmpeg.
async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if !line.is_empty() {
            tracing::info!(target: "ffmpeg", "{line}");
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(0)
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> i32 {
    0
}

/// Session output directory, a disposable scratch area next to the settings
/// file.
pub fn output_dir_for(settings_path: &Path) -> PathBuf {
    match settings_path.parent() {
        Some(dir) => dir.join("hls"),
        None => PathBuf::from("hls"),
    }
}
