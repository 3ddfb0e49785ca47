//! Session loop
//!
//! The top-level control loop. One session = start the transcoder, run the
//! synchronizer next to it, block until the transcoder exits or shutdown is
//! requested, then tear both down before deciding what happens next. Any
//! session failure triggers an interruptible backoff and a fresh session;
//! cancellation always ends the loop cleanly.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::{AgentError, Result};
use crate::retry::{wait_interruptible, RetryPolicy};
use crate::transcoder::Transcoder;
use crate::uploader::ArtifactSink;
use crate::sync;

/// Runs sessions until cancelled, with inter-session backoff.
pub struct SessionLoop {
    settings: Settings,
    transcoder: Arc<dyn Transcoder>,
    sink: Arc<dyn ArtifactSink>,
    output_dir: PathBuf,
    policy: RetryPolicy,
}

impl SessionLoop {
    pub fn new(
        settings: Settings,
        transcoder: Arc<dyn Transcoder>,
        sink: Arc<dyn ArtifactSink>,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            settings,
            transcoder,
            sink,
            output_dir,
            policy: RetryPolicy::SESSION,
        }
    }

    /// Override the restart policy, used by tests to shrink delays.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run sessions until the token fires.
    pub async fn run(&self, token: CancellationToken) {
        let mut backoff = self.policy.backoff();

        while !token.is_cancelled() {
            match self.run_session(&token).await {
                Ok(()) => {
                    // Never reached with a real transcoder; resets backoff
                    // after a fake/test session that ends cleanly.
                    tracing::info!("session ended cleanly");
                    backoff.reset();
                }
                Err(AgentError::Cancelled) => break,
                Err(e) => {
                    tracing::error!(error = %e, "session failed");

                    let Some(delay) = backoff.next_delay() else {
                        tracing::error!("session restart attempts exhausted");
                        break;
                    };
                    tracing::info!(
                        delay_secs = delay.as_secs(),
                        "restarting session after backoff"
                    );
                    if wait_interruptible(&token, delay).await.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("session loop stopped");
    }

    /// One end-to-end session attempt.
    ///
    /// A start failure is session-fatal before the synchronizer exists. Once
    /// both are running, the transcoder's exit (or cancellation) ends the
    /// session; the synchronizer is always cancelled and joined before the
    /// outcome is returned, so no task leaks across sessions.
    async fn run_session(&self, token: &CancellationToken) -> Result<()> {
        let mut process = self
            .transcoder
            .start(&self.settings.rtsp_url, &self.output_dir)
            .await?;

        tracing::info!(
            source = %self.settings.masked_rtsp_url(),
            output = %self.output_dir.display(),
            "session started"
        );

        let sync_token = token.child_token();
        let sync_task = tokio::spawn(sync::run(
            sync_token.clone(),
            self.output_dir.clone(),
            self.sink.clone(),
            self.settings.poll_interval(),
        ));

        let exited = tokio::select! {
            res = process.wait() => Some(res),
            _ = token.cancelled() => None,
        };

        let outcome = match exited {
            Some(res) => res,
            None => {
                process.stop();
                let _ = process.wait().await;
                Err(AgentError::Cancelled)
            }
        };

        sync_token.cancel();
        let _ = sync_task.await;

        if token.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        outcome
    }
}
