//! RTSP bridge agent
//!
//! Unattended edge agent that pulls a live RTSP camera feed, hands it to an
//! external ffmpeg process, and relays the resulting HLS manifest and
//! segments to a remote backend over HTTP, recovering automatically from
//! camera drop-outs, transcoder crashes, and network failures.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          bridge-agent                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  settings file ──┐                                               │
//! │  pairing (HTTP) ─┴─▶ Settings (resolved once, immutable)         │
//! │                          │                                       │
//! │                          ▼                                       │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │ Session Loop  (backoff 5s → 60s between failed sessions)   │  │
//! │  │                                                            │  │
//! │  │  ┌───────────────────┐ writes  ┌────────────────────────┐  │  │
//! │  │  │ Transcoder        │────────▶│ output dir             │  │  │
//! │  │  │ (ffmpeg, HLS)     │  files  │ playlist.m3u8, *.ts    │  │  │
//! │  │  └───────────────────┘         └───────────┬────────────┘  │  │
//! │  │                                   scans 1s │               │  │
//! │  │                                            ▼               │  │
//! │  │  ┌───────────────────┐  uploads ┌────────────────────────┐ │  │
//! │  │  │ Uploader          │◀─────────│ Synchronizer + Ledger  │ │  │
//! │  │  │ (retry 2s → 30s)  │          │ (exactly-once segments)│ │  │
//! │  │  └─────────┬─────────┘          └────────────────────────┘ │  │
//! │  └────────────│───────────────────────────────────────────────┘  │
//! │               ▼                                                  │
//! │         backend (HTTP)                                           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod pairing;
pub mod retry;
pub mod session;
pub mod sync;
pub mod transcoder;
pub mod uploader;

pub use config::Settings;
pub use error::{AgentError, Result};
pub use session::SessionLoop;
