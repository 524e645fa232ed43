//! Ingestion: transcoder processes, source discovery and supervision.

pub mod engine;
pub mod events;
pub mod ffmpeg;
mod process_runner;
pub mod restart_tracker;
pub mod rtp;
pub mod supervisor;
pub mod tap;

pub use engine::{IngestEngine, IngestLaunch, IngestProcess, ProcessExit};
pub use events::{FailureKind, IngestEvent};
pub use ffmpeg::FfmpegEngine;
pub use supervisor::{IngestLiveness, IngestPolicy, IngestionHandle, IngestionSupervisor};
