//! Transcribe stage: uploaded debate media to a speaker-labelled transcript.

pub mod client;
pub mod worker;

pub use client::{TranscribeError, TranscriptionClient, TranscriptionConfig};
pub use worker::TranscribeWorker;
