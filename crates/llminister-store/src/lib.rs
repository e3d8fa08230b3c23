//! Storage layer: append-only artifact files, one file per working-set question,
//! and a workspace that resets both together.

mod artifacts;
mod error;
mod fsio;
mod questions;
mod workspace;

pub use artifacts::ArtifactStore;
pub use error::StoreError;
pub use questions::QuestionStore;
pub use workspace::{Workspace, WriterGuard};
