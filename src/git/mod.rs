//! Subprocess orchestration of the system `git` binary.

pub mod commands;

pub use commands::{clone_mirror, fetch_mirror, optimize_repo, upload_pack_command};
