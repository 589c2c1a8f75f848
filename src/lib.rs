#![forbid(unsafe_code)]

//! Library half of the mediafetch server: job bookkeeping, the yt-dlp adapter
//! and the HTTP surface. The `backend` binary only wires these together.

pub mod api;
pub mod config;
pub mod extractor;
pub mod jobs;
pub mod logging;
pub mod sanitize;
pub mod security;
pub mod stream;
