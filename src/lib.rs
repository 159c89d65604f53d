#![forbid(unsafe_code)]

//! Shared library for the tubetutor backend: configuration, the tutorial
//! generation engines, and the streaming plumbing that turns upstream model
//! output into the SSE protocol consumed by the frontend.

pub mod config;
pub mod engines;
pub mod prompt;
pub mod stream;
pub mod subtitles;
pub mod think;
pub mod videoinfo;
