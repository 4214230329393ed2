#![forbid(unsafe_code)]

//! docchat: client for a document and audio chat service.
//!
//! Library entry point: session-identifier management, the upload/status/
//! chat API client, and the upload state machine. The binary (`main.rs`) is
//! a thin CLI wrapper around this library.

pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod model;
pub mod session;
pub mod storage;
pub mod sync;
pub mod upload;
