//! Core library for the local VPN control plane: subscription management,
//! URI-to-outbound translation, sing-box process supervision, and the
//! HTTP/JSON control API that fronts them. The binary in `main.rs` is a
//! thin wiring layer over this crate.

pub mod api;
pub mod base64_util;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod installer;
pub mod model;
pub mod outbound;
pub mod readiness;
pub mod store;
pub mod supervisor;
pub mod system_proxy;
pub mod traffic;
pub mod uri_parser;

pub use error::{CoreError, Result};
