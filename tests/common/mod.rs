//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `host`: a scripted, deterministic host simulation implementing `HostAdapter`
//! - `harness`: session wiring over the loopback transport and an interleaved host loop
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::harness::{netplay_pair, run_frames};
//! use common::host::{Script, ScriptedHost};
//! ```

pub mod harness;
