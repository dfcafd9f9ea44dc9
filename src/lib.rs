//! WHIP Broadcast - WebRTC ingest with viewer fanout
//!
//! This crate accepts WHIP publishers, negotiates their peer connections and
//! fans each ingested stream out to any number of viewers through the
//! broadcaster channels.

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod events;
pub mod state;
pub mod utils;
pub mod web;
pub mod webrtc;
pub mod whip;

pub use error::{AppError, Result};
