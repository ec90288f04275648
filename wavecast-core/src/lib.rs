//! Core of the Wavecast streaming server: the listener-admission pipeline
//! and the file-serving engine, plus the traits it consumes from the
//! subsystems around it (live sources, stats, admin surface).

pub mod admin;
pub mod auth;
pub mod client;
pub mod core;
pub mod error;
pub mod fserve;
pub mod http;
pub mod mime;
pub mod rate;
pub mod source;
pub mod stats;

pub use client::{Client, ClientControl, ClientFlags, ClientState, Connection};
pub use core::{Core, Mount};
pub use error::{CoreError, Result};
