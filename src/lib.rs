#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod app;
pub mod cli;
pub mod config;
pub mod controller;
pub mod cursor;
pub mod data;
pub mod error;
pub mod identity;
pub mod registry;
pub mod storage;
pub mod trigger;
pub mod vote;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
