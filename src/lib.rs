#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod inventory;
pub mod logging;
pub mod paths;
pub mod progress;
pub mod session;
pub mod ui;
