#![forbid(unsafe_code)]

pub mod adapters;
pub mod app;
pub mod book;
pub mod chapter_store;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
mod json_fs;
pub mod ledger;
pub mod locks;
pub mod logging;
pub mod model;
pub mod runtime;
pub mod store;
pub mod workflow;

pub use error::{Result, WorkflowError};
