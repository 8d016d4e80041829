//! Core modules for Molt's storage engine.
//!
//! Storage, locking, configuration and the tool-dispatch surface live here;
//! the context-store behaviours built on top of them live in `plugins`.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod locks;
pub mod output;
pub mod rpc;
pub mod schemas;
pub mod store;
pub mod time;
pub mod vocab;
