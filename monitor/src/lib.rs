pub mod archive;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod merge;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod predict;
pub mod registry;
pub mod rest;
pub mod source;
pub mod state;
pub mod validate;

pub use engine::Engine;
pub use errors::{Error, Result};
