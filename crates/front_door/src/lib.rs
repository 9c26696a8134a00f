//! HTTP entry point of the function dispatcher.

pub mod config;
pub mod http;
pub mod invoke;
pub mod knobs;
mod metrics;
pub mod router;
