#[macro_use]
extern crate tracing;

pub mod client;
pub mod connector;
pub mod envelope;
pub mod service;
