//! The _secsigner_ library crate.
//!
//! Keeps the registry of cryptographic tokens, their keys, certificates
//! and certificate requests, and applies typed requests against it using
//! the drivers of the devices the tokens live on.
#[macro_use]
extern crate log;

pub mod commons;
pub mod config;
pub mod constants;
pub mod device;
pub mod handlers;
pub mod server;
pub mod tokens;
