//! Wiring of the problemd service
//!
//! This crate provides:
//! - Dispatch of protocol commands to the problem service
//! - Delivery of service events to subscribed clients
//! - The daemon main loop, stopped by a shutdown future

mod dispatch;

pub use dispatch::*;
