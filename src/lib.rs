//! watchmen-graphite ships the health-check results of a watchmen monitoring
//! engine into graphite. Every check becomes one or more time-series samples
//! streamed over graphite's plaintext protocol and, where operators ask for
//! it, a discrete annotation posted to graphite-web's events API.
//!
//! The interesting part is the delivery transport. Samples are produced
//! synchronously on the monitoring engine's own threads, so handing one off
//! must _never_ block or fail, no matter what state the graphite relay is
//! in. Samples are parked in a bounded `queue::DeliveryQueue` and a single
//! background `sink::Flusher` drains them in order, in batches, over a
//! persistent TCP stream that `sink::ConnectionManager` re-establishes on
//! failure. Memory stays bounded during long outages by the queue's overflow
//! policy.
//!
//! Annotations take the opposite trade-off: they are posted once, best
//! effort, and forgotten. See `annotate` for more.
#![allow(unknown_lints)]
#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate serde_derive;

#[cfg(test)]
extern crate quickcheck;

pub mod annotate;
pub mod config;
pub mod metric;
pub mod plugin;
pub mod protocols;
pub mod queue;
pub mod sink;
pub mod source;
pub mod time;
