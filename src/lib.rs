//! Limitkit - request admission limiters
//!
//! This crate provides interchangeable limiters that decide, per call,
//! whether a unit of work may proceed: an active-request counter, token and
//! leaky buckets, and a sliding window. Counter and window limiters come in
//! a local flavour and a flavour backed by a shared store, so several
//! processes can enforce one limit together.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
