//! numgate: number pool and compliant messaging gateway.
//!
//! Owns the lifecycle of leasable telephone numbers, wraps one or more
//! upstream carriers behind a single adapter interface, and enforces
//! STOP/START opt-out compliance on outbound and inbound SMS/MMS traffic.
//!
//! All mutual exclusion is pushed down to SQLite: conditional updates keyed on
//! the current `status` and unique constraints on `e164`, `client_ref`, and
//! the provider message id. See `DESIGN.md` for the component map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod logging;
pub mod phone;

pub mod audit;
pub mod providers;

pub mod inbound;
pub mod messaging;
pub mod numbers;
