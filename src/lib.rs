//! Relaygate - a host-routed reverse proxy for AI APIs
//!
//! This library provides a gateway that:
//! - Routes requests by Host header to the messages or completions upstream
//! - Sends every upstream exchange through a rotating pool of egress proxies
//! - Rate limits sources and blacklists those that keep sending bad requests
//! - Streams responses back verbatim while extracting token usage
//! - Relays websocket upgrades and multipart uploads through the same proxies
//! - Writes one structured record per exchange to day-partitioned log files

pub mod admin;
pub mod admission;
pub mod config;
pub mod error;
pub mod forward;
pub mod healthcheck;
pub mod ipguard;
pub mod multipart;
pub mod pool;
pub mod proxy;
pub mod ratelimit;
pub mod request_log;
pub mod tunnel;
pub mod upstream;
pub mod usage;
pub mod websocket;
