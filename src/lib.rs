//! An authoritative DNS server for utility zones, signed on the fly.

pub mod config;
pub mod dnssec;
pub mod edns;
pub mod http;
pub mod log;
pub mod names;
pub mod response;
pub mod serve;
pub mod store;
pub mod util;
pub mod zones;
