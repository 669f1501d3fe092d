pub mod config;
pub mod discovery;
pub mod http;
pub mod labels;
pub mod relabel;
pub mod scrape;
pub mod signal;
pub mod sink;
pub mod trace;

#[macro_use]
extern crate tracing;

#[macro_use]
extern crate lazy_static;

/// Scout's basic error type, dynamically dispatched and safe to send across threads
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Scout's basic result type, defined in terms of [`Error`] and generic over `T`
pub type Result<T> = std::result::Result<T, Error>;
