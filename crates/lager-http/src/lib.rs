//! JSON:API-over-HTTP transport for lager stores.

pub mod adapter;
pub mod config;
pub mod keys;

pub use adapter::{query_pairs, HttpAdapter};
pub use config::{ConfigError, HttpConfig};
pub use keys::KeyStyle;
