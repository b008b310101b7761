//! Concrete [`ProviderClient`](crate::ingest::connector::ProviderClient) implementations.

pub mod http;

pub use http::HttpProviderClient;
