//! HTTP-facing services: the main gateway pipeline and the pingora
//! `Service` adapters that drive each module's background ticker.

pub mod background;
pub mod http;

pub use http::HttpService;
