//! Reverse proxies: subdomain routing to sandboxes and the upstream API
//! credential proxy.

pub mod headers;
pub mod pages;
pub mod subdomain;
pub mod upstream;
