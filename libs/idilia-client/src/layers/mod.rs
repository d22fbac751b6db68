//! Tower layers applied to every outgoing request

mod default_headers;

pub use default_headers::{DefaultHeadersLayer, DefaultHeadersService};
