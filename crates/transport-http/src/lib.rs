// HTTP transport for streaming audio

pub mod client;
pub mod source;

pub use client::{HttpClient, HttpOptions};
pub use source::HttpDataSource;
