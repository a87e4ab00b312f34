pub mod client;
pub mod gateway;

pub use client::{HtmlFetcher, HttpFetcher};
pub use gateway::{create_shared_gateway, RsiGateway, SharedRsiGateway};
