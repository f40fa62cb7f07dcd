pub mod backend;
pub mod client;
pub mod logging;
#[cfg(test)]
pub mod mock_client;
pub mod stream;

pub use backend::BackendClient;
pub use client::{ApiClient, ByteStream};
