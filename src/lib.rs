pub mod api;
pub mod config;
pub mod context;
pub mod describe;
pub mod recommend;
pub mod render;
pub mod state;
pub mod types;
pub mod util;

#[cfg(test)]
pub(crate) mod test_support;
