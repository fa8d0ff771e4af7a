pub mod api;
pub mod client;
pub mod config;
pub mod embeddings;
pub mod inference;
pub mod state;
