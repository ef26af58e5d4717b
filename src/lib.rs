pub mod client;
pub mod db;
pub mod dedup;
pub mod disposition;
pub mod error;
pub mod fetcher;
pub mod google_api;
mod migrations;
pub mod pipeline;
pub mod propagation;
pub mod queries;
pub mod review;
pub mod server;
pub mod state;
pub mod summarizer;
pub mod types;
