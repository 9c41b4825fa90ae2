pub mod buffer;
pub mod compose;
pub mod config;
pub mod daemon;
pub mod db;
pub mod engine;
pub mod error;
pub mod feed;
pub mod generation;
pub mod llm;
pub mod models;
pub mod notify;
pub mod poller;
pub mod publish;
pub mod registry;
pub mod retry;
pub mod rotation;
pub mod server;
pub mod store;
pub mod subscriber;
