pub mod agent;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod report;
pub mod storage;
pub mod stream;
pub mod types;

pub use types::*;
