pub mod board;
pub mod conductor;
pub mod config;
pub mod coordination;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod node;
pub mod persistence;
pub mod shutdown;
