pub mod config;
pub mod error;
pub mod node;
pub mod persistence;
pub mod protocol;
pub mod renderlog;
pub mod scheduler;
pub mod shutdown;
pub mod worker;
