pub mod capabilities;
pub mod cli;
pub mod daemon;
pub mod errors;
pub mod models;
pub mod registry;
pub mod server;
pub mod storage;
