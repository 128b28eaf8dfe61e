pub mod backend;
pub mod config;
pub mod coordinator;
pub mod cycler;
pub mod enrich;
pub mod error;
pub mod favorites;
pub mod filters;
pub mod store;
pub mod types;
