pub mod auth;
pub mod cache;
pub mod chunker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod keys;
pub mod kms;
pub mod ledger;
pub mod models;
pub mod moderation;
pub mod proxy;
pub mod semaphore;
pub mod state;
pub mod store;
pub mod upstream;
