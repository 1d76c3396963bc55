pub mod app;
pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod fsops;
pub mod height;
pub mod lock;
pub mod observability;
pub mod pause;
pub mod service;
pub mod validator;

#[cfg(test)]
mod testing;
