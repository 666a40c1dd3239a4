pub mod cli;
pub mod config;
pub mod error;
pub mod telemetry;
pub mod registry;
pub mod session;
pub mod classifier;
pub mod dispatch;
pub mod combine;
pub mod evaluate;
pub mod engine;
pub mod server;

#[cfg(test)]
mod tests;
