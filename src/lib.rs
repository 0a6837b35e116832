pub mod agent;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod error;
pub mod model;
pub mod observer;
pub mod persistence;
pub mod runner;
pub mod runtime;
pub mod state;
pub mod termination;
pub mod topology;
pub mod transcript;
pub mod workflow;

#[cfg(test)]
mod tests;
