pub mod config;
pub mod environment;
pub mod error;
pub mod policy;
pub mod report;
pub mod runner;

#[cfg(test)]
pub mod testing;
