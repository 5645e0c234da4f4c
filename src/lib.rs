pub mod changeset;
pub mod cli;
pub mod config;
pub mod pipeline;
pub mod runtime;
pub mod sandbox;
pub mod shared;
