//! Diagnostic request building and model invocation.

mod client;
mod parse;
pub mod prompt;

pub use client::ModelClient;
pub use prompt::build;
