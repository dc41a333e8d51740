mod client;
mod context;
pub mod links;
mod logs;
mod publish;
mod runs;
mod types;

#[cfg(test)]
mod tests;

pub use client::GitHubClient;
