pub mod config;
pub mod dream;
pub mod error;
pub mod jobs;
pub mod latent;
pub mod manifest;
