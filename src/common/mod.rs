pub(crate) mod activations;
pub mod config;
pub(crate) mod dropout;
pub(crate) mod embeddings;
pub mod error;
pub(crate) mod init;

pub use activations::Activation;
pub use config::Config;
