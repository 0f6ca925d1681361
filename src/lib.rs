//! DistilBERT extractive question answering trained jointly with a span-masked language model auxiliary loss.
//!
//! - [`distilbert`]: the shared DistilBERT encoder
//! - [`aux_mlm`]: span and token maskers, the dual-head model and the gamma decay schedule
//! - [`common`]: configuration loading, errors and shared layers
//!
//! Models are built on a `tch::nn::VarStore` and run on any libtorch device.

pub mod aux_mlm;
pub mod common;
pub mod distilbert;

pub use common::error::AuxQaError;
pub use common::Config;
