//! # DistilBERT encoder (Sanh et al.)
//!
//! Implementation of the DistilBERT encoder ([https://arxiv.org/abs/1910.01108](https://arxiv.org/abs/1910.01108) Sanh, Debut, Chaumond, Wolf, 2019)
//! shared by the question answering and masked language model heads of [`AuxMlmForQuestionAnswering`](crate::aux_mlm::AuxMlmForQuestionAnswering).
//! The configuration file is expected to follow the [Transformers library](https://github.com/huggingface/transformers) layout,
//! and the variable names match the Transformers parameter names so that converted weights can be loaded in the `VarStore`.

mod attention;
mod distilbert_model;
mod embeddings;
mod transformer;

pub use attention::MultiHeadSelfAttention;
pub use distilbert_model::{DistilBertConfig, DistilBertModel};
pub use transformer::{DistilBertTransformerOutput, TransformerBlock};
