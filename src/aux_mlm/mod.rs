//! # Question answering with a decaying masked language model auxiliary loss
//!
//! [`AuxMlmForQuestionAnswering`] trains an extractive question answering head and a masked language
//! model head on top of a shared DistilBERT encoder. Inputs are masked on the fly by a [`BatchMasker`]:
//! - [`SpanMasker`]: contiguous spans with geometric lengths, sampled for the whole batch with tensor operations
//! - [`TokenMasker`]: independent tokens
//!
//! The masked language model loss is weighted by a coefficient read from a [`GammaSchedule`]
//! that the caller advances with the `decay_gamma` flag of the forward pass.
//!
//! ```no_run
//! use rust_auxqa::aux_mlm::{AuxMlmConfig, AuxMlmForQuestionAnswering};
//! use rust_auxqa::distilbert::DistilBertConfig;
//! use tch::{nn, Device, Kind, Tensor};
//!
//! # fn main() -> Result<(), rust_auxqa::AuxQaError> {
//! let vs = nn::VarStore::new(Device::Cpu);
//! let config = DistilBertConfig::default();
//! let mut model = AuxMlmForQuestionAnswering::new(&vs.root(), &config, &AuxMlmConfig::default())?;
//! model.add_vocab_size(config.vocab_size);
//! model.set_gammas(vec![1.0, 0.5, 0.0])?;
//!
//! let input_ids = Tensor::randint(config.vocab_size, [2, 64], (Kind::Int64, Device::Cpu));
//! let output = model.forward_t(Some(&input_ids), None, None, None, None, true, true, true)?;
//! assert_eq!(output.gamma, 1.0);
//! # Ok(())
//! # }
//! ```

mod aux_mlm_model;
mod config;
mod gamma;
mod masking;
mod span_masking;
mod token_masking;

pub use aux_mlm_model::{
    combine_losses, masked_lm_loss, question_answering_loss, AuxMlmForQuestionAnswering,
    AuxMlmQuestionAnsweringOutput, DistilBertLMHead,
};
pub use config::{AuxMlmConfig, MaskingStrategy};
pub use gamma::GammaSchedule;
pub use masking::{
    protected_tokens_mask, BatchMasker, MaskedBatch, MaskingVocabulary, IGNORE_INDEX,
    MASK_TOKEN_PROBABILITY, RANDOM_TOKEN_PROBABILITY,
};
pub use span_masking::{SpanBudget, SpanMasker, SpanPlacement, SpanPolicies};
pub use token_masking::TokenMasker;
