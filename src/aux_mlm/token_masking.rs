// Copyright 2019 Guillaume Becquin
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::aux_mlm::masking::{
    protected_tokens_mask, rewrite_masked_batch, validate_masking_inputs, BatchMasker,
    MaskedBatch, MaskingVocabulary, MASK_TOKEN_PROBABILITY, RANDOM_TOKEN_PROBABILITY,
};
use crate::aux_mlm::span_masking::check_probability;
use crate::AuxQaError;
use tch::{Kind, Tensor};
use tracing::debug;

/// # Single token masker
/// BERT/RoBERTa style masking: every non-protected token is selected independently with
/// probability `mlm_probability`. Selected tokens are replaced by the mask token (80%), by a random
/// token (10%) or kept unchanged (10%); all of them are supervised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenMasker {
    mlm_probability: f64,
}

impl Default for TokenMasker {
    fn default() -> Self {
        TokenMasker {
            mlm_probability: 0.15,
        }
    }
}

impl TokenMasker {
    pub fn new(mlm_probability: f64) -> Result<TokenMasker, AuxQaError> {
        check_probability("mlm_probability", mlm_probability)?;
        Ok(TokenMasker { mlm_probability })
    }
}

impl BatchMasker for TokenMasker {
    fn mask_batch(
        &self,
        input_ids: &Tensor,
        vocabulary: &MaskingVocabulary,
    ) -> Result<MaskedBatch, AuxQaError> {
        let (batch_size, sequence_length) = validate_masking_inputs(input_ids, vocabulary)?;
        let shape = [batch_size, sequence_length];
        let device = input_ids.device();

        let protected = protected_tokens_mask(input_ids, &vocabulary.protected_token_ids);
        let selected = Tensor::full(shape, self.mlm_probability, (Kind::Double, device))
            .masked_fill(&protected, 0.0)
            .bernoulli()
            .to_kind(Kind::Bool);
        let masked = Tensor::full(shape, MASK_TOKEN_PROBABILITY, (Kind::Double, device))
            .bernoulli()
            .to_kind(Kind::Bool)
            .logical_and(&selected);
        let randomized = Tensor::full(shape, RANDOM_TOKEN_PROBABILITY, (Kind::Double, device))
            .bernoulli()
            .to_kind(Kind::Bool)
            .logical_and(&selected)
            .logical_and(&masked.logical_not());

        debug!(batch_size, sequence_length, "sampled masked tokens");

        Ok(rewrite_masked_batch(
            input_ids,
            &selected,
            &masked,
            &randomized,
            vocabulary,
        ))
    }
}
