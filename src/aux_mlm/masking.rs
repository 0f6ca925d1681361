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

use crate::AuxQaError;
use tch::{Kind, Tensor};
use tracing::debug;

/// Label value excluded from the masked language model loss.
pub const IGNORE_INDEX: i64 = -100;

/// Probability for a selected span (or token) to be replaced by the mask token.
pub const MASK_TOKEN_PROBABILITY: f64 = 0.8;

/// Probability for a selected span (or token) not replaced by the mask token to be
/// replaced by a random token. The remaining selections are left unchanged.
pub const RANDOM_TOKEN_PROBABILITY: f64 = 0.5;

/// # Vocabulary information required to rewrite a batch
#[derive(Debug, Clone, PartialEq)]
pub struct MaskingVocabulary {
    /// Random replacement tokens are drawn from `[0, vocab_size)`
    pub vocab_size: i64,
    /// Token id written at masked positions
    pub mask_token_id: i64,
    /// Structural token ids (e.g. `[CLS]`, `[SEP]`, `[PAD]`) that are never perturbed
    pub protected_token_ids: Vec<i64>,
}

/// Rewritten inputs and the matching masked language model labels.
#[derive(Debug)]
pub struct MaskedBatch {
    /// Input ids of shape (*batch size*, *sequence_length*) after masking
    pub input_ids: Tensor,
    /// Labels of shape (*batch size*, *sequence_length*): the original token id at supervised positions, `IGNORE_INDEX` elsewhere
    pub labels: Tensor,
}

/// # Masking strategy for the auxiliary masked language model task
/// Rewrites a batch of input ids and produces the labels used to score the rewritten positions.
/// The caller's tensor is left untouched, all new tensors are created on its device.
pub trait BatchMasker {
    fn mask_batch(
        &self,
        input_ids: &Tensor,
        vocabulary: &MaskingVocabulary,
    ) -> Result<MaskedBatch, AuxQaError>;
}

/// Boolean tensor flagging the positions of `input_ids` holding one of the protected token ids.
pub fn protected_tokens_mask(input_ids: &Tensor, protected_token_ids: &[i64]) -> Tensor {
    protected_token_ids.iter().fold(
        input_ids.zeros_like().to_kind(Kind::Bool),
        |protected, token_id| protected.logical_or(&input_ids.eq(*token_id)),
    )
}

/// Checks the batch layout and vocabulary, returning (*batch size*, *sequence_length*).
/// The mask token id must lie in `[0, vocab_size)`.
pub(crate) fn validate_masking_inputs(
    input_ids: &Tensor,
    vocabulary: &MaskingVocabulary,
) -> Result<(i64, i64), AuxQaError> {
    if vocabulary.vocab_size <= 0 {
        return Err(AuxQaError::InvalidConfigurationError(format!(
            "vocabulary size must be positive, got {}",
            vocabulary.vocab_size
        )));
    }
    if !(0..vocabulary.vocab_size).contains(&vocabulary.mask_token_id) {
        return Err(AuxQaError::InvalidConfigurationError(format!(
            "mask token id must be in [0, {}), got {}",
            vocabulary.vocab_size, vocabulary.mask_token_id
        )));
    }
    if input_ids.dim() != 2 {
        return Err(AuxQaError::ValueError(format!(
            "masking expects input ids of shape (batch size, sequence length), got {:?}",
            input_ids.size()
        )));
    }
    Ok(input_ids.size2()?)
}

/// Applies the masking decisions to a batch.
///
/// * `selected` - positions supervised by the masked language model loss
/// * `masked` - positions replaced by the mask token
/// * `randomized` - positions replaced by a random token (takes precedence over `masked`)
///
/// Positions holding a protected token are removed from all three sets before
/// the labels are built. Selected positions that are neither masked nor randomized keep
/// their original token and are still supervised.
pub(crate) fn rewrite_masked_batch(
    input_ids: &Tensor,
    selected: &Tensor,
    masked: &Tensor,
    randomized: &Tensor,
    vocabulary: &MaskingVocabulary,
) -> MaskedBatch {
    let allowed = protected_tokens_mask(input_ids, &vocabulary.protected_token_ids).logical_not();
    let masked = masked.to_kind(Kind::Bool).logical_and(&allowed);
    let randomized = randomized.to_kind(Kind::Bool).logical_and(&allowed);
    let supervised = selected
        .to_kind(Kind::Bool)
        .logical_and(&allowed)
        .logical_or(&masked)
        .logical_or(&randomized);

    let labels = input_ids.masked_fill(&supervised.logical_not(), IGNORE_INDEX);

    let random_words = Tensor::randint(
        vocabulary.vocab_size,
        input_ids.size().as_slice(),
        (input_ids.kind(), input_ids.device()),
    );
    let rewritten = input_ids.masked_fill(&masked, vocabulary.mask_token_id);
    let rewritten = random_words.where_self(&randomized, &rewritten);

    debug!(
        supervised = supervised.sum(Kind::Int64).int64_value(&[]),
        masked = masked.sum(Kind::Int64).int64_value(&[]),
        randomized = randomized.sum(Kind::Int64).int64_value(&[]),
        "rewrote masked language model batch"
    );

    MaskedBatch {
        input_ids: rewritten,
        labels,
    }
}
