// Copyright 2019-present, the HuggingFace Inc. team, The Google AI Language Team and Facebook, Inc.
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

use crate::aux_mlm::config::AuxMlmConfig;
use crate::aux_mlm::gamma::GammaSchedule;
use crate::aux_mlm::masking::{BatchMasker, MaskedBatch, MaskingVocabulary, IGNORE_INDEX};
use crate::common::dropout::Dropout;
use crate::distilbert::{DistilBertConfig, DistilBertModel, TransformerBlock};
use crate::AuxQaError;
use std::borrow::Borrow;
use tch::nn::Module;
use tch::{nn, Kind, Reduction, Tensor};
use tracing::{debug, warn};

/// # Masked language model head
/// Projects encoder hidden states to vocabulary logits.
/// - `vocab_transform`: linear layer of size (*dim*, *dim*)
/// - `vocab_layer_norm`: layer normalization
/// - `vocab_projector`: linear layer of size (*dim*, *vocab_size*)
#[derive(Debug)]
pub struct DistilBertLMHead {
    vocab_transform: nn::Linear,
    vocab_layer_norm: nn::LayerNorm,
    vocab_projector: nn::Linear,
}

impl DistilBertLMHead {
    pub fn new<'p, P>(p: P, config: &DistilBertConfig) -> DistilBertLMHead
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();

        let vocab_transform = nn::linear(
            p / "vocab_transform",
            config.dim,
            config.dim,
            Default::default(),
        );
        let layer_norm_config = nn::LayerNormConfig {
            eps: 1e-12,
            ..Default::default()
        };
        let vocab_layer_norm =
            nn::layer_norm(p / "vocab_layer_norm", vec![config.dim], layer_norm_config);
        let vocab_projector = nn::linear(
            p / "vocab_projector",
            config.dim,
            config.vocab_size,
            Default::default(),
        );

        DistilBertLMHead {
            vocab_transform,
            vocab_layer_norm,
            vocab_projector,
        }
    }
}

impl Module for DistilBertLMHead {
    fn forward(&self, hidden_states: &Tensor) -> Tensor {
        hidden_states
            .apply(&self.vocab_transform)
            .gelu("none")
            .apply(&self.vocab_layer_norm)
            .apply(&self.vocab_projector)
    }
}

/// # DistilBERT for question answering with an auxiliary masked language model loss
/// Extractive question answering model trained jointly with a span-masked language model objective.
/// The encoder runs once per call and feeds two heads:
/// - `qa_transformer_layer`: an extra transformer block with its own weights, followed by dropout and `qa_outputs`
///   projecting to start and end logits
/// - `lm_head`: `DistilBertLMHead` producing vocabulary logits for the masked positions
///
/// The total loss is `qa_loss + gamma * mlm_loss`, with `gamma` read from a `GammaSchedule`
/// that the caller may advance after each training step.
pub struct AuxMlmForQuestionAnswering {
    distil_bert_model: DistilBertModel,
    qa_transformer_layer: TransformerBlock,
    qa_outputs: nn::Linear,
    dropout: Dropout,
    lm_head: DistilBertLMHead,
    masker: Box<dyn BatchMasker>,
    vocab_size: Option<i64>,
    encoder_vocab_size: i64,
    mask_token_id: i64,
    protected_token_ids: Vec<i64>,
    gamma_schedule: GammaSchedule,
}

/// Container for the auxiliary question answering model output.
pub struct AuxMlmQuestionAnsweringOutput {
    /// Combined loss, `None` when neither gold positions nor masking were provided
    pub loss: Option<Tensor>,
    /// Average of the start and end position cross-entropy losses
    pub qa_loss: Option<Tensor>,
    /// Masked language model cross-entropy loss (before weighting)
    pub mlm_loss: Option<Tensor>,
    /// Weight applied to the masked language model loss for this call
    pub gamma: f64,
    /// Labels of the masked language model task, `IGNORE_INDEX` at unsupervised positions
    pub mlm_labels: Option<Tensor>,
    /// Logits for the start of the answer, shape (*batch size*, *sequence_length*)
    pub start_logits: Tensor,
    /// Logits for the end of the answer, shape (*batch size*, *sequence_length*)
    pub end_logits: Tensor,
    /// Vocabulary logits, shape (*batch size*, *sequence_length*, *vocab_size*)
    pub prediction_scores: Tensor,
    /// Hidden states for all intermediate encoder layers
    pub all_hidden_states: Option<Vec<Tensor>>,
    /// Attention weights for all intermediate encoder layers
    pub all_attentions: Option<Vec<Tensor>>,
}

impl AuxMlmForQuestionAnswering {
    /// Build a new `AuxMlmForQuestionAnswering`
    ///
    /// # Arguments
    ///
    /// * `p` - Variable store path for the root of the model
    /// * `config` - `DistilBertConfig` object defining the encoder architecture. Must define 2 labels.
    /// * `aux_config` - `AuxMlmConfig` object defining the masking strategy and the initial gamma schedule
    ///
    /// # Example
    ///
    /// ```no_run
    /// use rust_auxqa::aux_mlm::{AuxMlmConfig, AuxMlmForQuestionAnswering};
    /// use rust_auxqa::distilbert::DistilBertConfig;
    /// use rust_auxqa::Config;
    /// use std::path::Path;
    /// use tch::{nn, Device};
    ///
    /// let device = Device::Cpu;
    /// let p = nn::VarStore::new(device);
    /// let config = DistilBertConfig::from_file(Path::new("path/to/config.json")).unwrap();
    /// let mut model =
    ///     AuxMlmForQuestionAnswering::new(&p.root(), &config, &AuxMlmConfig::default()).unwrap();
    /// model.add_vocab_size(config.vocab_size);
    /// ```
    pub fn new<'p, P>(
        p: P,
        config: &DistilBertConfig,
        aux_config: &AuxMlmConfig,
    ) -> Result<AuxMlmForQuestionAnswering, AuxQaError>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let num_labels = config.num_labels();
        if num_labels != 2 {
            return Err(AuxQaError::InvalidConfigurationError(format!(
                "question answering requires 2 labels (start and end), got {}",
                num_labels
            )));
        }
        aux_config.validate()?;

        let p = p.borrow();

        let distil_bert_model = DistilBertModel::new(p, config);
        let qa_transformer_layer = TransformerBlock::new(p / "qa_transformer_layer", config);
        let qa_outputs = nn::linear(p / "qa_outputs", config.dim, num_labels, Default::default());
        let dropout = Dropout::new(config.qa_dropout);
        let lm_head = DistilBertLMHead::new(p, config);

        Ok(AuxMlmForQuestionAnswering {
            distil_bert_model,
            qa_transformer_layer,
            qa_outputs,
            dropout,
            lm_head,
            masker: aux_config.build_masker()?,
            vocab_size: None,
            encoder_vocab_size: config.vocab_size,
            mask_token_id: aux_config.mask_token_id,
            protected_token_ids: aux_config.protected_token_ids.clone(),
            gamma_schedule: aux_config.build_gamma_schedule()?,
        })
    }

    /// Sets the number of token ids random replacements are drawn from. Required before masking,
    /// and may not exceed the encoder vocabulary size.
    pub fn add_vocab_size(&mut self, vocab_size: i64) {
        self.vocab_size = Some(vocab_size);
    }

    pub fn set_mask_token(&mut self, mask_token_id: i64) {
        self.mask_token_id = mask_token_id;
    }

    /// Replaces the gamma coefficients and rewinds the schedule.
    pub fn set_gammas(&mut self, gammas: Vec<f64>) -> Result<(), AuxQaError> {
        self.gamma_schedule.reset(gammas)
    }

    pub fn get_gamma(&self) -> f64 {
        self.gamma_schedule.current()
    }

    pub fn gamma_schedule(&self) -> &GammaSchedule {
        &self.gamma_schedule
    }

    pub fn get_output_embeddings(&self) -> &nn::Linear {
        &self.lm_head.vocab_projector
    }

    pub fn set_output_embeddings(&mut self, new_embeddings: nn::Linear) {
        self.lm_head.vocab_projector = new_embeddings;
    }

    /// Re-draws the weights of the question answering transformer block. Encoder weights are left untouched.
    pub fn reset_qa_transformer_layer(&mut self) {
        self.qa_transformer_layer.reset_parameters();
    }

    pub fn masking_vocabulary(&self) -> Result<MaskingVocabulary, AuxQaError> {
        let vocab_size = self.vocab_size.ok_or_else(|| {
            AuxQaError::InvalidConfigurationError(
                "vocabulary size must be set with add_vocab_size() before masking inputs".into(),
            )
        })?;
        if vocab_size > self.encoder_vocab_size {
            return Err(AuxQaError::InvalidConfigurationError(format!(
                "masking vocabulary size {} exceeds the encoder vocabulary size {}",
                vocab_size, self.encoder_vocab_size
            )));
        }
        Ok(MaskingVocabulary {
            vocab_size,
            mask_token_id: self.mask_token_id,
            protected_token_ids: self.protected_token_ids.clone(),
        })
    }

    /// Runs the configured masker on a batch of token ids.
    pub fn mask_inputs(&self, input_ids: &Tensor) -> Result<MaskedBatch, AuxQaError> {
        let vocabulary = self.masking_vocabulary()?;
        self.masker.mask_batch(input_ids, &vocabulary)
    }

    /// Forward pass through the model
    ///
    /// # Arguments
    ///
    /// * `input` - Optional input tensor of shape (*batch size*, *sequence_length*). If None, pre-computed embeddings must be provided (see `input_embeds`)
    /// * `mask` - Optional mask of shape (*batch size*, *sequence_length*). Masked position have value 0, non-masked value 1. If None set to 1
    /// * `input_embeds` - Optional pre-computed input embeddings of shape (*batch size*, *sequence_length*, *hidden_size*). If None, input ids must be provided (see `input`)
    /// * `start_positions` - Optional gold start positions of shape (*batch size*) or (*batch size*, 1)
    /// * `end_positions` - Optional gold end positions of shape (*batch size*) or (*batch size*, 1)
    /// * `mask_inputs` - mask the input ids and compute the masked language model loss. Requires `input` and `add_vocab_size`.
    /// * `decay_gamma` - advance the gamma schedule after reading the weight used by this call
    /// * `train` - boolean flag to turn on/off the dropout layers in the model. Should be set to false for inference.
    ///
    /// # Returns
    ///
    /// * `AuxMlmQuestionAnsweringOutput` containing the losses, the gamma used, the masked language model labels,
    ///   start and end logits, vocabulary logits and the encoder hidden states and attentions
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use tch::{nn, Device, Tensor};
    /// # use tch::kind::Kind::Int64;
    /// use rust_auxqa::aux_mlm::{AuxMlmConfig, AuxMlmForQuestionAnswering};
    /// use rust_auxqa::distilbert::DistilBertConfig;
    /// # let device = Device::Cpu;
    /// # let vs = nn::VarStore::new(device);
    /// # let config = DistilBertConfig::default();
    /// # let mut model = AuxMlmForQuestionAnswering::new(&vs.root(), &config, &AuxMlmConfig::default()).unwrap();
    /// model.add_vocab_size(config.vocab_size);
    /// model.set_gammas(vec![1.0, 0.5, 0.25]).unwrap();
    /// let (batch_size, sequence_length) = (8, 128);
    /// let input_tensor = Tensor::randint(config.vocab_size, &[batch_size, sequence_length], (Int64, device));
    /// let start_positions = Tensor::from_slice(&[3i64, 5, 7, 9, 11, 13, 15, 17]);
    /// let end_positions = &start_positions + 2;
    ///
    /// let output = model
    ///     .forward_t(
    ///         Some(&input_tensor),
    ///         None,
    ///         None,
    ///         Some(&start_positions),
    ///         Some(&end_positions),
    ///         true,
    ///         true,
    ///         true,
    ///     )
    ///     .unwrap();
    /// output.loss.unwrap().backward();
    /// ```
    #[allow(clippy::too_many_arguments)]
    pub fn forward_t(
        &mut self,
        input: Option<&Tensor>,
        mask: Option<&Tensor>,
        input_embeds: Option<&Tensor>,
        start_positions: Option<&Tensor>,
        end_positions: Option<&Tensor>,
        mask_inputs: bool,
        decay_gamma: bool,
        train: bool,
    ) -> Result<AuxMlmQuestionAnsweringOutput, AuxQaError> {
        let masked_batch = if mask_inputs {
            let input_ids = input.ok_or_else(|| {
                AuxQaError::ValueError(
                    "masking inputs requires input ids, pre-computed embeddings cannot be masked"
                        .into(),
                )
            })?;
            Some(self.mask_inputs(input_ids)?)
        } else {
            None
        };
        let encoder_input = match &masked_batch {
            Some(batch) => Some(&batch.input_ids),
            None => input,
        };

        let base_model_output =
            self.distil_bert_model
                .forward_t(encoder_input, mask, input_embeds, train)?;
        let hidden_state = &base_model_output.hidden_state;

        let (qa_hidden_state, _) = self
            .qa_transformer_layer
            .forward_t(hidden_state, mask, train);
        let logits = qa_hidden_state
            .apply_t(&self.dropout, train)
            .apply(&self.qa_outputs)
            .split(1, -1);
        let start_logits = logits[0].squeeze_dim(-1);
        let end_logits = logits[1].squeeze_dim(-1);

        let prediction_scores = hidden_state.apply(&self.lm_head);

        let qa_loss = match (start_positions, end_positions) {
            (Some(start_positions), Some(end_positions)) => Some(question_answering_loss(
                &start_logits,
                &end_logits,
                start_positions,
                end_positions,
            )),
            _ => None,
        };
        let mlm_loss = masked_batch
            .as_ref()
            .map(|batch| masked_lm_loss(&prediction_scores, &batch.labels));

        let gamma = self.gamma_schedule.step(decay_gamma);
        let loss = combine_losses(qa_loss.as_ref(), mlm_loss.as_ref(), gamma);

        debug!(
            gamma,
            qa_loss = ?qa_loss.as_ref().map(|loss| loss.double_value(&[])),
            mlm_loss = ?mlm_loss.as_ref().map(|loss| loss.double_value(&[])),
            "auxiliary question answering forward pass"
        );

        Ok(AuxMlmQuestionAnsweringOutput {
            loss,
            qa_loss,
            mlm_loss,
            gamma,
            mlm_labels: masked_batch.map(|batch| batch.labels),
            start_logits,
            end_logits,
            prediction_scores,
            all_hidden_states: base_model_output.all_hidden_states,
            all_attentions: base_model_output.all_attentions,
        })
    }
}

fn squeeze_positions(positions: &Tensor) -> Tensor {
    let positions = if positions.dim() > 1 {
        positions.squeeze_dim(-1)
    } else {
        positions.shallow_clone()
    };
    positions.to_kind(Kind::Int64)
}

/// Average of the start and end cross-entropy losses. Gold positions outside the sequence are
/// clamped to `sequence_length`, which is ignored by the loss.
pub fn question_answering_loss(
    start_logits: &Tensor,
    end_logits: &Tensor,
    start_positions: &Tensor,
    end_positions: &Tensor,
) -> Tensor {
    let ignored_index = start_logits.size()[1];
    let start_positions = squeeze_positions(start_positions).clamp(0, ignored_index);
    let end_positions = squeeze_positions(end_positions).clamp(0, ignored_index);

    let start_loss = start_logits.cross_entropy_loss::<Tensor>(
        &start_positions,
        None,
        Reduction::Mean,
        ignored_index,
        0.0,
    );
    let end_loss = end_logits.cross_entropy_loss::<Tensor>(
        &end_positions,
        None,
        Reduction::Mean,
        ignored_index,
        0.0,
    );
    (start_loss + end_loss) * 0.5
}

/// Cross-entropy between vocabulary logits and masked language model labels, ignoring `IGNORE_INDEX`.
/// Returns a zero loss connected to the graph when no position is supervised.
pub fn masked_lm_loss(prediction_scores: &Tensor, labels: &Tensor) -> Tensor {
    let supervised = labels.ne(IGNORE_INDEX).sum(Kind::Int64).int64_value(&[]);
    if supervised == 0 {
        warn!("masking produced no supervised position, masked language model loss set to 0");
        return prediction_scores.sum(prediction_scores.kind()) * 0.0;
    }
    let vocab_size = prediction_scores.size()[prediction_scores.dim() - 1];
    prediction_scores
        .view([-1, vocab_size])
        .cross_entropy_loss::<Tensor>(
            &labels.view([-1]),
            None,
            Reduction::Mean,
            IGNORE_INDEX,
            0.0,
        )
}

/// `qa_loss + gamma * mlm_loss`, falling back on whichever term is available.
pub fn combine_losses(
    qa_loss: Option<&Tensor>,
    mlm_loss: Option<&Tensor>,
    gamma: f64,
) -> Option<Tensor> {
    match (qa_loss, mlm_loss) {
        (Some(qa_loss), Some(mlm_loss)) => Some(qa_loss + mlm_loss * gamma),
        (None, Some(mlm_loss)) => Some(mlm_loss * gamma),
        (Some(qa_loss), None) => Some(qa_loss.shallow_clone()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn combine_losses_falls_back_on_available_terms() {
        let qa = Tensor::from(2.0f64);
        let mlm = Tensor::from(4.0f64);

        let total = combine_losses(Some(&qa), Some(&mlm), 0.5).unwrap();
        assert!((total.double_value(&[]) - 4.0).abs() < 1e-9);
        let mlm_only = combine_losses(None, Some(&mlm), 0.25).unwrap();
        assert!((mlm_only.double_value(&[]) - 1.0).abs() < 1e-9);
        let qa_only = combine_losses(Some(&qa), None, 0.25).unwrap();
        assert!((qa_only.double_value(&[]) - 2.0).abs() < 1e-9);
        assert!(combine_losses(None, None, 0.25).is_none());
    }

    #[test]
    fn out_of_range_positions_are_ignored() {
        let start_logits = Tensor::zeros([2, 4], (Kind::Float, Device::Cpu));
        let end_logits = Tensor::zeros([2, 4], (Kind::Float, Device::Cpu));
        let start_positions = Tensor::from_slice(&[1i64, 40]).view([2, 1]);
        let end_positions = Tensor::from_slice(&[2i64, -7]);

        let loss = question_answering_loss(
            &start_logits,
            &end_logits,
            &start_positions,
            &end_positions,
        );
        // uniform logits: each kept position costs ln(4)
        assert!((loss.double_value(&[]) - 4f64.ln()).abs() < 1e-5);
    }

    #[test]
    fn unsupervised_batch_has_zero_mlm_loss() {
        let prediction_scores = Tensor::rand([2, 3, 10], (Kind::Float, Device::Cpu));
        let labels = Tensor::full([2, 3], IGNORE_INDEX, (Kind::Int64, Device::Cpu));

        let loss = masked_lm_loss(&prediction_scores, &labels);
        assert_eq!(loss.double_value(&[]), 0.0);
    }

    #[test]
    fn mlm_loss_only_counts_supervised_positions() {
        let prediction_scores = Tensor::zeros([1, 3, 10], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice(&[IGNORE_INDEX, 4, IGNORE_INDEX]).view([1, 3]);

        let loss = masked_lm_loss(&prediction_scores, &labels);
        assert!((loss.double_value(&[]) - 10f64.ln()).abs() < 1e-5);
    }
}
