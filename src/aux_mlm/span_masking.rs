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
    rewrite_masked_batch, validate_masking_inputs, BatchMasker, MaskedBatch, MaskingVocabulary,
    MASK_TOKEN_PROBABILITY, RANDOM_TOKEN_PROBABILITY,
};
use crate::AuxQaError;
use tch::{Device, Kind, Tensor};
use tracing::debug;

/// # Span masker
/// Vectorized span masking in the spirit of SpanBERT ([Joshi et al., 2019](https://arxiv.org/abs/1907.10529)).
///
/// The whole batch is processed with bulk tensor operations:
/// 1. a candidate span length is drawn from a geometric distribution for every position,
/// 2. a prefix of these lengths is kept per sequence to stay close to the masking budget,
/// 3. each kept span gets a uniformly drawn start, its end is clamped to the sequence,
/// 4. each span is masked, randomized or left unchanged as a whole.
///
/// Span positions are written with a loop bounded by `max_span_length` rather than one
/// iteration per span or per sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpanMasker {
    mlm_probability: f64,
    length_probability: f64,
    max_span_length: i64,
}

/// Span lengths kept by the budget allocation.
#[derive(Debug)]
pub struct SpanBudget {
    /// Kept span lengths of shape (*batch size*, *max span count*), zero for empty slots
    pub lengths: Tensor,
    /// Number of kept spans per sequence, shape (*batch size*)
    pub span_counts: Tensor,
}

/// Start (inclusive) and end (exclusive) positions of each span slot.
#[derive(Debug)]
pub struct SpanPlacement {
    pub starts: Tensor,
    pub ends: Tensor,
}

/// Per span slot policy flags (`Int64` tensors holding 0 or 1).
#[derive(Debug)]
pub struct SpanPolicies {
    pub masked: Tensor,
    pub randomized: Tensor,
}

impl Default for SpanMasker {
    fn default() -> Self {
        SpanMasker {
            mlm_probability: 0.15,
            length_probability: 0.2,
            max_span_length: 2,
        }
    }
}

impl SpanMasker {
    /// Build a new `SpanMasker`
    ///
    /// # Arguments
    ///
    /// * `mlm_probability` - target share of masked tokens per sequence, in (0, 1]
    /// * `length_probability` - success probability of the geometric span length distribution, in (0, 1]
    /// * `max_span_length` - longest span that can be drawn, at least 1
    ///
    /// # Example
    ///
    /// ```no_run
    /// use rust_auxqa::aux_mlm::SpanMasker;
    ///
    /// let masker = SpanMasker::new(0.15, 0.2, 2).unwrap();
    /// ```
    pub fn new(
        mlm_probability: f64,
        length_probability: f64,
        max_span_length: i64,
    ) -> Result<SpanMasker, AuxQaError> {
        check_probability("mlm_probability", mlm_probability)?;
        check_probability("length_probability", length_probability)?;
        if max_span_length < 1 {
            return Err(AuxQaError::InvalidConfigurationError(format!(
                "max_span_length must be at least 1, got {}",
                max_span_length
            )));
        }
        Ok(SpanMasker {
            mlm_probability,
            length_probability,
            max_span_length,
        })
    }

    pub fn max_span_length(&self) -> i64 {
        self.max_span_length
    }

    /// Soft cap on the summed span lengths of a sequence:
    /// `ceil(sequence_length * mlm_probability) + 1 / length_probability`.
    pub fn span_budget(&self, sequence_length: i64) -> f64 {
        (sequence_length as f64 * self.mlm_probability).ceil() + 1.0 / self.length_probability
    }

    /// Draws a candidate span length in `[1, max_span_length]` for every cell of `shape`.
    /// Geometric samples count the failures before the first success; they are clamped to
    /// `max_span_length - 1` and shifted by one. A success probability of 1 yields unit spans.
    pub fn sample_span_lengths(&self, shape: &[i64], device: Device) -> Tensor {
        if self.length_probability >= 1.0 {
            return Tensor::ones(shape, (Kind::Int64, device));
        }
        let mut trials = Tensor::empty(shape, (Kind::Double, device));
        let failures = trials.geometric_(self.length_probability) - 1.0;
        failures
            .clamp(0.0, (self.max_span_length - 1) as f64)
            .to_kind(Kind::Int64)
            + 1
    }

    /// Keeps, per sequence, the candidate lengths whose running sum stays below the span budget
    /// and truncates the columns to the largest number of kept spans in the batch.
    pub fn allocate_span_budget(&self, candidate_lengths: &Tensor) -> SpanBudget {
        let (batch_size, sequence_length) = (candidate_lengths.size()[0], candidate_lengths.size()[1]);
        let budget = self.span_budget(sequence_length);

        let cumulative_lengths = candidate_lengths.cumsum(1, Kind::Int64);
        let lengths = candidate_lengths.masked_fill(&cumulative_lengths.ge(budget), 0);
        let span_counts = lengths
            .gt(0)
            .sum_dim_intlist([1].as_slice(), false, Kind::Int64);
        let max_span_count = if batch_size > 0 && sequence_length > 0 {
            span_counts.max().int64_value(&[])
        } else {
            0
        };

        SpanBudget {
            lengths: lengths.narrow(1, 0, max_span_count),
            span_counts,
        }
    }

    /// Draws a start position in `[1, sequence_length]` for every non-empty span slot
    /// (empty slots start at the sentinel position 0) and clamps the span ends to the sequence.
    pub fn place_spans(&self, lengths: &Tensor, sequence_length: i64) -> SpanPlacement {
        let starts = (Tensor::rand(lengths.size().as_slice(), (Kind::Double, lengths.device()))
            * sequence_length as f64)
            .ceil()
            .to_kind(Kind::Int64)
            .masked_fill(&lengths.eq(0), 0);
        let ends = (&starts + lengths).clamp(0, sequence_length);
        SpanPlacement { starts, ends }
    }

    /// Marks, in a (*batch size*, *sequence_length*) grid, every position covered by a span slot
    /// flagged in `span_flags`. Each iteration writes offset `i` of all spans at once; positions past
    /// a span end are routed to the sentinel column 0, which is cleared at the end.
    pub fn fill_span_positions(
        &self,
        placement: &SpanPlacement,
        span_flags: &Tensor,
        sequence_length: i64,
    ) -> Tensor {
        let batch_size = placement.starts.size()[0];
        let mut positions = Tensor::zeros(
            [batch_size, sequence_length],
            (Kind::Int64, placement.starts.device()),
        );
        if sequence_length == 0 || placement.starts.numel() == 0 {
            return positions.to_kind(Kind::Bool);
        }

        let markers = placement.starts.ones_like();
        let sentinel = placement.starts.zeros_like();
        let mut current = placement.starts.shallow_clone();
        for _ in 0..self.max_span_length {
            let token_positions = current.where_self(&current.lt_tensor(&placement.ends), &sentinel);
            let _ = positions.scatter_(1, &(token_positions * span_flags), &markers);
            current = current + 1;
        }
        let _ = positions.select(1, 0).fill_(0);
        positions.to_kind(Kind::Bool)
    }

    /// Draws the policy of every span slot: mask token with probability 0.8, otherwise
    /// random tokens with probability 0.5, otherwise unchanged.
    pub fn select_span_policies(&self, shape: &[i64], device: Device) -> SpanPolicies {
        let masked = Tensor::full(shape, MASK_TOKEN_PROBABILITY, (Kind::Double, device))
            .bernoulli()
            .to_kind(Kind::Bool);
        let randomized = Tensor::full(shape, RANDOM_TOKEN_PROBABILITY, (Kind::Double, device))
            .bernoulli()
            .to_kind(Kind::Bool)
            .logical_and(&masked.logical_not());
        SpanPolicies {
            masked: masked.to_kind(Kind::Int64),
            randomized: randomized.to_kind(Kind::Int64),
        }
    }
}

impl BatchMasker for SpanMasker {
    fn mask_batch(
        &self,
        input_ids: &Tensor,
        vocabulary: &MaskingVocabulary,
    ) -> Result<MaskedBatch, AuxQaError> {
        let (batch_size, sequence_length) = validate_masking_inputs(input_ids, vocabulary)?;
        let device = input_ids.device();

        let candidate_lengths = self.sample_span_lengths(&[batch_size, sequence_length], device);
        let budget = self.allocate_span_budget(&candidate_lengths);
        let placement = self.place_spans(&budget.lengths, sequence_length);
        let policies = self.select_span_policies(budget.lengths.size().as_slice(), device);

        let selected = self.fill_span_positions(
            &placement,
            &budget.lengths.gt(0).to_kind(Kind::Int64),
            sequence_length,
        );
        let masked = self.fill_span_positions(&placement, &policies.masked, sequence_length);
        let randomized =
            self.fill_span_positions(&placement, &policies.randomized, sequence_length);

        debug!(
            batch_size,
            sequence_length,
            span_slots = budget.lengths.size()[1],
            "sampled masking spans"
        );

        Ok(rewrite_masked_batch(
            input_ids,
            &selected,
            &masked,
            &randomized,
            vocabulary,
        ))
    }
}

pub(crate) fn check_probability(name: &str, value: f64) -> Result<(), AuxQaError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(AuxQaError::InvalidConfigurationError(format!(
            "{} must be in (0, 1], got {}",
            name, value
        )))
    }
}
