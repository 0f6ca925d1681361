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

use crate::aux_mlm::gamma::GammaSchedule;
use crate::aux_mlm::masking::{BatchMasker, MaskingVocabulary};
use crate::aux_mlm::span_masking::{check_probability, SpanMasker};
use crate::aux_mlm::token_masking::TokenMasker;
use crate::{AuxQaError, Config};
use serde::{Deserialize, Serialize};

#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
/// # Masking strategy used for the auxiliary masked language model task
pub enum MaskingStrategy {
    /// Contiguous spans with geometric lengths (`SpanMasker`)
    span,
    /// Independent tokens (`TokenMasker`)
    token,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
/// # Auxiliary masked language model configuration
/// Masking hyper-parameters, special token ids and initial loss weight schedule.
/// Missing fields in a configuration file take their default value.
pub struct AuxMlmConfig {
    pub mlm_probability: f64,
    pub length_probability: f64,
    pub max_span_length: i64,
    pub masking_strategy: MaskingStrategy,
    pub mask_token_id: i64,
    pub protected_token_ids: Vec<i64>,
    pub gammas: Option<Vec<f64>>,
}

impl Config for AuxMlmConfig {}

impl Default for AuxMlmConfig {
    fn default() -> Self {
        AuxMlmConfig {
            mlm_probability: 0.15,
            length_probability: 0.2,
            max_span_length: 2,
            masking_strategy: MaskingStrategy::span,
            mask_token_id: 103,
            protected_token_ids: vec![101, 102, 0],
            gammas: None,
        }
    }
}

impl AuxMlmConfig {
    /// Checks masking hyper-parameters and the initial gamma schedule.
    pub fn validate(&self) -> Result<(), AuxQaError> {
        check_probability("mlm_probability", self.mlm_probability)?;
        if self.masking_strategy == MaskingStrategy::span {
            check_probability("length_probability", self.length_probability)?;
            if self.max_span_length < 1 {
                return Err(AuxQaError::InvalidConfigurationError(format!(
                    "max_span_length must be at least 1, got {}",
                    self.max_span_length
                )));
            }
        }
        if matches!(&self.gammas, Some(gammas) if gammas.is_empty()) {
            return Err(AuxQaError::InvalidConfigurationError(
                "gammas must contain at least one coefficient when provided".into(),
            ));
        }
        Ok(())
    }

    /// Builds the masker selected by `masking_strategy`, validating its hyper-parameters.
    pub fn build_masker(&self) -> Result<Box<dyn BatchMasker>, AuxQaError> {
        Ok(match self.masking_strategy {
            MaskingStrategy::span => Box::new(SpanMasker::new(
                self.mlm_probability,
                self.length_probability,
                self.max_span_length,
            )?),
            MaskingStrategy::token => Box::new(TokenMasker::new(self.mlm_probability)?),
        })
    }

    pub fn build_gamma_schedule(&self) -> Result<GammaSchedule, AuxQaError> {
        match &self.gammas {
            Some(gammas) => GammaSchedule::new(gammas.clone()),
            None => Ok(GammaSchedule::default()),
        }
    }

    pub fn masking_vocabulary(&self, vocab_size: i64) -> MaskingVocabulary {
        MaskingVocabulary {
            vocab_size,
            mask_token_id: self.mask_token_id,
            protected_token_ids: self.protected_token_ids.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: AuxMlmConfig =
            serde_json::from_str(r#"{"masking_strategy": "token", "gammas": [0.5, 0.25]}"#)
                .unwrap();
        assert_eq!(config.masking_strategy, MaskingStrategy::token);
        assert_eq!(config.mlm_probability, 0.15);
        assert_eq!(config.protected_token_ids, vec![101, 102, 0]);
        assert_eq!(config.build_gamma_schedule().unwrap().current(), 0.5);
    }

    #[test]
    fn invalid_hyper_parameters_fail_masker_construction() {
        let config = AuxMlmConfig {
            max_span_length: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.build_masker(),
            Err(AuxQaError::InvalidConfigurationError(_))
        ));

        let config = AuxMlmConfig {
            masking_strategy: MaskingStrategy::token,
            mlm_probability: -0.1,
            ..Default::default()
        };
        assert!(config.build_masker().is_err());
    }

    #[test]
    fn empty_gamma_list_is_rejected() {
        let config = AuxMlmConfig {
            gammas: Some(vec![]),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(config.build_gamma_schedule().is_err());
    }

    #[test]
    fn default_configuration_is_valid() {
        assert!(AuxMlmConfig::default().validate().is_ok());
        let config = AuxMlmConfig {
            length_probability: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
