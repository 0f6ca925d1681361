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

use crate::common::dropout::Dropout;
use crate::common::embeddings::process_ids_embeddings_pair;
use crate::distilbert::distilbert_model::DistilBertConfig;
use crate::AuxQaError;
use std::borrow::Borrow;
use tch::nn::{embedding, EmbeddingConfig};
use tch::{nn, Device, Kind, Tensor};

fn sinusoidal_position_table(max_position_embeddings: i64, dim: i64) -> Tensor {
    let inverse_frequencies: Vec<f64> = (0..dim)
        .map(|j| 10000_f64.powf((2 * (j / 2)) as f64 / dim as f64).recip())
        .collect();
    let even_columns: Vec<bool> = (0..dim).map(|j| j % 2 == 0).collect();

    let angles = Tensor::arange(max_position_embeddings, (Kind::Double, Device::Cpu))
        .unsqueeze(1)
        * Tensor::from_slice(&inverse_frequencies).unsqueeze(0);
    let even_columns = Tensor::from_slice(&even_columns).unsqueeze(0);
    angles.sin().where_self(&even_columns, &angles.cos())
}

fn sinusoidal_embeddings<'p, P>(p: P, config: &DistilBertConfig) -> nn::Embedding
where
    P: Borrow<nn::Path<'p>>,
{
    let p = p.borrow();
    let embedding_config = EmbeddingConfig {
        padding_idx: 0,
        ..Default::default()
    };
    let mut embeddings = embedding(
        p,
        config.max_position_embeddings,
        config.dim,
        embedding_config,
    );
    let table = sinusoidal_position_table(config.max_position_embeddings, config.dim)
        .to_kind(embeddings.ws.kind())
        .to_device(embeddings.ws.device());
    tch::no_grad(|| {
        embeddings.ws.copy_(&table);
    });
    embeddings
}

#[derive(Debug)]
pub struct DistilBertEmbedding {
    word_embeddings: nn::Embedding,
    position_embeddings: nn::Embedding,
    layer_norm: nn::LayerNorm,
    dropout: Dropout,
}

impl DistilBertEmbedding {
    pub fn new<'p, P>(p: P, config: &DistilBertConfig) -> DistilBertEmbedding
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();

        let embedding_config = EmbeddingConfig {
            padding_idx: 0,
            ..Default::default()
        };

        let word_embeddings: nn::Embedding = embedding(
            p / "word_embeddings",
            config.vocab_size,
            config.dim,
            embedding_config,
        );
        let position_embeddings: nn::Embedding = if config.sinusoidal_pos_embds {
            sinusoidal_embeddings(p / "position_embeddings", config)
        } else {
            embedding(
                p / "position_embeddings",
                config.max_position_embeddings,
                config.dim,
                embedding_config,
            )
        };
        let layer_norm_config = nn::LayerNormConfig {
            eps: 1e-12,
            ..Default::default()
        };
        let layer_norm: nn::LayerNorm =
            nn::layer_norm(p / "LayerNorm", vec![config.dim], layer_norm_config);
        let dropout: Dropout = Dropout::new(config.dropout);
        DistilBertEmbedding {
            word_embeddings,
            position_embeddings,
            layer_norm,
            dropout,
        }
    }

    pub fn forward_t(
        &self,
        input_ids: Option<&Tensor>,
        input_embeds: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor, AuxQaError> {
        let (calc_input_embeddings, input_size, device) =
            process_ids_embeddings_pair(input_ids, input_embeds, &self.word_embeddings)?;
        let word_embeds = match (input_embeds, calc_input_embeddings.as_ref()) {
            (Some(embeds), _) | (None, Some(embeds)) => embeds,
            (None, None) => {
                return Err(AuxQaError::ValueError(
                    "At least one of input ids or input embeddings must be set".into(),
                ))
            }
        };

        let position_ids = Tensor::arange(input_size[1], (Kind::Int64, device))
            .unsqueeze(0)
            .expand(input_size.as_slice(), true);
        let position_embed = position_ids.apply(&self.position_embeddings);

        Ok((word_embeds + position_embed)
            .apply(&self.layer_norm)
            .apply_t(&self.dropout, train))
    }
}
