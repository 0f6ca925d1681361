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

use tch::nn::init::DEFAULT_KAIMING_UNIFORM;
use tch::nn::{Init, LayerNorm, Linear};

/// Re-draws the weights of a linear layer with the libtorch defaults
/// (Kaiming uniform weights, bias uniform in +/- 1/sqrt(fan_in)).
pub(crate) fn reset_linear(linear: &mut Linear) {
    let fan_in = linear.ws.size()[1];
    let bound = 1.0 / (fan_in as f64).sqrt();
    tch::no_grad(|| {
        DEFAULT_KAIMING_UNIFORM.set(&mut linear.ws);
        if let Some(bias) = linear.bs.as_mut() {
            Init::Uniform {
                lo: -bound,
                up: bound,
            }
            .set(bias);
        }
    });
}

pub(crate) fn reset_layer_norm(layer_norm: &mut LayerNorm) {
    tch::no_grad(|| {
        if let Some(weight) = layer_norm.ws.as_mut() {
            Init::Const(1.).set(weight);
        }
        if let Some(bias) = layer_norm.bs.as_mut() {
            Init::Const(0.).set(bias);
        }
    });
}
