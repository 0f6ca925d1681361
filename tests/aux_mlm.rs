use rust_auxqa::aux_mlm::{AuxMlmConfig, AuxMlmForQuestionAnswering, MaskingStrategy, IGNORE_INDEX};
use rust_auxqa::distilbert::DistilBertConfig;
use rust_auxqa::{AuxQaError, Config};
use std::collections::HashMap;
use std::io::Write;
use tch::{nn, Device, Kind, Tensor};

fn small_config() -> DistilBertConfig {
    DistilBertConfig {
        dim: 32,
        hidden_dim: 64,
        n_heads: 4,
        n_layers: 2,
        vocab_size: 1000,
        max_position_embeddings: 64,
        ..Default::default()
    }
}

fn sample_input(batch_size: i64, sequence_length: i64) -> Tensor {
    let input = Tensor::randint_low(
        200,
        1000,
        [batch_size, sequence_length],
        (Kind::Int64, Device::Cpu),
    );
    let _ = input.select(1, 0).fill_(101);
    let _ = input.select(1, sequence_length - 1).fill_(102);
    input
}

fn build_model(vs: &nn::VarStore, config: &DistilBertConfig) -> anyhow::Result<AuxMlmForQuestionAnswering> {
    let mut model = AuxMlmForQuestionAnswering::new(&vs.root(), config, &AuxMlmConfig::default())?;
    model.add_vocab_size(config.vocab_size);
    Ok(model)
}

#[test]
fn aux_mlm_rejects_non_binary_label_count() -> anyhow::Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let mut config = small_config();
    let mut labels = HashMap::new();
    labels.insert(0, String::from("START"));
    labels.insert(1, String::from("END"));
    labels.insert(2, String::from("NONE"));
    config.id2label = Some(labels);

    let model = AuxMlmForQuestionAnswering::new(&vs.root(), &config, &AuxMlmConfig::default());
    assert!(matches!(
        model,
        Err(AuxQaError::InvalidConfigurationError(_))
    ));

    Ok(())
}

#[test]
fn aux_mlm_forward_without_labels_or_masking() -> anyhow::Result<()> {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let mut config = small_config();
    config.output_attentions = Some(true);
    config.output_hidden_states = Some(true);
    let mut model = build_model(&vs, &config)?;

    let input = sample_input(2, 16);
    let output = tch::no_grad(|| model.forward_t(Some(&input), None, None, None, None, false, false, false))?;

    assert!(output.loss.is_none());
    assert!(output.qa_loss.is_none());
    assert!(output.mlm_loss.is_none());
    assert!(output.mlm_labels.is_none());
    assert_eq!(output.start_logits.size(), &[2, 16]);
    assert_eq!(output.end_logits.size(), &[2, 16]);
    assert_eq!(output.prediction_scores.size(), &[2, 16, 1000]);
    assert_eq!(config.n_layers as usize, output.all_hidden_states.unwrap().len());
    assert_eq!(config.n_layers as usize, output.all_attentions.unwrap().len());

    Ok(())
}

#[test]
fn aux_mlm_masking_requires_vocab_size() -> anyhow::Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let config = small_config();
    let mut model = AuxMlmForQuestionAnswering::new(&vs.root(), &config, &AuxMlmConfig::default())?;

    let input = sample_input(2, 16);
    match model.forward_t(Some(&input), None, None, None, None, true, false, false) {
        Err(AuxQaError::InvalidConfigurationError(message)) => {
            assert!(message.contains("add_vocab_size"))
        }
        _ => panic!("masking without a vocabulary size should fail"),
    }

    Ok(())
}

#[test]
fn aux_mlm_masking_vocab_size_cannot_exceed_encoder_vocabulary() -> anyhow::Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let config = small_config();
    let mut model = build_model(&vs, &config)?;
    model.add_vocab_size(50_000);

    let input = sample_input(2, 16);
    let output = model.forward_t(Some(&input), None, None, None, None, true, false, false);
    assert!(matches!(
        output,
        Err(AuxQaError::InvalidConfigurationError(_))
    ));
    assert!(model.mask_inputs(&input).is_err());

    model.add_vocab_size(config.vocab_size);
    assert!(model.mask_inputs(&input).is_ok());

    Ok(())
}

#[test]
fn aux_mlm_mask_token_must_be_in_vocabulary() -> anyhow::Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let config = small_config();
    let mut model = build_model(&vs, &config)?;
    let input = sample_input(2, 16);

    for mask_token_id in [-100i64, config.vocab_size] {
        model.set_mask_token(mask_token_id);
        let output = model.forward_t(Some(&input), None, None, None, None, true, false, false);
        assert!(matches!(
            output,
            Err(AuxQaError::InvalidConfigurationError(_))
        ));
    }

    model.set_mask_token(config.vocab_size - 1);
    let output = tch::no_grad(|| model.forward_t(Some(&input), None, None, None, None, true, false, false))?;
    assert!(output.mlm_loss.is_some());

    Ok(())
}

#[test]
fn aux_mlm_masking_requires_input_ids() -> anyhow::Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let config = small_config();
    let mut model = build_model(&vs, &config)?;

    let input_embeds = Tensor::rand([2, 16, config.dim], (Kind::Float, Device::Cpu));
    let output = model.forward_t(None, None, Some(&input_embeds), None, None, true, false, false);
    assert!(matches!(output, Err(AuxQaError::ValueError(_))));

    let output = model.forward_t(None, None, Some(&input_embeds), None, None, false, false, false)?;
    assert_eq!(output.start_logits.size(), &[2, 16]);

    Ok(())
}

#[test]
fn aux_mlm_total_loss_combines_both_heads() -> anyhow::Result<()> {
    tch::manual_seed(0);
    let vs = nn::VarStore::new(Device::Cpu);
    let config = small_config();
    let mut model = build_model(&vs, &config)?;
    model.set_gammas(vec![0.5])?;

    let input = sample_input(4, 24);
    let start_positions = Tensor::from_slice(&[1i64, 4, 9, 30]);
    let end_positions = Tensor::from_slice(&[3i64, 6, 12, 31]).view([4, 1]);

    let output = model.forward_t(
        Some(&input),
        None,
        None,
        Some(&start_positions),
        Some(&end_positions),
        true,
        false,
        true,
    )?;

    let qa_loss = output.qa_loss.as_ref().unwrap().double_value(&[]);
    let mlm_loss = output.mlm_loss.as_ref().unwrap().double_value(&[]);
    let loss = output.loss.as_ref().unwrap().double_value(&[]);
    assert_eq!(output.gamma, 0.5);
    assert!(qa_loss.is_finite());
    assert!(mlm_loss.is_finite());
    assert!((loss - (qa_loss + 0.5 * mlm_loss)).abs() < 1e-5);

    output.loss.unwrap().backward();
    let variables = vs.variables();
    let qa_weight_grad = variables["qa_outputs.weight"].grad();
    assert!(qa_weight_grad.defined());
    assert!(qa_weight_grad.abs().sum(Kind::Float).double_value(&[]) > 0.0);

    Ok(())
}

#[test]
fn aux_mlm_masked_loss_without_answers() -> anyhow::Result<()> {
    tch::manual_seed(7);
    let vs = nn::VarStore::new(Device::Cpu);
    let config = small_config();
    let mut model = build_model(&vs, &config)?;
    model.set_gammas(vec![2.0])?;

    let input = sample_input(3, 32);
    let output = tch::no_grad(|| model.forward_t(Some(&input), None, None, None, None, true, false, false))?;

    assert!(output.qa_loss.is_none());
    let mlm_loss = output.mlm_loss.as_ref().unwrap().double_value(&[]);
    let loss = output.loss.as_ref().unwrap().double_value(&[]);
    assert!((loss - 2.0 * mlm_loss).abs() < 1e-5);

    let labels = output.mlm_labels.unwrap();
    assert_eq!(labels.size(), &[3, 32]);
    assert_eq!(
        labels.select(1, 0).ne(IGNORE_INDEX).sum(Kind::Int64).int64_value(&[]),
        0
    );

    Ok(())
}

#[test]
fn aux_mlm_gamma_decays_with_training_steps() -> anyhow::Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let config = small_config();
    let mut model = build_model(&vs, &config)?;
    model.set_gammas(vec![0.1, 0.3, 0.5])?;

    let input = sample_input(1, 8);
    let mut gammas = vec![];
    for _ in 0..5 {
        let output = tch::no_grad(|| model.forward_t(Some(&input), None, None, None, None, false, true, false))?;
        gammas.push(output.gamma);
    }
    assert_eq!(gammas, vec![0.1, 0.3, 0.5, 0.5, 0.5]);
    assert_eq!(model.get_gamma(), 0.5);

    let _ = tch::no_grad(|| model.forward_t(Some(&input), None, None, None, None, false, false, false))?;
    assert_eq!(model.gamma_schedule().cursor(), 5);

    model.set_gammas(vec![0.9])?;
    assert_eq!(model.get_gamma(), 0.9);
    assert!(model.set_gammas(vec![]).is_err());

    Ok(())
}

#[test]
fn aux_mlm_masking_leaves_caller_batch_intact() -> anyhow::Result<()> {
    tch::manual_seed(3);
    let vs = nn::VarStore::new(Device::Cpu);
    let config = small_config();
    let mut model = build_model(&vs, &config)?;
    model.set_mask_token(103);

    let input = sample_input(2, 32);
    let original = input.copy();
    let masked = model.mask_inputs(&input)?;
    let _ = tch::no_grad(|| model.forward_t(Some(&input), None, None, None, None, true, false, false))?;

    assert!(input.equal(&original));
    let changed = masked.input_ids.ne_tensor(&input);
    assert!(masked
        .labels
        .masked_select(&changed)
        .equal(&input.masked_select(&changed)));

    Ok(())
}

#[test]
fn aux_mlm_qa_layer_is_independent_from_encoder() -> anyhow::Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let config = small_config();
    let mut model = build_model(&vs, &config)?;

    let variables = vs.variables();
    let qa_weight = &variables["qa_transformer_layer.ffn.lin1.weight"];
    let encoder_weight = &variables["distilbert.transformer.layer.0.ffn.lin1.weight"];
    assert_eq!(qa_weight.size(), encoder_weight.size());
    assert!(!qa_weight.equal(encoder_weight));

    let qa_before = qa_weight.copy();
    let encoder_before = encoder_weight.copy();
    model.reset_qa_transformer_layer();

    assert!(!qa_weight.equal(&qa_before));
    assert!(encoder_weight.equal(&encoder_before));
    assert!(variables["qa_transformer_layer.sa_layer_norm.weight"]
        .equal(&Tensor::ones([config.dim], (Kind::Float, Device::Cpu))));

    Ok(())
}

#[test]
fn aux_mlm_output_embeddings_can_be_replaced() -> anyhow::Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let config = small_config();
    let mut model = build_model(&vs, &config)?;
    assert_eq!(model.get_output_embeddings().ws.size(), &[1000, 32]);

    let projector = nn::linear(vs.root() / "new_projector", 32, 1000, Default::default());
    let _ = tch::no_grad(|| projector.ws.shallow_clone().fill_(0.0));
    model.set_output_embeddings(projector);

    let input = sample_input(1, 8);
    let output = tch::no_grad(|| model.forward_t(Some(&input), None, None, None, None, false, false, false))?;
    let bias = &model.get_output_embeddings().bs.as_ref().unwrap().view([1, 1, 1000]);
    assert!((&output.prediction_scores - bias)
        .abs()
        .max()
        .double_value(&[])
        < 1e-6);

    Ok(())
}

#[test]
fn aux_mlm_configuration_from_file() -> anyhow::Result<()> {
    let mut aux_file = tempfile::NamedTempFile::new()?;
    write!(
        aux_file,
        r#"{{"masking_strategy": "token", "mlm_probability": 0.3, "gammas": [1.0, 0.5]}}"#
    )?;
    let aux_config = AuxMlmConfig::from_file(aux_file.path())?;
    assert_eq!(aux_config.masking_strategy, MaskingStrategy::token);
    assert_eq!(aux_config.mlm_probability, 0.3);
    assert_eq!(aux_config.max_span_length, 2);
    assert_eq!(aux_config.mask_token_id, 103);

    let config_file = tempfile::NamedTempFile::new()?;
    serde_json::to_writer(config_file.as_file(), &small_config())?;
    let config = DistilBertConfig::from_file(config_file.path())?;
    assert_eq!(config.dim, 32);
    assert_eq!(config.num_labels(), 2);

    let vs = nn::VarStore::new(Device::Cpu);
    let model = AuxMlmForQuestionAnswering::new(&vs.root(), &config, &aux_config)?;
    assert_eq!(model.get_gamma(), 1.0);

    let missing = AuxMlmConfig::from_file(aux_file.path().with_extension("missing"));
    assert!(matches!(missing, Err(AuxQaError::IOError(_))));

    let mut partial_file = tempfile::NamedTempFile::new()?;
    write!(partial_file, r#"{{"dim": 32, "n_heads": 4}}"#)?;
    let partial = DistilBertConfig::from_file(partial_file.path());
    assert!(matches!(partial, Err(AuxQaError::SerializationError(_))));

    Ok(())
}
