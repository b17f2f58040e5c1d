use anyhow::{Context, Result};
use burn::module::ParamId;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer, SgdConfig};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use std::path::Path;

use crate::config::{OptimizerKind, TrainingConfig};
use crate::model::GenericModel;

/// The bias group trains at this multiple of the schedule's rate.
pub const BIAS_LR_SCALE: f64 = 2.0;

pub const SGD_MOMENTUM: f64 = 0.9;
pub const ADAMW_BETA1: f32 = 0.9;

/// Attention-module parameters split by name into weights and biases.
#[derive(Debug, Clone, Default)]
pub struct ParamGroups {
    pub weights: Vec<ParamId>,
    pub biases: Vec<ParamId>,
}

impl ParamGroups {
    pub fn from_named(named: &[(String, ParamId)]) -> Self {
        let mut groups = Self::default();
        for (name, id) in named {
            if name.contains("bias") {
                groups.biases.push(*id);
            } else if name.contains("weight") {
                groups.weights.push(*id);
            }
        }
        groups
    }

    pub fn of_model<B: AutodiffBackend>(model: &GenericModel<B>) -> Self {
        Self::from_named(&model.attn_mech.named_parameter_ids())
    }
}

/// Update rule for the attention module of a [`GenericModel`].
///
/// The backbone never receives gradients, so only attention parameters move.
pub trait AttentionOptimizer<B: AutodiffBackend> {
    fn kind(&self) -> OptimizerKind;

    /// One update at schedule rate `lr`, consuming the gradients of a backward pass.
    fn step(&mut self, lr: f64, model: GenericModel<B>, grads: B::Gradients) -> GenericModel<B>;

    /// Effective rate of every parameter group when the schedule is at `lr`.
    fn group_lrs(&self, lr: f64) -> Vec<f64>;

    /// Record the optimizer state next to a checkpoint as `<stem>_optim_<group>`.
    /// Returns the file names written.
    fn save(&self, dir: &Path, stem: &str) -> Result<Vec<String>>;

    fn load(&mut self, dir: &Path, files: &[String], device: &B::Device) -> Result<()>;
}

fn record_state<B, O>(optim: &O, dir: &Path, file: &str) -> Result<()>
where
    B: AutodiffBackend,
    O: Optimizer<GenericModel<B>, B>,
{
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    Recorder::<B>::record(&recorder, optim.to_record(), dir.join(file))
        .with_context(|| format!("Failed to save optimizer state: {}", file))?;
    Ok(())
}

fn restore_state<B, O>(optim: &O, dir: &Path, file: &str, device: &B::Device) -> Result<O>
where
    B: AutodiffBackend,
    O: Optimizer<GenericModel<B>, B> + Clone,
{
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let record = Recorder::<B>::load(&recorder, dir.join(file), device)
        .with_context(|| format!("Failed to load optimizer state: {}", file))?;
    Ok(optim.clone().load_record(record))
}

/// SGD with Nesterov momentum over two groups: decayed weights at the
/// schedule rate, undecayed biases at twice the rate.
pub struct GroupedSgd<O> {
    weights: O,
    biases: O,
}

impl<B, O> AttentionOptimizer<B> for GroupedSgd<O>
where
    B: AutodiffBackend,
    O: Optimizer<GenericModel<B>, B> + Clone,
{
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Sgd
    }

    fn step(&mut self, lr: f64, model: GenericModel<B>, mut grads: B::Gradients) -> GenericModel<B> {
        let groups = ParamGroups::of_model(&model);
        let weight_grads = GradientsParams::from_params::<B, _>(&mut grads, &model, &groups.weights);
        let bias_grads = GradientsParams::from_params::<B, _>(&mut grads, &model, &groups.biases);

        let model = self.weights.step(lr, model, weight_grads);
        self.biases.step(lr * BIAS_LR_SCALE, model, bias_grads)
    }

    fn group_lrs(&self, lr: f64) -> Vec<f64> {
        vec![lr, lr * BIAS_LR_SCALE]
    }

    fn save(&self, dir: &Path, stem: &str) -> Result<Vec<String>> {
        let weights = format!("{stem}_optim_weights");
        let biases = format!("{stem}_optim_biases");
        record_state::<B, O>(&self.weights, dir, &weights)?;
        record_state::<B, O>(&self.biases, dir, &biases)?;
        Ok(vec![weights, biases])
    }

    fn load(&mut self, dir: &Path, files: &[String], device: &B::Device) -> Result<()> {
        let [weights, biases] = files else {
            anyhow::bail!("SGD state needs 2 files, checkpoint lists {}", files.len());
        };
        self.weights = restore_state::<B, O>(&self.weights, dir, weights, device)?;
        self.biases = restore_state::<B, O>(&self.biases, dir, biases, device)?;
        Ok(())
    }
}

/// AdamW over the whole attention module.
pub struct SingleGroupAdamW<O> {
    inner: O,
}

impl<B, O> AttentionOptimizer<B> for SingleGroupAdamW<O>
where
    B: AutodiffBackend,
    O: Optimizer<GenericModel<B>, B> + Clone,
{
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::AdamW
    }

    fn step(&mut self, lr: f64, model: GenericModel<B>, mut grads: B::Gradients) -> GenericModel<B> {
        let grads = GradientsParams::from_module::<B, _>(&mut grads, &model.attn_mech);
        self.inner.step(lr, model, grads)
    }

    fn group_lrs(&self, lr: f64) -> Vec<f64> {
        vec![lr]
    }

    fn save(&self, dir: &Path, stem: &str) -> Result<Vec<String>> {
        let file = format!("{stem}_optim");
        record_state::<B, O>(&self.inner, dir, &file)?;
        Ok(vec![file])
    }

    fn load(&mut self, dir: &Path, files: &[String], device: &B::Device) -> Result<()> {
        let [file] = files else {
            anyhow::bail!("AdamW state needs 1 file, checkpoint lists {}", files.len());
        };
        self.inner = restore_state::<B, O>(&self.inner, dir, file, device)?;
        Ok(())
    }
}

pub fn build_optimizer<B: AutodiffBackend>(config: &TrainingConfig) -> Box<dyn AttentionOptimizer<B>> {
    match config.optimizer {
        OptimizerKind::Sgd => {
            let momentum = MomentumConfig::new()
                .with_momentum(SGD_MOMENTUM)
                .with_dampening(0.0)
                .with_nesterov(true);
            let weights = SgdConfig::new()
                .with_momentum(Some(momentum.clone()))
                .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay as f32)))
                .init::<B, GenericModel<B>>();
            let biases = SgdConfig::new()
                .with_momentum(Some(momentum))
                .init::<B, GenericModel<B>>();
            Box::new(GroupedSgd { weights, biases })
        }
        OptimizerKind::AdamW => {
            let inner = AdamWConfig::new()
                .with_beta_1(ADAMW_BETA1)
                .with_beta_2(config.beta2 as f32)
                .with_weight_decay(config.weight_decay as f32)
                .init::<B, GenericModel<B>>();
            Box::new(SingleGroupAdamW { inner })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackboneKind, ModelConfig};
    use crate::model::LossWeights;
    use burn::backend::Autodiff;
    use burn::tensor::{Int, Tensor};
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_model(device: &<TestBackend as burn::tensor::backend::Backend>::Device) -> GenericModel<TestBackend> {
        let config = ModelConfig {
            backbone: BackboneKind::Vgg16,
            num_classes: 4,
            base_width: 2,
            classifier_hidden: 8,
            attention_hidden: 4,
            ..ModelConfig::default()
        };
        GenericModel::new(&config, device).unwrap()
    }

    fn backward(model: &GenericModel<TestBackend>) -> <TestBackend as AutodiffBackend>::Gradients {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::ones([2, 3, 32, 32], &device);
        let labels = Tensor::<TestBackend, 1, Int>::from_ints([0, 3], &device);
        let output = model.forward(images, labels.clone(), None);
        model
            .compute_loss(output.logits, labels, output.masks, &LossWeights::default())
            .total
            .backward()
    }

    #[test]
    fn test_groups_split_by_name() {
        let device = Default::default();
        let model = tiny_model(&device);
        let groups = ParamGroups::of_model(&model);
        assert_eq!(groups.weights.len(), 3);
        assert_eq!(groups.biases.len(), 3);
        assert!(groups.weights.iter().all(|id| !groups.biases.contains(id)));
    }

    #[test]
    fn test_sgd_bias_lr_is_double() {
        let optim = build_optimizer::<TestBackend>(&TrainingConfig::default());
        for lr in [3e-7, 1e-3, 5e-5] {
            let lrs = optim.group_lrs(lr);
            assert_eq!(lrs.len(), 2);
            assert_eq!(lrs[1], 2.0 * lrs[0]);
        }
    }

    #[test]
    fn test_adamw_is_single_group() {
        let config = TrainingConfig {
            optimizer: OptimizerKind::AdamW,
            ..TrainingConfig::default()
        };
        let optim = build_optimizer::<TestBackend>(&config);
        assert_eq!(optim.kind(), OptimizerKind::AdamW);
        assert_eq!(optim.group_lrs(1e-3), vec![1e-3]);
    }

    #[test]
    fn test_step_moves_attention_only() {
        let device = Default::default();
        let model = tiny_model(&device);
        let image = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let features = Tensor::<TestBackend, 4>::ones([1, 16, 2, 2], &device);
        let body_before = model.body.forward(image.clone()).into_data().to_vec::<f32>().unwrap();
        let attn_before = model.attn_mech.forward(features.clone(), None).into_data().to_vec::<f32>().unwrap();

        let grads = backward(&model);
        let mut optim = build_optimizer::<TestBackend>(&TrainingConfig::default());
        let model = optim.step(0.1, model, grads);

        let body_after = model.body.forward(image).into_data().to_vec::<f32>().unwrap();
        let attn_after = model.attn_mech.forward(features, None).into_data().to_vec::<f32>().unwrap();
        assert_eq!(body_before, body_after);
        assert_ne!(attn_before, attn_after);
    }

    #[test]
    fn test_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let model = tiny_model(&device);

        for kind in [OptimizerKind::Sgd, OptimizerKind::AdamW] {
            let config = TrainingConfig {
                optimizer: kind,
                ..TrainingConfig::default()
            };
            let mut optim = build_optimizer::<TestBackend>(&config);
            let _ = optim.step(0.01, model.clone(), backward(&model));
            let files = optim.save(dir.path(), &format!("epoch_1_{kind}")).unwrap();
            assert!(files.iter().all(|f| dir.path().join(format!("{f}.mpk")).exists()));

            let mut restored = build_optimizer::<TestBackend>(&config);
            restored.load(dir.path(), &files, &device).unwrap();
            assert!(restored.load(dir.path(), &files[..0], &device).is_err());
        }
    }
}
