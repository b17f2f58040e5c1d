use anyhow::{Context, Result};
use burn::module::Module;
use burn::nn::BatchNorm;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::{backend::Backend, Tensor};
use std::path::Path;
use tracing::info;

use super::resnet::{stage_channels, Resnet50};
use super::vgg::{feature_layout, Vgg16};
use crate::config::{BackboneKind, ConfigError, ModelConfig};

/// Map layer names to tap indices for `backbone`.
///
/// VGG-16 accepts `features.<N>` with torchvision's sequential indices,
/// ResNet-50 accepts `layer1` to `layer4`.
pub fn resolve_taps(backbone: BackboneKind, layers: &[String]) -> Result<Vec<usize>, ConfigError> {
    if layers.is_empty() {
        return Err(ConfigError::NoLayers);
    }

    layers
        .iter()
        .map(|layer| {
            let tap = match backbone {
                BackboneKind::Vgg16 => layer
                    .strip_prefix("features.")
                    .and_then(|idx| idx.parse::<usize>().ok())
                    .filter(|idx| *idx < feature_layout(1).len()),
                BackboneKind::Resnet50 => layer
                    .strip_prefix("layer")
                    .and_then(|idx| idx.parse::<usize>().ok())
                    .filter(|idx| (1..=4).contains(idx)),
            };
            tap.ok_or_else(|| ConfigError::UnknownLayer {
                backbone,
                layer: layer.clone(),
            })
        })
        .collect()
}

/// Channels produced at `tap`.
pub fn tap_channels(backbone: BackboneKind, base_width: usize, tap: usize) -> usize {
    match backbone {
        BackboneKind::Vgg16 => feature_layout(base_width)[tap],
        BackboneKind::Resnet50 => stage_channels(base_width)[tap - 1],
    }
}

/// Batch norm that can be pinned to its running statistics.
///
/// Burn picks batch statistics whenever autodiff is enabled, so a frozen
/// normalization is computed by hand from the stored mean and variance.
pub(crate) fn batch_norm<B: Backend>(bn: &BatchNorm<B>, input: Tensor<B, 4>, frozen: bool) -> Tensor<B, 4> {
    if !frozen {
        return bn.forward(input);
    }

    let channels = input.dims()[1];
    let shape = [1, channels, 1, 1];
    let mean = bn.running_mean.value().reshape(shape);
    let var = bn.running_var.value().reshape(shape);
    let gamma = bn.gamma.val().reshape(shape);
    let beta = bn.beta.val().reshape(shape);

    (input - mean) / var.add_scalar(bn.epsilon).sqrt() * gamma + beta
}

/// Pretrained feature extractor and classifier. Exactly one architecture is set.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    vgg: Option<Vgg16<B>>,
    resnet: Option<Resnet50<B>>,
    freeze_bn: bool,
}

impl<B: Backend> Backbone<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Self {
        let (vgg, resnet) = match config.backbone {
            BackboneKind::Vgg16 => (
                Some(Vgg16::new(
                    config.base_width,
                    config.classifier_hidden,
                    config.num_classes,
                    device,
                )),
                None,
            ),
            BackboneKind::Resnet50 => (
                None,
                Some(Resnet50::new(config.base_width, config.num_classes, device)),
            ),
        };

        Self {
            vgg,
            resnet,
            freeze_bn: config.freeze_bn,
        }
    }

    /// Replace the randomly initialized weights with a recorded pretrained set.
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> Result<Self> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let record = recorder
            .load(path.to_path_buf(), device)
            .with_context(|| format!("Failed to load backbone weights from: {:?}", path))?;
        info!("Loaded pretrained backbone weights from {:?}", path);
        Ok(self.load_record(record))
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match (&self.vgg, &self.resnet) {
            (Some(vgg), _) => vgg.forward(images, self.freeze_bn),
            (None, Some(resnet)) => resnet.forward(images, self.freeze_bn),
            (None, None) => unreachable!("backbone built without an architecture"),
        }
    }

    pub fn forward_taps(&self, images: Tensor<B, 4>, taps: &[usize]) -> Vec<Tensor<B, 4>> {
        match (&self.vgg, &self.resnet) {
            (Some(vgg), _) => vgg.forward_taps(images, taps),
            (None, Some(resnet)) => resnet.forward_taps(images, taps, self.freeze_bn),
            (None, None) => unreachable!("backbone built without an architecture"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::nn::BatchNormConfig;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_resolve_vgg_taps() {
        let layers = vec!["features.29".to_string(), "features.0".to_string()];
        assert_eq!(resolve_taps(BackboneKind::Vgg16, &layers), Ok(vec![29, 0]));

        let bad = vec!["features.31".to_string()];
        assert!(resolve_taps(BackboneKind::Vgg16, &bad).is_err());
    }

    #[test]
    fn test_resolve_resnet_taps() {
        let layers = vec!["layer4".to_string()];
        assert_eq!(resolve_taps(BackboneKind::Resnet50, &layers), Ok(vec![4]));
        assert!(resolve_taps(BackboneKind::Resnet50, &["layer0".to_string()]).is_err());
        assert_eq!(resolve_taps(BackboneKind::Resnet50, &[]), Err(ConfigError::NoLayers));
    }

    #[test]
    fn test_tap_channels() {
        assert_eq!(tap_channels(BackboneKind::Vgg16, 64, 29), 512);
        assert_eq!(tap_channels(BackboneKind::Resnet50, 64, 3), 1024);
    }

    #[test]
    fn test_frozen_batch_norm_uses_running_statistics() {
        let device = Default::default();
        let bn = BatchNormConfig::new(2).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::ones([1, 2, 2, 2], &device) * 3.0;

        // Fresh running stats are mean 0, var 1, so the frozen path is ~identity.
        let out = batch_norm(&bn, input, true);
        let values = out.into_data().to_vec::<f32>().unwrap();
        for v in values {
            assert_relative_eq!(v, 3.0, epsilon = 1e-3);
        }
    }
}
