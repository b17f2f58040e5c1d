use burn::module::{Module, ParamId};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::{activation, backend::Backend, Tensor};

use super::loss::LossWeights;

/// Extra input planes carrying the loss coefficients when conditioned.
pub const COEFF_PLANES: usize = 3;

/// Trainable mask generator: backbone features to one sigmoid map per class.
///
/// A conditioned module also receives the three loss coefficients as constant
/// input planes, so a single set of weights covers a family of trade-offs
/// between classification and mask size.
#[derive(Module, Debug)]
pub struct AttentionMechanism<B: Backend> {
    reduce: Conv2d<B>,
    refine: Conv2d<B>,
    classify: Conv2d<B>,
    conditioned: bool,
}

impl<B: Backend> AttentionMechanism<B> {
    pub fn new(
        in_channels: usize,
        hidden: usize,
        num_classes: usize,
        conditioned: bool,
        device: &B::Device,
    ) -> Self {
        let in_channels = if conditioned {
            in_channels + COEFF_PLANES
        } else {
            in_channels
        };

        Self {
            reduce: Conv2dConfig::new([in_channels, hidden], [1, 1]).init(device),
            refine: Conv2dConfig::new([hidden, hidden], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            classify: Conv2dConfig::new([hidden, num_classes], [1, 1]).init(device),
            conditioned,
        }
    }

    pub fn is_conditioned(&self) -> bool {
        self.conditioned
    }

    /// Per-class attention maps `[batch, classes, h, w]` in `(0, 1)`.
    pub fn forward(&self, features: Tensor<B, 4>, coeffs: Option<&LossWeights>) -> Tensor<B, 4> {
        let x = if self.conditioned {
            let [batch, _, height, width] = features.dims();
            let device = features.device();
            let weights = coeffs.copied().unwrap_or_default();
            let planes = Tensor::<B, 4>::ones([batch, COEFF_PLANES, height, width], &device)
                * weights.to_tensor::<B>(&device).reshape([1, COEFF_PLANES, 1, 1]);
            Tensor::cat(vec![features, planes], 1)
        } else {
            features
        };

        let x = activation::relu(self.reduce.forward(x));
        let x = activation::relu(self.refine.forward(x));
        activation::sigmoid(self.classify.forward(x))
    }

    /// Parameter ids with their dotted names, e.g. `refine.bias`.
    pub fn named_parameter_ids(&self) -> Vec<(String, ParamId)> {
        let mut named = Vec::new();
        for (name, conv) in [
            ("reduce", &self.reduce),
            ("refine", &self.refine),
            ("classify", &self.classify),
        ] {
            named.push((format!("{name}.weight"), conv.weight.id));
            if let Some(bias) = &conv.bias {
                named.push((format!("{name}.bias"), bias.id));
            }
        }
        named
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_maps_have_one_channel_per_class() {
        let device = Default::default();
        let attn = AttentionMechanism::<TestBackend>::new(4, 6, 5, false, &device);
        let features = Tensor::<TestBackend, 4>::ones([2, 4, 3, 3], &device);

        let maps = attn.forward(features, None);
        assert_eq!(maps.dims(), [2, 5, 3, 3]);
        let values = maps.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| *v > 0.0 && *v < 1.0));
    }

    #[test]
    fn test_conditioned_module_accepts_coefficients() {
        let device = Default::default();
        let attn = AttentionMechanism::<TestBackend>::new(4, 6, 5, true, &device);
        let features = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device);

        let maps = attn.forward(features, Some(&LossWeights::from_variation(1.0)));
        assert_eq!(maps.dims(), [1, 5, 2, 2]);
    }

    #[test]
    fn test_named_parameters_cover_weights_and_biases() {
        let device = Default::default();
        let attn = AttentionMechanism::<TestBackend>::new(4, 6, 5, false, &device);
        let names: Vec<String> = attn.named_parameter_ids().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "reduce.weight",
                "reduce.bias",
                "refine.weight",
                "refine.bias",
                "classify.weight",
                "classify.bias",
            ]
        );
    }
}
