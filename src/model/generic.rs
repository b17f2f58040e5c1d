use anyhow::Result;
use burn::module::Module;
use burn::nn::loss::CrossEntropyLoss;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use tracing::info;

use super::attention::AttentionMechanism;
use super::backbone::{resolve_taps, tap_channels, Backbone};
use super::loss::{mean_mask_loss, variation_mask_loss, LossBreakdown, LossWeights};
use crate::config::ModelConfig;

#[derive(Clone, Debug)]
pub struct GenericOutput<B: Backend> {
    /// Class scores for the masked images.
    pub logits: Tensor<B, 2>,
    /// Per-class maps at feature resolution, `[batch, classes, h, w]`.
    pub attention: Tensor<B, 4>,
    /// Label-selected masks at image resolution, `[batch, 1, H, W]`.
    pub masks: Tensor<B, 4>,
}

/// Frozen backbone wrapped with a trainable attention module.
///
/// The attention module reads backbone activations and produces one mask per
/// class. The mask of the labelled class is upsampled and multiplied into the
/// image, and the masked image is classified by the same backbone.
#[derive(Module, Debug)]
pub struct GenericModel<B: Backend> {
    pub body: Backbone<B>,
    pub attn_mech: AttentionMechanism<B>,
    taps: Vec<usize>,
}

impl<B: Backend> GenericModel<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let taps = resolve_taps(config.backbone, &config.layers)?;

        let mut body = Backbone::new(config, device);
        if let Some(path) = &config.backbone_weights {
            body = body.load_pretrained(path, device)?;
        }

        let in_channels = taps
            .iter()
            .map(|tap| tap_channels(config.backbone, config.base_width, *tap))
            .sum();
        let conditioned = config.loss_weighting().is_randomized();
        let attn_mech = AttentionMechanism::new(
            in_channels,
            config.attention_hidden,
            config.num_classes,
            conditioned,
            device,
        );

        info!(
            "Assembled {} with taps {:?} ({} attention input channels, conditioned={})",
            config.backbone, config.layers, in_channels, conditioned
        );

        // Only the attention module is trained.
        Ok(Self {
            body: body.no_grad(),
            attn_mech,
            taps,
        })
    }

    /// Backbone activations at every tap, resized to the first tap and stacked.
    fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut taps = self.body.forward_taps(images, &self.taps).into_iter();
        let Some(first) = taps.next() else {
            unreachable!("model assembled without taps")
        };
        let [_, _, height, width] = first.dims();

        let mut stacked = vec![first];
        for tap in taps {
            stacked.push(resize(tap, [height, width]));
        }
        Tensor::cat(stacked, 1)
    }

    pub fn forward(
        &self,
        images: Tensor<B, 4>,
        labels: Tensor<B, 1, Int>,
        coeffs: Option<&LossWeights>,
    ) -> GenericOutput<B> {
        let attention = self.attn_mech.forward(self.features(images.clone()), coeffs);
        let [_, _, height, width] = images.dims();
        let masks = self.attention_masks(&attention, labels, [height, width]);
        let logits = self.body.forward(images * masks.clone());

        GenericOutput {
            logits,
            attention,
            masks,
        }
    }

    /// Select each sample's class map and upsample it to `size`.
    pub fn attention_masks(
        &self,
        attention: &Tensor<B, 4>,
        labels: Tensor<B, 1, Int>,
        size: [usize; 2],
    ) -> Tensor<B, 4> {
        let [batch, _, height, width] = attention.dims();
        let index = labels
            .reshape([batch, 1, 1, 1])
            .repeat_dim(2, height)
            .repeat_dim(3, width);
        resize(attention.clone().gather(1, index), size)
    }

    pub fn compute_loss(
        &self,
        logits: Tensor<B, 2>,
        labels: Tensor<B, 1, Int>,
        masks: Tensor<B, 4>,
        weights: &LossWeights,
    ) -> LossBreakdown<B> {
        let device = logits.device();
        let ce = CrossEntropyLoss::new(None, &device).forward(logits, labels);
        let mean_mask = mean_mask_loss(masks.clone());
        let variation_mask = variation_mask_loss(masks);

        let total = ce.clone().mul_scalar(weights.ce)
            + mean_mask.clone().mul_scalar(weights.area)
            + variation_mask.clone().mul_scalar(weights.variation);

        LossBreakdown {
            total,
            ce,
            mean_mask,
            variation_mask,
        }
    }
}

/// Bilinear resize (corners aligned) as `rows · x · colsᵀ`.
///
/// Plain matmuls keep the backward pass available on every backend, which
/// the masks need since the loss flows back through the upsampling.
fn resize<B: Backend>(x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [batch, channels, height, width] = x.dims();
    if [height, width] == size {
        return x;
    }
    let device = x.device();
    let planes = batch * channels;

    let rows = interpolation_matrix::<B>(height, size[0], &device)
        .unsqueeze::<3>()
        .repeat_dim(0, planes);
    let cols = interpolation_matrix::<B>(width, size[1], &device)
        .transpose()
        .unsqueeze::<3>()
        .repeat_dim(0, planes);

    rows.matmul(x.reshape([planes, height, width]))
        .matmul(cols)
        .reshape([batch, channels, size[0], size[1]])
}

/// `[output, input]` linear interpolation weights; each row sums to one.
fn interpolation_matrix<B: Backend>(input: usize, output: usize, device: &B::Device) -> Tensor<B, 2> {
    let scale = if output > 1 {
        (input - 1) as f32 / (output - 1) as f32
    } else {
        0.0
    };
    let mut weights = vec![0.0f32; output * input];
    for (row, chunk) in weights.chunks_mut(input).enumerate() {
        let pos = row as f32 * scale;
        let lo = (pos.floor() as usize).min(input - 1);
        let hi = (lo + 1).min(input - 1);
        let frac = pos - lo as f32;
        chunk[lo] += 1.0 - frac;
        chunk[hi] += frac;
    }
    Tensor::from_data(TensorData::new(weights, [output, input]), device)
}
