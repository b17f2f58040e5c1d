use burn::tensor::{backend::Backend, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Coefficients of the three loss terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub ce: f32,
    pub area: f32,
    pub variation: f32,
}

impl LossWeights {
    /// Affine maps from a trade-off variable `var` in `[-1, 1]`.
    pub fn from_variation(var: f32) -> Self {
        Self {
            ce: 1.5 + 0.5 * var,
            area: 1.75 + 1.25 * var,
            variation: 0.0125 + 0.0075 * var,
        }
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1> {
        Tensor::from_floats([self.ce, self.area, self.variation], device)
    }
}

impl Default for LossWeights {
    fn default() -> Self {
        Self::from_variation(0.0)
    }
}

/// How the loss terms are weighted for each training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossWeighting {
    Fixed(LossWeights),
    /// A fresh trade-off is drawn for every batch and also fed to the model.
    Randomized,
}

impl Default for LossWeighting {
    fn default() -> Self {
        LossWeighting::Fixed(LossWeights::default())
    }
}

impl LossWeighting {
    pub fn is_randomized(&self) -> bool {
        matches!(self, LossWeighting::Randomized)
    }

    /// Weights for the next step, plus whether they condition the model.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> (LossWeights, Option<LossWeights>) {
        match self {
            LossWeighting::Fixed(weights) => (*weights, None),
            LossWeighting::Randomized => {
                let weights = LossWeights::from_variation(rng.gen_range(-1.0..=1.0));
                (weights, Some(weights))
            }
        }
    }
}

/// The composite objective and its unweighted components.
#[derive(Debug, Clone)]
pub struct LossBreakdown<B: Backend> {
    pub total: Tensor<B, 1>,
    pub ce: Tensor<B, 1>,
    pub mean_mask: Tensor<B, 1>,
    pub variation_mask: Tensor<B, 1>,
}

/// Average mask coverage.
pub fn mean_mask_loss<B: Backend>(masks: Tensor<B, 4>) -> Tensor<B, 1> {
    masks.mean()
}

/// Mean squared difference between vertically and horizontally adjacent mask values.
pub fn variation_mask_loss<B: Backend>(masks: Tensor<B, 4>) -> Tensor<B, 1> {
    let [batch, channels, height, width] = masks.dims();
    let mut loss = Tensor::<B, 1>::zeros([1], &masks.device());

    if height > 1 {
        let dh = masks.clone().slice([0..batch, 0..channels, 1..height, 0..width])
            - masks.clone().slice([0..batch, 0..channels, 0..height - 1, 0..width]);
        loss = loss + dh.powf_scalar(2.0).mean();
    }
    if width > 1 {
        let dw = masks.clone().slice([0..batch, 0..channels, 0..height, 1..width])
            - masks.slice([0..batch, 0..channels, 0..height, 0..width - 1]);
        loss = loss + dw.powf_scalar(2.0).mean();
    }
    loss
}
