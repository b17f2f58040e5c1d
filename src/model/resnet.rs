use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::{activation, backend::Backend, Tensor};

use super::backbone::batch_norm;

const STAGE_DEPTHS: [usize; 4] = [3, 4, 6, 3];
const EXPANSION: usize = 4;

/// Output channels of `layer1`..`layer4`.
pub fn stage_channels(base_width: usize) -> [usize; 4] {
    [1, 2, 4, 8].map(|mult| base_width * mult * EXPANSION)
}

#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    fn new(in_channels: usize, planes: usize, stride: usize, device: &B::Device) -> Self {
        let out_channels = planes * EXPANSION;
        let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        });

        Self {
            conv1: Conv2dConfig::new([in_channels, planes], [1, 1])
                .with_bias(false)
                .init(device),
            bn1: BatchNormConfig::new(planes).init(device),
            conv2: Conv2dConfig::new([planes, planes], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            bn2: BatchNormConfig::new(planes).init(device),
            conv3: Conv2dConfig::new([planes, out_channels], [1, 1])
                .with_bias(false)
                .init(device),
            bn3: BatchNormConfig::new(out_channels).init(device),
            downsample,
        }
    }

    fn forward(&self, input: Tensor<B, 4>, frozen: bool) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(down) => batch_norm(&down.bn, down.conv.forward(input.clone()), frozen),
            None => input.clone(),
        };

        let x = activation::relu(batch_norm(&self.bn1, self.conv1.forward(input), frozen));
        let x = activation::relu(batch_norm(&self.bn2, self.conv2.forward(x), frozen));
        let x = batch_norm(&self.bn3, self.conv3.forward(x), frozen);
        activation::relu(x + identity)
    }
}

#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    blocks: Vec<Bottleneck<B>>,
}

impl<B: Backend> Stage<B> {
    fn forward(&self, input: Tensor<B, 4>, frozen: bool) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(input, |x, block| block.forward(x, frozen))
    }
}

#[derive(Module, Debug)]
pub struct Resnet50<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    maxpool: MaxPool2d,
    stages: Vec<Stage<B>>,
    avgpool: AdaptiveAvgPool2d,
    fc: Linear<B>,
}

impl<B: Backend> Resnet50<B> {
    pub fn new(base_width: usize, num_classes: usize, device: &B::Device) -> Self {
        let mut stages = Vec::with_capacity(STAGE_DEPTHS.len());
        let mut in_channels = base_width;
        for (stage_idx, depth) in STAGE_DEPTHS.iter().enumerate() {
            let planes = base_width << stage_idx;
            let stride = if stage_idx == 0 { 1 } else { 2 };
            let mut blocks = Vec::with_capacity(*depth);
            for block_idx in 0..*depth {
                let block_stride = if block_idx == 0 { stride } else { 1 };
                blocks.push(Bottleneck::new(in_channels, planes, block_stride, device));
                in_channels = planes * EXPANSION;
            }
            stages.push(Stage { blocks });
        }

        Self {
            conv1: Conv2dConfig::new([3, base_width], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            bn1: BatchNormConfig::new(base_width).init(device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            stages,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(in_channels, num_classes).init(device),
        }
    }

    fn stem(&self, input: Tensor<B, 4>, frozen: bool) -> Tensor<B, 4> {
        let x = batch_norm(&self.bn1, self.conv1.forward(input), frozen);
        self.maxpool.forward(activation::relu(x))
    }

    /// Activations after `layer<tap>` for every tap in `taps` (1-based).
    pub fn forward_taps(&self, input: Tensor<B, 4>, taps: &[usize], frozen: bool) -> Vec<Tensor<B, 4>> {
        let last = taps.iter().copied().max().unwrap_or(0);
        let mut captured = Vec::with_capacity(taps.len());
        let mut x = self.stem(input, frozen);
        for (stage_idx, stage) in self.stages.iter().enumerate().take(last) {
            x = stage.forward(x, frozen);
            captured.push((stage_idx + 1, x.clone()));
        }

        taps.iter()
            .filter_map(|tap| {
                captured
                    .iter()
                    .find(|(layer, _)| layer == tap)
                    .map(|(_, x)| x.clone())
            })
            .collect()
    }

    pub fn forward(&self, input: Tensor<B, 4>, frozen: bool) -> Tensor<B, 2> {
        let x = self
            .stages
            .iter()
            .fold(self.stem(input, frozen), |x, stage| stage.forward(x, frozen));
        let [batch, channels, _, _] = x.dims();
        let x = self.avgpool.forward(x).reshape([batch, channels]);
        self.fc.forward(x)
    }
}
