use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::{activation, backend::Backend, Tensor};

/// Convolutions per block, in torchvision order.
const BLOCK_DEPTHS: [usize; 5] = [2, 2, 3, 3, 3];
/// Block widths as multiples of the base width.
const BLOCK_WIDTHS: [usize; 5] = [1, 2, 4, 8, 8];
const POOLED_SIZE: usize = 7;

/// Output channels after every element of the `features` sequence.
///
/// Indices follow torchvision's `vgg16().features`: each convolution and each
/// ReLU counts as one element, and every block ends with a max pool, so
/// `features.29` is the last ReLU and `features.30` the last pool.
pub fn feature_layout(base_width: usize) -> Vec<usize> {
    let mut layout = Vec::new();
    for (depth, mult) in BLOCK_DEPTHS.iter().zip(BLOCK_WIDTHS.iter()) {
        let channels = base_width * mult;
        for _ in 0..*depth {
            layout.push(channels); // conv
            layout.push(channels); // relu
        }
        layout.push(channels); // pool
    }
    layout
}

#[derive(Module, Debug)]
pub struct Vgg16<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
    avgpool: AdaptiveAvgPool2d,
    fc1: Linear<B>,
    fc2: Linear<B>,
    fc3: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> Vgg16<B> {
    pub fn new(base_width: usize, hidden: usize, num_classes: usize, device: &B::Device) -> Self {
        let mut convs = Vec::new();
        let mut in_channels = 3;
        for (depth, mult) in BLOCK_DEPTHS.iter().zip(BLOCK_WIDTHS.iter()) {
            let out_channels = base_width * mult;
            for _ in 0..*depth {
                convs.push(
                    Conv2dConfig::new([in_channels, out_channels], [3, 3])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .init(device),
                );
                in_channels = out_channels;
            }
        }

        let flat = in_channels * POOLED_SIZE * POOLED_SIZE;
        Self {
            convs,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            avgpool: AdaptiveAvgPool2dConfig::new([POOLED_SIZE, POOLED_SIZE]).init(),
            fc1: LinearConfig::new(flat, hidden).init(device),
            fc2: LinearConfig::new(hidden, hidden).init(device),
            fc3: LinearConfig::new(hidden, num_classes).init(device),
            dropout: DropoutConfig::new(0.5).init(),
        }
    }

    /// Run `features` up to the deepest requested index and return the
    /// activations at `taps`, in the order given.
    pub fn forward_taps(&self, input: Tensor<B, 4>, taps: &[usize]) -> Vec<Tensor<B, 4>> {
        let last = taps.iter().copied().max().unwrap_or(0);
        let mut captured: Vec<(usize, Tensor<B, 4>)> = Vec::with_capacity(taps.len());
        let mut keep = |index: usize, x: &Tensor<B, 4>| {
            if taps.contains(&index) {
                captured.push((index, x.clone()));
            }
            index >= last
        };

        let mut x = input;
        let mut index = 0;
        let mut convs = self.convs.iter();
        'blocks: for depth in BLOCK_DEPTHS {
            for _ in 0..depth {
                if let Some(conv) = convs.next() {
                    x = conv.forward(x);
                }
                if keep(index, &x) {
                    break 'blocks;
                }
                index += 1;
                x = activation::relu(x);
                if keep(index, &x) {
                    break 'blocks;
                }
                index += 1;
            }
            x = self.pool.forward(x);
            if keep(index, &x) {
                break;
            }
            index += 1;
        }

        taps.iter()
            .filter_map(|tap| {
                captured
                    .iter()
                    .find(|(index, _)| index == tap)
                    .map(|(_, x)| x.clone())
            })
            .collect()
    }

    /// Full classifier. `frozen` disables dropout.
    pub fn forward(&self, input: Tensor<B, 4>, frozen: bool) -> Tensor<B, 2> {
        let mut x = input;
        let mut convs = self.convs.iter();
        for depth in BLOCK_DEPTHS {
            for _ in 0..depth {
                if let Some(conv) = convs.next() {
                    x = activation::relu(conv.forward(x));
                }
            }
            x = self.pool.forward(x);
        }

        let x = self.avgpool.forward(x).flatten::<2>(1, 3);
        let x = activation::relu(self.fc1.forward(x));
        let x = if frozen { x } else { self.dropout.forward(x) };
        let x = activation::relu(self.fc2.forward(x));
        let x = if frozen { x } else { self.dropout.forward(x) };
        self.fc3.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_feature_layout_matches_torchvision_indices() {
        let layout = feature_layout(64);
        assert_eq!(layout.len(), 31);
        assert_eq!(layout[0], 64);
        assert_eq!(layout[4], 64);
        assert_eq!(layout[5], 128);
        assert_eq!(layout[29], 512);
        assert_eq!(layout[30], 512);
    }

    #[test]
    fn test_taps_and_logits_shapes() {
        let device = Default::default();
        let vgg = Vgg16::<TestBackend>::new(2, 8, 5, &device);
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);

        let taps = vgg.forward_taps(images.clone(), &[29, 9]);
        assert_eq!(taps.len(), 2);
        assert_eq!(taps[0].dims(), [2, 16, 2, 2]);
        assert_eq!(taps[1].dims(), [2, 4, 8, 8]);

        let logits = vgg.forward(images, true);
        assert_eq!(logits.dims(), [2, 5]);
    }
}
