use anyhow::Result;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// Normalized images, `[batch, 3, crop, crop]`.
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn new(images: Tensor<B, 4>, labels: Tensor<B, 1, Int>) -> Self {
        Self { images, labels }
    }

    pub fn batch_size(&self) -> usize {
        self.images.dims()[0]
    }

    /// Build a batch from host buffers laid out as `[batch, 3, size, size]`.
    pub fn from_host(pixels: Vec<f32>, labels: Vec<i64>, size: usize, device: &B::Device) -> Self {
        let batch = labels.len();
        let images = Tensor::<B, 4>::from_data(TensorData::new(pixels, [batch, 3, size, size]), device);
        let labels = Tensor::<B, 1, Int>::from_ints(labels.as_slice(), device);
        Self { images, labels }
    }
}

/// Trait for data loading
pub trait DataLoader<B: Backend> {
    /// Get the next batch of the current epoch
    fn next_batch(&mut self) -> Result<Option<ImageBatch<B>>>;

    /// Rewind to the start of `epoch`, reshuffling if the loader shuffles
    fn reset(&mut self, epoch: usize);

    /// Number of batches in one epoch
    fn num_batches(&self) -> usize;
}

/// Deterministic random images with uniformly drawn labels.
pub struct SyntheticDataLoader<B: Backend> {
    batch_size: usize,
    image_size: usize,
    num_classes: usize,
    num_batches: usize,
    seed: u64,
    epoch: usize,
    current_batch: usize,
    device: B::Device,
}

impl<B: Backend> SyntheticDataLoader<B> {
    pub fn new(
        batch_size: usize,
        image_size: usize,
        num_classes: usize,
        num_batches: usize,
        seed: u64,
        device: B::Device,
    ) -> Self {
        Self {
            batch_size,
            image_size,
            num_classes,
            num_batches,
            seed,
            epoch: 0,
            current_batch: 0,
            device,
        }
    }

    /// The batch at `(epoch, index)`; identical on every call.
    pub fn batch_at(&self, epoch: usize, index: usize) -> ImageBatch<B> {
        let stream = (epoch as u64) << 32 | index as u64;
        let mut rng = StdRng::seed_from_u64(self.seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15));

        let pixel_count = self.batch_size * 3 * self.image_size * self.image_size;
        let pixels = (0..pixel_count).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let labels = (0..self.batch_size)
            .map(|_| rng.gen_range(0..self.num_classes) as i64)
            .collect();

        ImageBatch::from_host(pixels, labels, self.image_size, &self.device)
    }
}

impl<B: Backend> DataLoader<B> for SyntheticDataLoader<B> {
    fn next_batch(&mut self) -> Result<Option<ImageBatch<B>>> {
        if self.current_batch >= self.num_batches {
            return Ok(None);
        }

        let batch = self.batch_at(self.epoch, self.current_batch);
        self.current_batch += 1;
        Ok(Some(batch))
    }

    fn reset(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.current_batch = 0;
    }

    fn num_batches(&self) -> usize {
        self.num_batches
    }
}
