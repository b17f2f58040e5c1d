use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use image::imageops::{self, FilterType};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::path::Path;
use tracing::info;

use super::image_list::{read_image_list, ImageEntry};
use super::loader::{DataLoader, ImageBatch};

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, Copy)]
pub struct Augment {
    pub input_size: usize,
    pub crop_size: usize,
}

/// Shuffled ImageNet-style loader over an image list.
///
/// Each epoch gets its own permutation derived from the seed, and images in a
/// batch are decoded on a pool of `num_workers` threads.
pub struct ImageListLoader<B: Backend> {
    entries: Vec<ImageEntry>,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    augment: Augment,
    seed: u64,
    epoch: usize,
    pool: ThreadPool,
    device: B::Device,
}

impl<B: Backend> ImageListLoader<B> {
    pub fn from_list(
        list: &Path,
        img_dir: &Path,
        num_classes: usize,
        batch_size: usize,
        augment: Augment,
        num_workers: usize,
        seed: u64,
        device: B::Device,
    ) -> Result<Self> {
        let entries = read_image_list(list, img_dir, num_classes)?;
        info!("Loaded image list {:?} ({} images)", list, entries.len());
        Self::from_entries(entries, batch_size, augment, num_workers, seed, device)
    }

    pub fn from_entries(
        entries: Vec<ImageEntry>,
        batch_size: usize,
        augment: Augment,
        num_workers: usize,
        seed: u64,
        device: B::Device,
    ) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .build()
            .with_context(|| "Failed to start image decoding pool")?;

        let mut loader = Self {
            order: Vec::new(),
            entries,
            cursor: 0,
            batch_size,
            augment,
            seed,
            epoch: 0,
            pool,
            device,
        };
        loader.reset(0);
        Ok(loader)
    }

    fn sample_rng(&self, entry_idx: usize) -> StdRng {
        let stream = (self.epoch as u64) << 32 | entry_idx as u64;
        StdRng::seed_from_u64(self.seed.wrapping_add(stream.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
    }
}

impl<B: Backend> DataLoader<B> for ImageListLoader<B> {
    fn next_batch(&mut self) -> Result<Option<ImageBatch<B>>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let picked: Vec<(usize, StdRng)> = self.order[self.cursor..end]
            .iter()
            .map(|&idx| (idx, self.sample_rng(idx)))
            .collect();
        self.cursor = end;

        let entries = &self.entries;
        let augment = self.augment;
        let samples = self.pool.install(|| {
            picked
                .into_par_iter()
                .map(|(idx, mut rng)| {
                    let entry = &entries[idx];
                    load_sample(&entry.path, augment, &mut rng).map(|pixels| (pixels, entry.label))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut pixels = Vec::with_capacity(samples.len() * 3 * augment.crop_size * augment.crop_size);
        let mut labels = Vec::with_capacity(samples.len());
        for (sample, label) in samples {
            pixels.extend(sample);
            labels.push(label);
        }

        Ok(Some(ImageBatch::from_host(pixels, labels, augment.crop_size, &self.device)))
    }

    fn reset(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.cursor = 0;
        self.order = (0..self.entries.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        self.order.shuffle(&mut rng);
    }

    /// The final partial batch counts as a batch.
    fn num_batches(&self) -> usize {
        self.entries.len().div_ceil(self.batch_size)
    }
}

/// Decode, resize, random-crop, random-flip and normalize one image into CHW order.
pub fn load_sample<R: Rng>(path: &Path, augment: Augment, rng: &mut R) -> Result<Vec<f32>> {
    let rgb = image::open(path)
        .with_context(|| format!("Failed to open image: {:?}", path))?
        .to_rgb8();

    let input = augment.input_size as u32;
    let crop = augment.crop_size as u32;
    let resized = imageops::resize(&rgb, input, input, FilterType::Triangle);

    let x0 = rng.gen_range(0..=input - crop);
    let y0 = rng.gen_range(0..=input - crop);
    let mut cropped = imageops::crop_imm(&resized, x0, y0, crop, crop).to_image();
    if rng.gen_bool(0.5) {
        imageops::flip_horizontal_in_place(&mut cropped);
    }

    let plane = (crop * crop) as usize;
    let mut chw = vec![0.0f32; 3 * plane];
    for (i, pixel) in cropped.pixels().enumerate() {
        for c in 0..3 {
            chw[c * plane + i] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
    }
    Ok(chw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn write_images(dir: &TempDir, count: usize) -> Vec<ImageEntry> {
        (0..count)
            .map(|i| {
                let path = dir.path().join(format!("img_{i}.png"));
                let img = image::RgbImage::from_fn(12, 10, |x, _| image::Rgb([(x * 20) as u8, 0, 255]));
                img.save(&path).unwrap();
                ImageEntry {
                    path,
                    label: (i % 3) as i64,
                }
            })
            .collect()
    }

    #[test]
    fn test_loader_keeps_partial_batch() {
        let dir = TempDir::new().unwrap();
        let entries = write_images(&dir, 5);
        let augment = Augment {
            input_size: 10,
            crop_size: 8,
        };
        let mut loader =
            ImageListLoader::<TestBackend>::from_entries(entries, 2, augment, 2, 3, Default::default()).unwrap();
        assert_eq!(loader.num_batches(), 3);

        let mut sizes = Vec::new();
        while let Some(batch) = loader.next_batch().unwrap() {
            assert_eq!(batch.images.dims()[1..], [3, 8, 8]);
            sizes.push(batch.batch_size());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_epochs_are_shuffled_differently() {
        let dir = TempDir::new().unwrap();
        let entries = write_images(&dir, 16);
        let augment = Augment {
            input_size: 8,
            crop_size: 8,
        };
        let mut loader =
            ImageListLoader::<TestBackend>::from_entries(entries, 4, augment, 1, 3, Default::default()).unwrap();
        let first = loader.order.clone();
        loader.reset(1);
        assert_ne!(first, loader.order);
        loader.reset(0);
        assert_eq!(first, loader.order);
    }

    #[test]
    fn test_sample_is_normalized_chw() {
        let dir = TempDir::new().unwrap();
        let entries = write_images(&dir, 1);
        let augment = Augment {
            input_size: 6,
            crop_size: 4,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let chw = load_sample(&entries[0].path, augment, &mut rng).unwrap();
        assert_eq!(chw.len(), 3 * 4 * 4);
        // Blue channel is saturated everywhere.
        let blue = (1.0 - MEAN[2]) / STD[2];
        assert!(chw[32..].iter().all(|v| (v - blue).abs() < 1e-5));
    }

    #[test]
    fn test_missing_image_is_an_error() {
        let augment = Augment {
            input_size: 6,
            crop_size: 4,
        };
        let mut rng = StdRng::seed_from_u64(0);
        assert!(load_sample(Path::new("/nonexistent/x.png"), augment, &mut rng).is_err());
    }
}
