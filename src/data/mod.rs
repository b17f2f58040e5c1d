mod image_list;
mod image_loader;
mod loader;

pub use image_list::{parse_image_list, read_image_list, ImageEntry};
pub use image_loader::{load_sample, Augment, ImageListLoader};
pub use loader::{DataLoader, ImageBatch, SyntheticDataLoader};
