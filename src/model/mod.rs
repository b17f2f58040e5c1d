pub mod attention;
pub mod backbone;
pub mod generic;
pub mod loss;
pub mod resnet;
pub mod vgg;

pub use attention::AttentionMechanism;
pub use backbone::{resolve_taps, Backbone};
pub use generic::{GenericModel, GenericOutput};
pub use loss::{LossBreakdown, LossWeighting, LossWeights};
