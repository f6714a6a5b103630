use burn::{
    module::AutodiffModule,
    nn::{loss::BinaryCrossEntropyLossConfig, Dropout, DropoutConfig, Linear, LinearConfig},
    prelude::*,
    tensor::{
        activation::{relu, sigmoid},
        backend::AutodiffBackend,
    },
};
use serde::{Deserialize, Serialize};

use crate::backbone::{Backbone, BackboneConfig};

#[derive(Module, Debug)]
pub struct Head<B: Backend> {
    hidden: Linear<B>,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> Head<B> {
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = relu(self.hidden.forward(features));
        let x = self.dropout.forward(x);
        self.output.forward(x)
    }

    pub fn hidden_shape(&self) -> [usize; 2] {
        self.hidden.weight.dims()
    }

    pub fn output_shape(&self) -> [usize; 2] {
        self.output.weight.dims()
    }
}

#[derive(Config, Debug)]
pub struct HeadConfig {
    #[config(default = 256)]
    pub hidden: usize,

    #[config(default = 0.4)]
    pub dropout: f64,
}

impl HeadConfig {
    pub fn init<B: Backend>(&self, features: usize, device: &B::Device) -> Head<B> {
        Head {
            hidden: LinearConfig::new(features, self.hidden).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.hidden, 1).init(device),
        }
    }
}

/// Frozen backbone plus a trainable head emitting one logit per image;
/// the logit is positive for the class with index 1.
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    backbone: Backbone<B>,
    head: Head<B>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub total: usize,
    pub trainable: usize,
    pub frozen: usize,
}

impl<B: Backend> Classifier<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        sigmoid(self.forward(images))
    }

    pub fn loss(&self, logits: Tensor<B, 2>, targets: Tensor<B, 2, Int>) -> Tensor<B, 1> {
        BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&logits.device())
            .forward(logits, targets)
    }

    pub fn head(&self) -> &Head<B> {
        &self.head
    }

    pub fn summary(&self) -> ModelSummary {
        let frozen = self.backbone.num_params();
        let trainable = self.head.num_params();

        ModelSummary {
            total: frozen + trainable,
            trainable,
            frozen,
        }
    }
}

impl<B: AutodiffBackend> Classifier<B> {
    /// Runs the backbone outside the autodiff graph and in inference mode,
    /// so its batch-norm statistics stay untouched while the head trains.
    pub fn forward_frozen(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.valid().forward(images.inner());
        self.head.forward(Tensor::from_inner(features))
    }
}

#[derive(Config, Debug)]
pub struct ClassifierConfig {
    #[config(default = "BackboneConfig::new()")]
    pub backbone: BackboneConfig,

    #[config(default = "HeadConfig::new()")]
    pub head: HeadConfig,
}

impl ClassifierConfig {
    /// Randomly initialised backbone, frozen all the same.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        self.init_with_backbone(self.backbone.init(device).no_grad(), device)
    }

    pub fn init_with_backbone<B: Backend>(&self, backbone: Backbone<B>, device: &B::Device) -> Classifier<B> {
        Classifier {
            backbone,
            head: self.head.init(self.backbone.output_channels(), device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;

    fn small_config() -> ClassifierConfig {
        ClassifierConfig::new().with_backbone(BackboneConfig::new().with_width_multiplier(0.35))
    }

    #[test]
    fn seeded_assembly_gives_identical_head_shapes() {
        let device = Default::default();

        TestBackend::seed(40);
        let first = ClassifierConfig::new().init::<TestBackend>(&device);
        TestBackend::seed(40);
        let second = ClassifierConfig::new().init::<TestBackend>(&device);

        assert_eq!(first.head().hidden_shape(), [1280, 256]);
        assert_eq!(first.head().output_shape(), [256, 1]);
        assert_eq!(first.head().hidden_shape(), second.head().hidden_shape());
        assert_eq!(first.head().output_shape(), second.head().output_shape());
    }

    #[test]
    fn one_probability_per_image() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::random([3, 3, 32, 32], burn::tensor::Distribution::Default, &device);
        let probabilities = model.probabilities(images);
        assert_eq!(probabilities.dims(), [3, 1]);

        let values: Vec<f32> = probabilities.into_data().iter::<f32>().collect();
        assert!(values.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn summary_splits_frozen_and_trainable() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);
        let summary = model.summary();

        let features = small_config().backbone.output_channels();
        assert_eq!(summary.trainable, features * 256 + 256 + 256 + 1);
        assert_eq!(summary.total, summary.trainable + summary.frozen);
        assert!(summary.frozen > 0);
    }

    #[test]
    fn only_the_head_receives_gradients() {
        type TrainBackend = Autodiff<TestBackend>;
        let device = Default::default();
        let model = small_config().init::<TrainBackend>(&device);

        let images = Tensor::<TrainBackend, 4>::ones([2, 3, 32, 32], &device);
        let targets = Tensor::<TrainBackend, 2, Int>::from_data([[0], [1]], &device);

        let logits = model.forward_frozen(images);
        let grads = model.loss(logits, targets).backward();

        assert!(model.head.hidden.weight.grad(&grads).is_some());
        assert!(model.head.output.weight.grad(&grads).is_some());
        let stem = model.backbone.stem_weight().unwrap();
        assert!(stem.grad(&grads).is_none());
    }
}
