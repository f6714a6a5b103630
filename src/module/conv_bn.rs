use burn::{nn::conv::Conv2d, prelude::*, tensor::activation::relu};
use nn::{conv::Conv2dConfig, BatchNorm, BatchNormConfig, PaddingConfig2d};

/// Convolution followed by batch norm and, optionally, ReLU6.
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    relu6: bool,
}

impl<B: Backend> ConvBn<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);

        if self.relu6 {
            relu(x).clamp_max(6)
        } else {
            x
        }
    }

    pub fn weight(&self) -> Tensor<B, 4> {
        self.conv.weight.val()
    }
}

#[derive(Config, Debug)]
pub struct ConvBnConfig {
    channels: [usize; 2],

    kernel_size: usize,

    #[config(default = 1)]
    stride: usize,

    #[config(default = 1)]
    groups: usize,

    #[config(default = true)]
    relu6: bool,
}

impl ConvBnConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBn<B> {
        let padding = (self.kernel_size - 1) / 2;

        ConvBn {
            conv: Conv2dConfig::new(self.channels, [self.kernel_size, self.kernel_size])
                .with_stride([self.stride, self.stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_groups(self.groups)
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(self.channels[1]).init(device),
            relu6: self.relu6,
        }
    }
}
