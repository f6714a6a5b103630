use burn::prelude::*;

use super::conv_bn::{ConvBn, ConvBnConfig};

/// MobileNetV2 inverted residual: 1x1 expansion, 3x3 depthwise, linear
/// 1x1 projection, with a skip connection when shapes allow it.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    expand: Option<ConvBn<B>>,
    depthwise: ConvBn<B>,
    project: ConvBn<B>,

    residual: bool,
}

impl<B: Backend> Bottleneck<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let input = x.clone();

        let x = match &self.expand {
            Some(expand) => expand.forward(x),
            None => x,
        };
        let x = self.depthwise.forward(x);
        let x = self.project.forward(x);

        if self.residual {
            input + x
        } else {
            x
        }
    }
}

#[derive(Config, Debug)]
pub struct BottleneckConfig {
    pub channels: [usize; 2],
    pub stride: usize,
    pub expand_ratio: usize,
}

impl BottleneckConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Bottleneck<B> {
        let [input, output] = self.channels;
        let hidden = input * self.expand_ratio;

        let expand = (self.expand_ratio != 1).then(|| ConvBnConfig::new([input, hidden], 1).init(device));

        Bottleneck {
            expand,
            depthwise: ConvBnConfig::new([hidden, hidden], 3)
                .with_stride(self.stride)
                .with_groups(hidden)
                .init(device),
            project: ConvBnConfig::new([hidden, output], 1)
                .with_relu6(false)
                .init(device),
            residual: self.stride == 1 && input == output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn residual_only_when_shapes_match() {
        let device = Default::default();

        let same = BottleneckConfig::new([16, 16], 1, 6).init::<NdArray>(&device);
        assert!(same.residual);
        assert!(same.expand.is_some());

        let strided = BottleneckConfig::new([16, 16], 2, 6).init::<NdArray>(&device);
        assert!(!strided.residual);

        let widened = BottleneckConfig::new([16, 24], 1, 1).init::<NdArray>(&device);
        assert!(!widened.residual);
        assert!(widened.expand.is_none());
    }

    #[test]
    fn stride_halves_resolution() {
        let device = Default::default();
        let block = BottleneckConfig::new([8, 12], 2, 6).init::<NdArray>(&device);
        let x = Tensor::<NdArray, 4>::ones([1, 8, 16, 16], &device);
        assert_eq!(block.forward(x).dims(), [1, 12, 8, 8]);
    }
}
