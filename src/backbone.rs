use std::path::Path;

use burn::{prelude::*, record::CompactRecorder};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{Error, Result},
    module::{
        bottleneck::{Bottleneck, BottleneckConfig},
        conv_bn::{ConvBn, ConvBnConfig},
    },
};

const BOTTLENECK_SETTINGS: [[usize; 4]; 7] = [
    // t = expansion factor, c = channels, n = blocks, s = first stride
    [1, 16, 1, 1],
    [6, 24, 2, 2],
    [6, 32, 3, 2],
    [6, 64, 4, 2],
    [6, 96, 3, 1],
    [6, 160, 3, 2],
    [6, 320, 1, 1],
];

const STEM_CHANNELS: usize = 32;
const LAST_CHANNELS: usize = 1280;

/// Rounds `value` to the nearest multiple of 8 without dropping below 90%.
fn make_divisible(value: f64) -> usize {
    let divisor = 8;
    let rounded = ((value + divisor as f64 / 2.) as usize / divisor * divisor).max(divisor);
    if (rounded as f64) < 0.9 * value {
        rounded + divisor
    } else {
        rounded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pooling {
    Avg,
    Max,
}

#[derive(Module, Debug)]
enum Layer<B: Backend> {
    Conv(ConvBn<B>),
    Bottleneck(Bottleneck<B>),
}

impl<B: Backend> Layer<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Layer::Conv(conv) => conv.forward(x),
            Layer::Bottleneck(bottleneck) => bottleneck.forward(x),
        }
    }
}

/// MobileNetV2 feature extractor with global pooling, producing one
/// feature vector per image.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    layers: Vec<Layer<B>>,
    global_max: bool,
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.layers.iter().fold(x, |x, layer| layer.forward(x));

        let x = if self.global_max {
            x.max_dim(3).max_dim(2)
        } else {
            x.mean_dim(3).mean_dim(2)
        };

        x.flatten(1, 3)
    }

    pub fn stem_weight(&self) -> Option<Tensor<B, 4>> {
        match self.layers.first() {
            Some(Layer::Conv(conv)) => Some(conv.weight()),
            _ => None,
        }
    }
}

#[derive(Config, Debug)]
pub struct BackboneConfig {
    #[config(default = 3)]
    pub input_channels: usize,

    #[config(default = 1.0)]
    pub width_multiplier: f64,

    #[config(default = "Pooling::Max")]
    pub pooling: Pooling,
}

impl BackboneConfig {
    pub fn output_channels(&self) -> usize {
        make_divisible(LAST_CHANNELS as f64 * self.width_multiplier.max(1.0))
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let mut channels = make_divisible(STEM_CHANNELS as f64 * self.width_multiplier);
        let mut layers = vec![Layer::Conv(
            ConvBnConfig::new([self.input_channels, channels], 3)
                .with_stride(2)
                .init(device),
        )];

        for [t, c, n, s] in BOTTLENECK_SETTINGS {
            let output = make_divisible(c as f64 * self.width_multiplier);

            for i in 0..n {
                let stride = if i == 0 { s } else { 1 };
                layers.push(Layer::Bottleneck(
                    BottleneckConfig::new([channels, output], stride, t).init(device),
                ));
                channels = output;
            }
        }

        layers.push(Layer::Conv(
            ConvBnConfig::new([channels, self.output_channels()], 1).init(device),
        ));

        Backbone {
            layers,
            global_max: self.pooling == Pooling::Max,
        }
    }

    /// Loads pretrained weights from a record written with
    /// [`CompactRecorder`]; `path` is given without its `.mpk` extension.
    /// The returned backbone is frozen.
    pub fn init_pretrained<B: Backend>(&self, path: &Path, device: &B::Device) -> Result<Backbone<B>> {
        let backbone = self
            .init::<B>(device)
            .load_file(path, &CompactRecorder::new(), device)
            .map_err(|err| Error::Record(format!("{}: {err:?}", path.display())))?;

        info!("loaded pretrained backbone from {}", path.display());

        Ok(backbone.no_grad())
    }
}
