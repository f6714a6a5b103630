use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    prelude::*,
};
use image::{imageops::FilterType, DynamicImage, ImageReader};
use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{Error, IoContext, Result};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorMode {
    Rgb,
    Grayscale,
}

impl ColorMode {
    pub fn channels(&self) -> usize {
        match self {
            ColorMode::Rgb => 3,
            ColorMode::Grayscale => 1,
        }
    }
}

#[derive(Config, Debug)]
pub struct GeneratorConfig {
    /// `[height, width]` every image is resized to.
    #[config(default = "[224, 224]")]
    pub target_size: [usize; 2],

    #[config(default = 32)]
    pub batch_size: usize,

    #[config(default = "ColorMode::Rgb")]
    pub color_mode: ColorMode,

    #[config(default = false)]
    pub shuffle: bool,

    #[config(default = 42)]
    pub seed: u64,

    /// Loader threads, only used when shuffling.
    #[config(default = 4)]
    pub worker_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

#[derive(Debug, Clone)]
pub struct ImageItem {
    /// Channel-major pixels, `channels * height * width` bytes.
    pub image: Vec<u8>,
    pub label: usize,
}

/// An image that passed the header check but could not be decoded while
/// batching. Kept cloneable so it can travel through the data loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    pub path: PathBuf,
    pub message: String,
}

impl From<DecodeFailure> for Error {
    fn from(failure: DecodeFailure) -> Self {
        Error::Decode {
            path: failure.path,
            message: failure.message,
        }
    }
}

/// What the shuffled loader yields: a batch, or the first image that
/// failed to decode.
pub type LoadedBatch<B> = std::result::Result<ImageBatch<B>, DecodeFailure>;

/// A directory of `class_name/image` files, yielding binary-labelled
/// images in sorted order.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    config: GeneratorConfig,
    class_names: Vec<String>,
    samples: Vec<Sample>,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = fs::read_dir(dir)
        .at(dir)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .at(dir)?;
    paths.sort();
    Ok(paths)
}

pub fn load_image(path: &Path, target_size: [usize; 2], color_mode: ColorMode) -> Result<Vec<u8>> {
    let [height, width] = target_size;
    let image = ImageReader::open(path)
        .at(path)?
        .with_guessed_format()
        .at(path)?
        .decode()
        .map_err(|source| Error::Image {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(to_channel_major(
        image.resize_exact(width as u32, height as u32, FilterType::Triangle),
        color_mode,
    ))
}

fn to_channel_major(image: DynamicImage, color_mode: ColorMode) -> Vec<u8> {
    match color_mode {
        ColorMode::Grayscale => image.to_luma8().into_raw(),
        ColorMode::Rgb => {
            let image = image.to_rgb8();
            let plane = (image.width() * image.height()) as usize;
            let mut data = vec![0; plane * 3];

            for (i, pixel) in image.pixels().enumerate() {
                let [r, g, b] = pixel.0;
                data[i] = r;
                data[plane + i] = g;
                data[2 * plane + i] = b;
            }

            data
        }
    }
}

impl ImageFolder {
    pub fn open(root: &Path, config: GeneratorConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".into()));
        }

        let class_dirs: Vec<PathBuf> = sorted_entries(root)?
            .into_iter()
            .filter(|path| path.is_dir())
            .collect();

        let class_names: Vec<String> = class_dirs
            .iter()
            .filter_map(|dir| dir.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();

        if class_names.len() != 2 {
            return Err(Error::ClassLayout {
                dir: root.to_path_buf(),
                found: class_names,
            });
        }

        let mut samples = vec![];
        for (label, dir) in class_dirs.iter().enumerate() {
            samples.extend(
                sorted_entries(dir)?
                    .into_iter()
                    .filter(|path| path.is_file() && is_image(path))
                    .map(|path| Sample { path, label }),
            );
        }

        samples.par_iter().try_for_each(|sample| {
            image::image_dimensions(&sample.path)
                .map(|_| ())
                .map_err(|source| Error::Image {
                    path: sample.path.clone(),
                    source,
                })
        })?;

        debug!(
            "found {} images belonging to {} classes in {}",
            samples.len(),
            class_names.len(),
            root.display()
        );

        Ok(Self {
            config,
            class_names,
            samples,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn class_indices(&self) -> BTreeMap<String, usize> {
        self.class_names
            .iter()
            .enumerate()
            .map(|(index, name)| (name.clone(), index))
            .collect()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// True label of every sample, in sample order.
    pub fn labels(&self) -> Vec<usize> {
        self.samples.iter().map(|sample| sample.label).collect()
    }

    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.config.batch_size)
    }

    pub fn batch_samples(&self, batch_index: usize) -> &[Sample] {
        let start = batch_index * self.config.batch_size;
        if start >= self.samples.len() {
            return &[];
        }
        let end = (start + self.config.batch_size).min(self.samples.len());
        &self.samples[start..end]
    }

    /// Seeded random pick of `count` sample indices.
    pub fn preview_indices(&self, count: usize, seed: u64) -> Vec<usize> {
        let mut rng = StdRng::seed_from_u64(seed);
        rand::seq::index::sample(&mut rng, self.samples.len(), count.min(self.samples.len()))
            .into_vec()
    }

    fn decode(&self, sample: &Sample) -> Result<ImageItem> {
        Ok(ImageItem {
            image: load_image(&sample.path, self.config.target_size, self.config.color_mode)?,
            label: sample.label,
        })
    }

    pub fn batcher<B: Backend>(&self, device: B::Device) -> ImageBatcher<B> {
        ImageBatcher::new(device, self.config.target_size, self.config.color_mode)
    }

    /// Shuffled, multi-worker loader when the config asks for shuffling,
    /// an ordered single-threaded one otherwise. Images are decoded by the
    /// loader workers; a decode failure surfaces as an `Err` batch.
    pub fn loader<B: Backend>(&self, device: B::Device) -> Arc<dyn DataLoader<LoadedBatch<B>>> {
        let builder = DataLoaderBuilder::<Sample, LoadedBatch<B>>::new(self.batcher::<B>(device))
            .batch_size(self.config.batch_size);

        let builder = if self.config.shuffle {
            builder
                .shuffle(self.config.seed)
                .num_workers(self.config.worker_count)
        } else {
            builder
        };

        builder.build(self.clone())
    }

    /// Decodes the `batch_index`-th batch in sample order. `Ok(None)` past
    /// the last batch.
    pub fn batch<B: Backend>(&self, batch_index: usize, device: &B::Device) -> Result<Option<ImageBatch<B>>> {
        let samples = self.batch_samples(batch_index);
        if samples.is_empty() {
            return Ok(None);
        }

        let items = samples
            .par_iter()
            .map(|sample| self.decode(sample))
            .collect::<Result<Vec<ImageItem>>>()?;

        let batcher = self.batcher::<B>(device.clone());
        Ok(Some(Batcher::<ImageItem, ImageBatch<B>>::batch(&batcher, items)))
    }
}

impl Dataset<Sample> for ImageFolder {
    fn get(&self, index: usize) -> Option<Sample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 2, Int>,
}

#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    target_size: [usize; 2],
    color_mode: ColorMode,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, target_size: [usize; 2], color_mode: ColorMode) -> Self {
        Self {
            device,
            target_size,
            color_mode,
        }
    }
}

impl<B: Backend> Batcher<ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ImageBatch<B> {
        let [height, width] = self.target_size;
        let channels = self.color_mode.channels();
        let count = items.len();

        let pixels: Vec<u8> = items
            .iter()
            .flat_map(|item| item.image.iter().copied())
            .collect();
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [count, channels, height, width]).convert::<B::FloatElem>(),
            &self.device,
        ) / 255.;

        let images = match self.color_mode {
            ColorMode::Rgb => {
                let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, &self.device).reshape([1, 3, 1, 1]);
                let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, &self.device).reshape([1, 3, 1, 1]);
                (images - mean) / std
            }
            ColorMode::Grayscale => images,
        };

        let labels: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let targets = Tensor::<B, 2, Int>::from_data(
            TensorData::new(labels, [count, 1]).convert::<B::IntElem>(),
            &self.device,
        );

        ImageBatch { images, targets }
    }
}

impl<B: Backend> Batcher<Sample, LoadedBatch<B>> for ImageBatcher<B> {
    fn batch(&self, samples: Vec<Sample>) -> LoadedBatch<B> {
        let items = samples
            .into_iter()
            .map(|sample| {
                let image = load_image(&sample.path, self.target_size, self.color_mode).map_err(|err| {
                    error!("{err}");
                    DecodeFailure {
                        path: sample.path.clone(),
                        message: err.to_string(),
                    }
                })?;
                Ok(ImageItem {
                    image,
                    label: sample.label,
                })
            })
            .collect::<std::result::Result<Vec<_>, DecodeFailure>>()?;

        Ok(Batcher::<ImageItem, ImageBatch<B>>::batch(self, items))
    }
}
