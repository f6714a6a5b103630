use std::{fs, path::Path};

use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::CompactRecorder,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    backbone::Backbone,
    data::{ColorMode, GeneratorConfig, ImageFolder},
    error::{Error, IoContext, Result},
    evaluation::{correct_predictions, evaluate, Score},
    model::{Classifier, ClassifierConfig},
};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ClassifierConfig,

    pub optimizer: AdamConfig,

    #[config(default = 10)]
    pub epoch_count: usize,

    #[config(default = 32)]
    pub batch_size: usize,

    #[config(default = 224)]
    pub image_size: usize,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 1.0e-3)]
    pub learning_rate: f64,

    #[config(default = 4)]
    pub worker_count: usize,

    /// Must agree with `model.backbone.input_channels`.
    #[config(default = "ColorMode::Rgb")]
    pub color_mode: ColorMode,
}

impl TrainingConfig {
    pub fn generator(&self, shuffle: bool) -> GeneratorConfig {
        GeneratorConfig::new()
            .with_target_size([self.image_size, self.image_size])
            .with_batch_size(self.batch_size)
            .with_shuffle(shuffle)
            .with_seed(self.seed)
            .with_worker_count(self.worker_count)
            .with_color_mode(self.color_mode)
    }
}

/// Per-epoch metrics, one entry per completed epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub train_loss: Vec<f64>,
    pub train_accuracy: Vec<f64>,
    pub valid_loss: Vec<f64>,
    pub valid_accuracy: Vec<f64>,
}

fn first_extreme(values: &[f64], better: impl Fn(f64, f64) -> bool) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (index, &value)| match best {
            Some((_, current)) if !better(value, current) => best,
            _ => Some((index, value)),
        })
        .map(|(index, _)| index + 1)
}

impl History {
    pub fn push(&mut self, train: Score, valid: Score) {
        self.train_loss.push(train.loss);
        self.train_accuracy.push(train.accuracy);
        self.valid_loss.push(valid.loss);
        self.valid_accuracy.push(valid.accuracy);
    }

    pub fn epochs(&self) -> usize {
        self.train_loss.len()
    }

    /// 1-based epoch with the lowest validation loss, first one on ties.
    pub fn best_loss_epoch(&self) -> Option<usize> {
        first_extreme(&self.valid_loss, |value, best| value < best)
    }

    /// 1-based epoch with the highest validation accuracy, first one on ties.
    pub fn best_accuracy_epoch(&self) -> Option<usize> {
        first_extreme(&self.valid_accuracy, |value, best| value > best)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|err| Error::Config(err.to_string()))?;
        fs::write(path, json).at(path)
    }
}

fn create_artifact_dir(artifact_dir: &Path) -> Result<()> {
    fs::remove_dir_all(artifact_dir).ok();
    fs::create_dir_all(artifact_dir).at(artifact_dir)
}

/// Fits the head of a classifier built on `backbone`, validating after
/// every epoch. Writes `config.json`, `classes.json`, `model.mpk` and
/// `history.json` into `artifact_dir`.
///
/// An image that fails to decode aborts training.
pub fn train<B: AutodiffBackend>(
    artifact_dir: &Path,
    config: &TrainingConfig,
    backbone: Backbone<B>,
    train_dir: &Path,
    valid_dir: &Path,
    device: B::Device,
) -> Result<(Classifier<B>, History)> {
    if config.color_mode.channels() != config.model.backbone.input_channels {
        return Err(Error::Config(format!(
            "color mode {:?} yields {} channels but the backbone expects {}",
            config.color_mode,
            config.color_mode.channels(),
            config.model.backbone.input_channels
        )));
    }

    create_artifact_dir(artifact_dir)?;

    let config_path = artifact_dir.join("config.json");
    config.save(&config_path).at(&config_path)?;

    B::seed(config.seed);

    let train_folder = ImageFolder::open(train_dir, config.generator(true))?;
    let valid_folder = ImageFolder::open(valid_dir, config.generator(false))?;
    info!(
        "train: {} images, valid: {} images, classes {:?}",
        train_folder.samples().len(),
        valid_folder.samples().len(),
        train_folder.class_indices()
    );

    let classes_path = artifact_dir.join("classes.json");
    let classes = serde_json::to_string_pretty(train_folder.class_names())
        .map_err(|err| Error::Config(err.to_string()))?;
    fs::write(&classes_path, classes).at(&classes_path)?;

    let mut model = config.model.init_with_backbone(backbone, &device);
    let summary = model.summary();
    info!(
        "parameters: {} total, {} trainable, {} frozen",
        summary.total, summary.trainable, summary.frozen
    );

    let mut optimizer = config.optimizer.init::<B, Classifier<B>>();
    let dataloader_train = train_folder.loader::<B>(device.clone());
    let mut history = History::default();

    for epoch in 1..=config.epoch_count {
        let mut loss_sum = 0.0;
        let mut correct = 0;
        let mut total = 0;

        for (iteration, batch) in dataloader_train.iter().enumerate() {
            let batch = batch?;
            let count = batch.targets.dims()[0];

            let logits = model.forward_frozen(batch.images);
            let loss = model.loss(logits.clone(), batch.targets.clone());
            let loss_value: f64 = loss.clone().into_scalar().elem();

            loss_sum += loss_value * count as f64;
            correct += correct_predictions(logits.detach(), batch.targets);
            total += count;

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(config.learning_rate, model, grads);

            debug!("epoch {epoch} iteration {}: loss {loss_value:.4}", iteration + 1);
        }

        let train_score = Score {
            loss: loss_sum / total.max(1) as f64,
            accuracy: correct as f64 / total.max(1) as f64,
        };
        let valid_score = evaluate(&model.valid(), &valid_folder, &device)?;

        info!(
            "epoch {epoch}/{}: loss {:.4} - accuracy {:.4} - val_loss {:.4} - val_accuracy {:.4}",
            config.epoch_count,
            train_score.loss,
            train_score.accuracy,
            valid_score.loss,
            valid_score.accuracy
        );
        history.push(train_score, valid_score);
    }

    model
        .clone()
        .save_file(artifact_dir.join("model"), &CompactRecorder::new())
        .map_err(|err| Error::Record(format!("{err:?}")))?;
    history.save(&artifact_dir.join("history.json"))?;

    Ok((model, history))
}
