//! The end-to-end stages, each taking explicit paths and settings.

use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{prelude::Backend, tensor::backend::AutodiffBackend};
use serde::Serialize;
use tracing::info;

use crate::{
    charts::{self, Tile, GALLERY_MAX_TILES},
    data::ImageFolder,
    error::{Error, IoContext, Result},
    evaluation::{
        self, load_class_names, load_model, mismatch_indices, predict_image, threshold, BatchPosition,
        ClassificationReport, ConfusionMatrix, Prediction, Score,
    },
    split::{count_classes, partition, Split, SplitPlan, SplitSummary},
    training::{self, History, TrainingConfig},
};

const PREVIEW_COUNT: usize = 8;

fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

pub fn split_dataset(source: &Path, output: &Path, overwrite: bool) -> Result<SplitSummary> {
    let plan = SplitPlan::default();

    for (prefix, count) in count_classes(source, &plan.classes)? {
        info!("number of {prefix} images: {count}");
    }

    partition(source, output, &plan, overwrite)?;

    let summary = SplitSummary::count_tree(output, &plan)?;
    summary.log();
    Ok(summary)
}

/// Trains on `data_dir/train`, validates on `data_dir/valid`, then draws
/// the learning curves and a preview of training images.
pub fn train_model<B: AutodiffBackend>(
    data_dir: &Path,
    artifact_dir: &Path,
    config: &TrainingConfig,
    backbone_weights: &Path,
    device: B::Device,
) -> Result<History> {
    let backbone = config
        .model
        .backbone
        .init_pretrained::<B>(backbone_weights, &device)?;

    let train_dir = data_dir.join(Split::Train.dir_name());
    let (_, history) = training::train::<B>(
        artifact_dir,
        config,
        backbone,
        &train_dir,
        &data_dir.join(Split::Valid.dir_name()),
        device,
    )?;

    charts::training_curves(&history, &artifact_dir.join("curves.svg"))?;
    if let (Some(loss), Some(accuracy)) = (history.best_loss_epoch(), history.best_accuracy_epoch()) {
        info!(
            "best epoch by val_loss: {loss} ({:.4}), by val_accuracy: {accuracy} ({:.4})",
            history.valid_loss[loss - 1],
            history.valid_accuracy[accuracy - 1]
        );
    }

    let folder = ImageFolder::open(&train_dir, config.generator(false))?;
    let tiles: Vec<Tile> = folder
        .preview_indices(PREVIEW_COUNT, config.seed)
        .into_iter()
        .map(|index| {
            let sample = &folder.samples()[index];
            Tile {
                image: absolute(&sample.path),
                caption: folder.class_names()[sample.label].clone(),
            }
        })
        .collect();
    charts::gallery(&tiles, &artifact_dir.join("samples.svg"))?;

    Ok(history)
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationSummary {
    pub valid: Score,
    pub test: Score,
    pub confusion_matrix: Vec<Vec<usize>>,
    pub mismatches: Vec<usize>,
    pub report: ClassificationReport,
}

/// Scores the saved model on the valid and test splits and writes the
/// confusion matrix, classification report and mismatch gallery.
pub fn evaluate_model<B: Backend>(data_dir: &Path, artifact_dir: &Path, device: B::Device) -> Result<EvaluationSummary> {
    let (model, config) = load_model::<B>(artifact_dir, &device)?;
    let generator = config.generator(false);

    let valid = ImageFolder::open(&data_dir.join(Split::Valid.dir_name()), generator.clone())?;
    let test = ImageFolder::open(&data_dir.join(Split::Test.dir_name()), generator)?;

    let valid_score = evaluation::evaluate(&model, &valid, &device)?;
    info!("validation loss = {:.4}, accuracy = {:.4}", valid_score.loss, valid_score.accuracy);
    let test_score = evaluation::evaluate(&model, &test, &device)?;
    info!("test loss = {:.4}, accuracy = {:.4}", test_score.loss, test_score.accuracy);

    let predicted: Vec<usize> = evaluation::predict(&model, &test, &device)?
        .into_iter()
        .map(threshold)
        .collect();
    let truth = test.labels();
    let names = test.class_names();

    let matrix = ConfusionMatrix::new(&truth, &predicted, names.len());
    charts::confusion_matrix(&matrix, names, &artifact_dir.join("confusion_matrix.svg"))?;

    let report = ClassificationReport::new(&matrix, names);
    info!("classification report:\n{report}");
    let report_path = artifact_dir.join("report.txt");
    fs::write(&report_path, report.to_string()).at(&report_path)?;

    let mismatches = mismatch_indices(&predicted, &truth);
    info!("{} mismatched test images", mismatches.len());

    let batch_size = test.config().batch_size;
    let tiles: Vec<Tile> = mismatches
        .iter()
        .take(GALLERY_MAX_TILES)
        .map(|&index| {
            let position = BatchPosition::locate(index, batch_size);
            let sample = &test.batch_samples(position.batch)[position.offset];
            Tile {
                image: absolute(&sample.path),
                caption: format!("True: {}\nPredict: {}", names[truth[index]], names[predicted[index]]),
            }
        })
        .collect();
    charts::gallery(&tiles, &artifact_dir.join("mismatches.svg"))?;

    let summary = EvaluationSummary {
        valid: valid_score,
        test: test_score,
        confusion_matrix: matrix.rows(),
        mismatches,
        report,
    };
    let scores_path = artifact_dir.join("scores.json");
    let json = serde_json::to_string_pretty(&summary).map_err(|err| Error::Config(err.to_string()))?;
    fs::write(&scores_path, json).at(&scores_path)?;

    Ok(summary)
}

pub fn classify_image<B: Backend>(artifact_dir: &Path, image: &Path, device: B::Device) -> Result<Prediction> {
    let (model, config) = load_model::<B>(artifact_dir, &device)?;
    let class_names = load_class_names(artifact_dir)?;

    let prediction = predict_image(&model, image, &config.generator(false), &class_names, &device)?;
    info!(
        "{}: {} (p = {:.4})",
        image.display(),
        prediction.class_name,
        prediction.probability
    );

    Ok(prediction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backbone::BackboneConfig, data::tests::write_fixture, model::ClassifierConfig};
    use burn::{
        backend::{Autodiff, NdArray},
        module::Module,
        optim::AdamConfig,
    };

    #[test]
    fn evaluation_stage_writes_reports() {
        let data = tempfile::tempdir().unwrap();
        for (split, per_class) in [("train", 3), ("valid", 2), ("test", 3)] {
            write_fixture(&data.path().join(split), per_class);
        }
        let artifact = tempfile::tempdir().unwrap();

        let model_config =
            ClassifierConfig::new().with_backbone(BackboneConfig::new().with_width_multiplier(0.35));
        let config = TrainingConfig::new(model_config.clone(), AdamConfig::new())
            .with_epoch_count(1)
            .with_batch_size(4)
            .with_image_size(32)
            .with_worker_count(1);

        type TrainBackend = Autodiff<NdArray<f32>>;
        let device = Default::default();
        let backbone = model_config.backbone.init::<TrainBackend>(&device).no_grad();
        training::train::<TrainBackend>(
            artifact.path(),
            &config,
            backbone,
            &data.path().join("train"),
            &data.path().join("valid"),
            device,
        )
        .unwrap();

        let summary = evaluate_model::<NdArray<f32>>(data.path(), artifact.path(), Default::default()).unwrap();
        assert_eq!(summary.report.classes.len(), 2);
        assert_eq!(summary.confusion_matrix.iter().flatten().sum::<usize>(), 6);
        assert!(summary.mismatches.iter().all(|&index| index < 6));

        for file in ["report.txt", "scores.json", "confusion_matrix.svg", "mismatches.svg"] {
            assert!(artifact.path().join(file).exists(), "{file} missing");
        }

        let image = data.path().join("test/dogs/dog.0.png");
        let prediction = classify_image::<NdArray<f32>>(artifact.path(), &image, Default::default()).unwrap();
        assert!(["cats", "dogs"].contains(&prediction.class_name.as_str()));
        assert_eq!(prediction.label, threshold(prediction.probability));
    }
}
