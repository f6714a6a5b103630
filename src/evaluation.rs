use std::{fmt, fs, path::Path};

use burn::{
    data::dataloader::batcher::Batcher, prelude::*, record::CompactRecorder,
    tensor::activation::sigmoid,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    data::{load_image, GeneratorConfig, ImageBatch, ImageBatcher, ImageFolder, ImageItem},
    error::{Error, IoContext, Result},
    model::Classifier,
    training::TrainingConfig,
};

/// Probabilities at or above this value are assigned to class 1.
pub const THRESHOLD: f32 = 0.5;

pub fn threshold(probability: f32) -> usize {
    if probability >= THRESHOLD {
        1
    } else {
        0
    }
}

pub fn correct_predictions<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2, Int>) -> usize {
    let predicted = sigmoid(logits).greater_equal_elem(THRESHOLD).int();
    let correct: i64 = predicted.equal(targets).int().sum().into_scalar().elem();
    correct as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub loss: f64,
    pub accuracy: f64,
}

/// Mean loss and accuracy over every sample of `folder`, in order.
pub fn evaluate<B: Backend>(model: &Classifier<B>, folder: &ImageFolder, device: &B::Device) -> Result<Score> {
    let mut loss_sum = 0.0;
    let mut correct = 0;
    let mut total = 0;

    for index in 0..folder.num_batches() {
        let Some(batch) = folder.batch::<B>(index, device)? else {
            break;
        };
        let count = batch.targets.dims()[0];

        let logits = model.forward(batch.images);
        let loss: f64 = model
            .loss(logits.clone(), batch.targets.clone())
            .into_scalar()
            .elem();

        loss_sum += loss * count as f64;
        correct += correct_predictions(logits, batch.targets);
        total += count;
    }

    let total = total.max(1) as f64;
    Ok(Score {
        loss: loss_sum / total,
        accuracy: correct as f64 / total,
    })
}

/// Class-1 probability for every sample of `folder`, in sample order.
pub fn predict<B: Backend>(model: &Classifier<B>, folder: &ImageFolder, device: &B::Device) -> Result<Vec<f32>> {
    let mut probabilities = Vec::with_capacity(folder.samples().len());

    for index in 0..folder.num_batches() {
        let Some(batch) = folder.batch::<B>(index, device)? else {
            break;
        };
        probabilities.extend(model.probabilities(batch.images).into_data().iter::<f32>());
    }

    Ok(probabilities)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub probability: f32,
    pub label: usize,
    pub class_name: String,
}

/// Classifies one image file, preprocessed the way `generator` prepares
/// training images.
pub fn predict_image<B: Backend>(
    model: &Classifier<B>,
    path: &Path,
    generator: &GeneratorConfig,
    class_names: &[String],
    device: &B::Device,
) -> Result<Prediction> {
    let image = load_image(path, generator.target_size, generator.color_mode)?;
    let batcher = ImageBatcher::<B>::new(device.clone(), generator.target_size, generator.color_mode);
    let batch: ImageBatch<B> = batcher.batch(vec![ImageItem { image, label: 0 }]);

    let probability: f32 = model.probabilities(batch.images).into_scalar().elem();
    let label = threshold(probability);

    Ok(Prediction {
        probability,
        label,
        class_name: class_names
            .get(label)
            .cloned()
            .unwrap_or_else(|| label.to_string()),
    })
}

/// Reads back the configuration and weights written by training.
pub fn load_model<B: Backend>(artifact_dir: &Path, device: &B::Device) -> Result<(Classifier<B>, TrainingConfig)> {
    let config_path = artifact_dir.join("config.json");
    let config = TrainingConfig::load(&config_path)
        .map_err(|err| Error::Config(format!("{}: {err:?}", config_path.display())))?;

    let model_path = artifact_dir.join("model");
    let model = config
        .model
        .init::<B>(device)
        .load_file(&model_path, &CompactRecorder::new(), device)
        .map_err(|err| Error::Record(format!("{}: {err:?}", model_path.display())))?;

    Ok((model, config))
}

pub fn load_class_names(artifact_dir: &Path) -> Result<Vec<String>> {
    let path = artifact_dir.join("classes.json");
    let json = fs::read_to_string(&path).at(&path)?;
    serde_json::from_str(&json).map_err(|err| Error::Config(format!("{}: {err}", path.display())))
}

pub fn mismatch_indices(predicted: &[usize], truth: &[usize]) -> Vec<usize> {
    predicted
        .iter()
        .zip(truth)
        .enumerate()
        .filter(|(_, (p, t))| p != t)
        .map(|(index, _)| index)
        .collect()
}

/// Where a flat prediction index lives in an unshuffled generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPosition {
    pub batch: usize,
    pub offset: usize,
}

impl BatchPosition {
    pub fn locate(index: usize, batch_size: usize) -> Self {
        Self {
            batch: index / batch_size,
            offset: index % batch_size,
        }
    }
}

/// Rows are true classes, columns predicted classes.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    counts: Array2<usize>,
}

impl ConfusionMatrix {
    pub fn new(truth: &[usize], predicted: &[usize], num_classes: usize) -> Self {
        let mut counts = Array2::zeros((num_classes, num_classes));
        for (&t, &p) in truth.iter().zip(predicted) {
            counts[[t, p]] += 1;
        }
        Self { counts }
    }

    pub fn num_classes(&self) -> usize {
        self.counts.nrows()
    }

    pub fn get(&self, truth: usize, predicted: usize) -> usize {
        self.counts[[truth, predicted]]
    }

    pub fn max(&self) -> usize {
        self.counts.iter().copied().max().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.sum()
    }

    pub fn correct(&self) -> usize {
        self.counts.diag().sum()
    }

    pub fn support(&self, class: usize) -> usize {
        self.counts.row(class).sum()
    }

    pub fn predicted(&self, class: usize) -> usize {
        self.counts.column(class).sum()
    }

    pub fn rows(&self) -> Vec<Vec<usize>> {
        self.counts.outer_iter().map(|row| row.to_vec()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    pub name: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassScore>,
    pub accuracy: f64,
    pub macro_avg: ClassScore,
    pub weighted_avg: ClassScore,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl ClassificationReport {
    pub fn new(matrix: &ConfusionMatrix, class_names: &[String]) -> Self {
        let classes: Vec<ClassScore> = (0..matrix.num_classes())
            .map(|class| {
                let hits = matrix.get(class, class);
                let precision = ratio(hits, matrix.predicted(class));
                let recall = ratio(hits, matrix.support(class));
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };

                ClassScore {
                    name: class_names
                        .get(class)
                        .cloned()
                        .unwrap_or_else(|| class.to_string()),
                    precision,
                    recall,
                    f1,
                    support: matrix.support(class),
                }
            })
            .collect();

        let total = matrix.total();
        let count = classes.len().max(1) as f64;
        let mean = |f: fn(&ClassScore) -> f64| classes.iter().map(f).sum::<f64>() / count;
        let weighted = |f: fn(&ClassScore) -> f64| {
            classes
                .iter()
                .map(|score| f(score) * score.support as f64)
                .sum::<f64>()
                / total.max(1) as f64
        };

        let macro_avg = ClassScore {
            name: "macro avg".into(),
            precision: mean(|s| s.precision),
            recall: mean(|s| s.recall),
            f1: mean(|s| s.f1),
            support: total,
        };
        let weighted_avg = ClassScore {
            name: "weighted avg".into(),
            precision: weighted(|s| s.precision),
            recall: weighted(|s| s.recall),
            f1: weighted(|s| s.f1),
            support: total,
        };

        Self {
            accuracy: ratio(matrix.correct(), total),
            classes,
            macro_avg,
            weighted_avg,
        }
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .classes
            .iter()
            .map(|score| score.name.len())
            .chain(["weighted avg".len()])
            .max()
            .unwrap_or(0);

        let row = |f: &mut fmt::Formatter<'_>, score: &ClassScore| {
            writeln!(
                f,
                "{:>width$}  {:>9.2} {:>9.2} {:>9.2} {:>9}",
                score.name, score.precision, score.recall, score.f1, score.support
            )
        };

        writeln!(
            f,
            "{:>width$}  {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;
        for score in &self.classes {
            row(f, score)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>width$}  {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        )?;
        row(f, &self.macro_avg)?;
        row(f, &self.weighted_avg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backbone::BackboneConfig, data::ColorMode, model::ClassifierConfig};
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn threshold_boundary() {
        assert_eq!(threshold(0.0), 0);
        assert_eq!(threshold(0.4999), 0);
        assert_eq!(threshold(0.5), 1);
        assert_eq!(threshold(0.5001), 1);
        assert_eq!(threshold(1.0), 1);
    }

    #[test]
    fn tensor_threshold_agrees_with_scalar_threshold() {
        let device = Default::default();
        // sigmoid(0) == 0.5 exactly
        let logits = Tensor::<TestBackend, 2>::from_floats([[-3.0], [0.0], [2.0], [-0.1]], &device);
        let targets = Tensor::<TestBackend, 2, Int>::from_data(TensorData::new(vec![0i64, 1, 1, 1], [4, 1]), &device);
        assert_eq!(correct_predictions(logits, targets), 3);
    }

    #[test]
    fn batch_position_round_trips_for_every_index() {
        for batch_size in [1, 7, 32] {
            for index in 0..500 {
                let position = BatchPosition::locate(index, batch_size);
                assert!(position.offset < batch_size);
                assert_eq!(position.batch * batch_size + position.offset, index);
            }
        }
        assert_eq!(BatchPosition::locate(47, 32), BatchPosition { batch: 1, offset: 15 });
    }

    #[test]
    fn batch_position_points_at_the_same_sample() {
        let dir = tempfile::tempdir().unwrap();
        crate::data::tests::write_fixture(dir.path(), 7);
        let folder = ImageFolder::open(
            dir.path(),
            GeneratorConfig::new().with_target_size([8, 8]).with_batch_size(3),
        )
        .unwrap();

        for (index, sample) in folder.samples().iter().enumerate() {
            let position = BatchPosition::locate(index, 3);
            assert_eq!(&folder.batch_samples(position.batch)[position.offset], sample);
        }
    }

    #[test]
    fn mismatches_by_index() {
        assert_eq!(mismatch_indices(&[0, 1, 1, 0, 1], &[0, 0, 1, 1, 1]), vec![1, 3]);
        assert!(mismatch_indices(&[1, 0], &[1, 0]).is_empty());
    }

    fn names() -> Vec<String> {
        vec!["cats".into(), "dogs".into()]
    }

    #[test]
    fn confusion_matrix_counts() {
        let truth = [0, 0, 0, 1, 1, 1, 1];
        let predicted = [0, 0, 1, 1, 1, 0, 1];
        let matrix = ConfusionMatrix::new(&truth, &predicted, 2);

        assert_eq!(matrix.rows(), vec![vec![2, 1], vec![1, 3]]);
        assert_eq!(matrix.total(), 7);
        assert_eq!(matrix.correct(), 5);
        assert_eq!(matrix.max(), 3);
    }

    #[test]
    fn report_scores() {
        let truth = [0, 0, 0, 1, 1, 1, 1];
        let predicted = [0, 0, 1, 1, 1, 0, 1];
        let report = ClassificationReport::new(&ConfusionMatrix::new(&truth, &predicted, 2), &names());

        let cats = &report.classes[0];
        assert!((cats.precision - 2.0 / 3.0).abs() < 1e-9);
        assert!((cats.recall - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(cats.support, 3);

        let dogs = &report.classes[1];
        assert!((dogs.precision - 0.75).abs() < 1e-9);
        assert!((dogs.recall - 0.75).abs() < 1e-9);

        assert!((report.accuracy - 5.0 / 7.0).abs() < 1e-9);
        assert!((report.macro_avg.f1 - (2.0 / 3.0 + 0.75) / 2.0).abs() < 1e-9);
        assert!((report.weighted_avg.recall - report.accuracy).abs() < 1e-9);
    }

    #[test]
    fn report_without_predictions_for_a_class() {
        let report = ClassificationReport::new(&ConfusionMatrix::new(&[0, 1], &[0, 0], 2), &names());
        assert_eq!(report.classes[1].precision, 0.0);
        assert_eq!(report.classes[1].f1, 0.0);
    }

    #[test]
    fn report_layout() {
        let report = ClassificationReport::new(&ConfusionMatrix::new(&[0, 1, 1], &[0, 1, 0], 2), &names());
        let text = report.to_string();
        let lines: Vec<&str> = text.lines().collect();

        let pad = |n: usize| " ".repeat(n);
        assert_eq!(lines[0], format!("{}precision    recall  f1-score   support", pad(14)));
        assert_eq!(lines[1], "");
        assert_eq!(
            lines[2],
            format!("{}cats{}0.50{}1.00{}0.67{}1", pad(8), pad(7), pad(6), pad(6), pad(9))
        );
        assert_eq!(lines[5], format!("{}accuracy{}0.67{}3", pad(4), pad(27), pad(9)));
        assert!(lines[7].starts_with("weighted avg"));
    }

    #[test]
    fn predictions_follow_sample_order() {
        let dir = tempfile::tempdir().unwrap();
        crate::data::tests::write_fixture(dir.path(), 3);
        let folder = ImageFolder::open(
            dir.path(),
            GeneratorConfig::new().with_target_size([32, 32]).with_batch_size(4),
        )
        .unwrap();

        let device = Default::default();
        let model = ClassifierConfig::new()
            .with_backbone(BackboneConfig::new().with_width_multiplier(0.35))
            .init::<TestBackend>(&device);

        let probabilities = predict(&model, &folder, &device).unwrap();
        assert_eq!(probabilities.len(), 6);

        let last = folder.batch::<TestBackend>(1, &device).unwrap().unwrap();
        let expected: Vec<f32> = model.probabilities(last.images).into_data().iter::<f32>().collect();
        assert_eq!(&probabilities[4..], &expected[..]);

        let score = evaluate(&model, &folder, &device).unwrap();
        assert!(score.loss.is_finite());
        assert!((0.0..=1.0).contains(&score.accuracy));
    }

    #[test]
    fn single_image_uses_the_trained_color_mode() {
        let dir = tempfile::tempdir().unwrap();
        crate::data::tests::write_fixture(dir.path(), 1);
        let image = dir.path().join("dogs/dog.0.png");

        let device = Default::default();
        let model = ClassifierConfig::new()
            .with_backbone(
                BackboneConfig::new()
                    .with_width_multiplier(0.35)
                    .with_input_channels(1),
            )
            .init::<TestBackend>(&device);
        let generator = GeneratorConfig::new()
            .with_target_size([32, 32])
            .with_color_mode(ColorMode::Grayscale);

        let prediction = predict_image(&model, &image, &generator, &names(), &device).unwrap();
        assert!((0.0..=1.0).contains(&prediction.probability));
        assert_eq!(prediction.class_name, names()[prediction.label]);
    }

    #[test]
    fn corrupt_image_fails_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        crate::data::tests::write_fixture(dir.path(), 2);
        let broken = dir.path().join("cats/cat.5.png");
        crate::data::tests::write_truncated(&broken);

        let folder = ImageFolder::open(
            dir.path(),
            GeneratorConfig::new().with_target_size([32, 32]).with_batch_size(4),
        )
        .unwrap();
        let device = Default::default();
        let model = ClassifierConfig::new()
            .with_backbone(BackboneConfig::new().with_width_multiplier(0.35))
            .init::<TestBackend>(&device);

        assert!(matches!(evaluate(&model, &folder, &device), Err(Error::Image { .. })));
        assert!(matches!(predict(&model, &folder, &device), Err(Error::Image { .. })));
    }
}
