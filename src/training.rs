use crate::{
    calibration::CalibrationConfig,
    data::{ClassificationBatch, ClassificationBatcher},
    dataset::{augmented, DatasetConfig, ImageFolder, ImageItem},
    error::{Error, Result},
    model::{DropNet, DropNetConfig},
};
use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::AdamConfig,
    prelude::*,
    record::CompactRecorder,
    tensor::{backend::AutodiffBackend, ElementConversion},
    train::{
        metric::{AccuracyMetric, LossMetric},
        ClassificationOutput, LearnerBuilder, TrainOutput, TrainStep, ValidStep,
    },
};
use std::{sync::Arc, time::Instant};

#[derive(Config)]
pub struct TrainingConfig {
    #[config(default = "DropNetConfig::new()")]
    pub model: DropNetConfig,
    #[config(default = "AdamConfig::new().with_epsilon(1e-7)")]
    pub optimizer: AdamConfig,
    #[config(default = "DatasetConfig::new()")]
    pub dataset: DatasetConfig,
    #[config(default = "CalibrationConfig::new()")]
    pub calibration: CalibrationConfig,
    #[config(default = 100)]
    pub num_epochs: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
}

fn classification_output<B: Backend>(
    output: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> ClassificationOutput<B> {
    let loss = CrossEntropyLossConfig::new()
        .init(&output.device())
        .forward(output.clone(), targets.clone());

    ClassificationOutput::new(loss, output, targets)
}

impl<B: Backend> DropNet<B> {
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        classification_output(self.forward(images), targets)
    }
}

impl<B: AutodiffBackend> DropNet<B> {
    /// Logits with the backbone run outside the autodiff graph.
    ///
    /// The backbone is frozen, so its batch norms keep their running
    /// statistics and only the head is recorded for backpropagation.
    pub fn forward_frozen(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.valid().forward(images.inner());
        self.classify(Tensor::from_inner(features))
    }
}

impl<B: AutodiffBackend> TrainStep<ClassificationBatch<B>, ClassificationOutput<B>> for DropNet<B> {
    fn step(&self, batch: ClassificationBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = classification_output(self.forward_frozen(batch.images), batch.targets);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<ClassificationBatch<B>, ClassificationOutput<B>> for DropNet<B> {
    fn step(&self, batch: ClassificationBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}

/// Trains the head on the augmented training split, validating on the test
/// split after every epoch. Returns the trained model without autodiff.
///
/// Both splits must hold `config.model.num_classes` classes of images at the
/// model input size.
pub fn train<B: AutodiffBackend>(
    artifact_dir: &str,
    config: &TrainingConfig,
    model: DropNet<B>,
    dataset_train: Arc<ImageFolder>,
    dataset_test: Arc<ImageFolder>,
    device: B::Device,
) -> Result<DropNet<B::InnerBackend>> {
    config.model.validate()?;
    let input_shape = config.model.input_shape();
    for split in [&dataset_train, &dataset_test] {
        split.check_layout(config.model.num_classes, input_shape)?;
    }

    std::fs::create_dir_all(artifact_dir).map_err(|err| Error::io(artifact_dir, err))?;
    let config_path = format!("{artifact_dir}/config.json");
    config
        .save(&config_path)
        .map_err(|err| Error::io(&config_path, err))?;

    B::seed(config.seed);

    let [height, width, _] = input_shape;
    let batcher = ClassificationBatcher::new(height, width);

    let dataloader_train = DataLoaderBuilder::new(batcher.clone())
        .batch_size(config.dataset.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(augmented(
            dataset_train,
            &config.dataset.augmentation,
            [height, width],
        ));

    let dataloader_test = DataLoaderBuilder::new(batcher)
        .batch_size(config.dataset.batch_size)
        .num_workers(config.num_workers)
        .build(dataset_test);

    let learner = LearnerBuilder::new(artifact_dir)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .with_application_logger(None)
        .devices(vec![device])
        .num_epochs(config.num_epochs)
        .summary()
        .build(model, config.optimizer.init(), config.learning_rate);

    let now = Instant::now();
    let model_trained = learner.fit(dataloader_train, dataloader_test);
    let elapsed = now.elapsed().as_secs();
    log::info!("Training completed in {}m{}s", elapsed / 60, elapsed % 60);

    model_trained
        .clone()
        .save_file(format!("{artifact_dir}/model"), &CompactRecorder::new())?;

    Ok(model_trained.valid())
}

/// Fraction of `dataset` the float model classifies correctly.
pub fn accuracy<B: Backend>(
    model: &DropNet<B>,
    dataset: Arc<ImageFolder>,
    batch_size: usize,
    device: &B::Device,
) -> f32 {
    let [height, width, _] = dataset.image_dims();
    let batcher = ClassificationBatcher::new(height, width);
    let batch_size = batch_size.max(1);

    let mut correct = 0;
    let mut total = 0;
    for start in (0..dataset.len()).step_by(batch_size) {
        let end = (start + batch_size).min(dataset.len());
        let items: Vec<ImageItem> = (start..end).filter_map(|i| dataset.get(i)).collect();
        let batch: ClassificationBatch<B> = batcher.batch(items, device);

        total += batch.targets.dims()[0];
        let predictions = model.forward(batch.images).argmax(1).squeeze::<1>(1);
        correct += predictions
            .equal(batch.targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>() as usize;
    }

    if total == 0 {
        return 0.0;
    }
    correct as f32 / total as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{tests::write_split, DatasetError};
    use crate::model::MobileNetConfig;
    use crate::Error;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Tolerance;

    type B = NdArray<f32>;

    fn tiny_config() -> TrainingConfig {
        TrainingConfig::new()
            .with_model(DropNetConfig::new().with_backbone(
                MobileNetConfig::new()
                    .with_input_height(32)
                    .with_input_width(40),
            ))
            .with_dataset(DatasetConfig::new().with_batch_size(2))
            .with_num_epochs(1)
            .with_num_workers(1)
    }

    #[test]
    fn default_hyperparameters() {
        let config = TrainingConfig::new();

        assert_eq!(config.num_epochs, 100);
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.dataset.batch_size, 32);
        assert_eq!(config.calibration.num_samples, 100);
        assert_eq!(config.model.input_shape(), [80, 100, 3]);

        let json: String = config
            .to_string()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        assert!(json.contains("\"epsilon\":1e-7"), "{json}");
    }

    #[test]
    fn config_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = tiny_config();

        config.save(&path).unwrap();
        let loaded = TrainingConfig::load(&path).unwrap();

        assert_eq!(loaded.model.backbone.input_height, 32);
        assert_eq!(loaded.num_epochs, 1);
        assert_eq!(loaded.calibration.source, config.calibration.source);
    }

    #[test]
    fn frozen_forward_matches_regular_forward() {
        let device = Default::default();
        let model: DropNet<Autodiff<B>> = tiny_config().model.init(&device);
        let images = Tensor::random(
            [2, 3, 32, 40],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );

        let frozen = model.forward_frozen(images.clone()).inner().into_data();
        let reference = model.valid().forward(images.inner()).into_data();

        frozen.assert_approx_eq::<f32>(&reference, Tolerance::absolute(1e-4));
    }

    #[test]
    fn train_step_only_updates_the_head() {
        let device = Default::default();
        let model: DropNet<Autodiff<B>> = tiny_config().model.init(&device);
        let batch = ClassificationBatch {
            images: Tensor::ones([2, 3, 32, 40], &device),
            targets: Tensor::from_data(TensorData::new(vec![0i64, 1], [2]), &device),
        };

        let images = batch.images.clone();
        let logits = model.forward_frozen(images);
        let grads = logits.sum().backward();

        assert!(model.head.weight.val().grad(&grads).is_some());
        assert!(model.backbone.stem.conv.weight.val().grad(&grads).is_none());

        let output = TrainStep::step(&model, batch);
        assert_eq!(output.item.output.dims(), [2, 2]);
    }

    #[test]
    fn accuracy_counts_matching_predictions() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), &["drop", "no_drop"], 3);

        let config = tiny_config();
        let device = Default::default();
        let folder = Arc::new(ImageFolder::load(dir.path(), 2, [32, 40]).unwrap());
        let model: DropNet<B> = config.model.init(&device);

        let value = accuracy(&model, folder.clone(), 2, &device);
        assert!((0.0..=1.0).contains(&value));

        let images = (0..folder.len())
            .map(|i| crate::data::image_tensor::<B>(folder.get(i).unwrap().pixels, 32, 40, &device))
            .collect();
        let predicted: Vec<i64> = model
            .forward(Tensor::stack(images, 0))
            .argmax(1)
            .into_data()
            .convert::<i64>()
            .to_vec()
            .unwrap();
        let labels = (0..folder.len()).map(|i| folder.get(i).unwrap().label as i64);
        let expected = predicted
            .iter()
            .zip(labels)
            .filter(|(p, l)| **p == *l)
            .count();
        assert!((value - expected as f32 / 6.0).abs() < 1e-6);
    }

    #[test]
    fn train_rejects_splits_at_another_size() {
        let dir = tempfile::tempdir().unwrap();
        write_split(&dir.path().join("train"), &["drop", "no_drop"], 1);
        let config = tiny_config();
        let device = Default::default();

        let split = Arc::new(ImageFolder::load(dir.path().join("train"), 2, [80, 100]).unwrap());
        let model: DropNet<Autodiff<B>> = config.model.init(&device);
        let artifact_dir = dir.path().join("artifacts");

        let err = train::<Autodiff<B>>(
            artifact_dir.to_str().unwrap(),
            &config,
            model,
            split.clone(),
            split,
            device,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Dataset(DatasetError::LayoutMismatch { .. })));
        assert!(!artifact_dir.exists());
    }

    #[test]
    fn train_rejects_inputs_too_small_for_the_backbone() {
        let dir = tempfile::tempdir().unwrap();
        write_split(&dir.path().join("train"), &["drop", "no_drop"], 1);
        let config = tiny_config().with_model(DropNetConfig::new().with_backbone(
            MobileNetConfig::new()
                .with_input_height(16)
                .with_input_width(20),
        ));
        let device = Default::default();

        let split = Arc::new(ImageFolder::load(dir.path().join("train"), 2, [16, 20]).unwrap());
        let model: DropNet<Autodiff<B>> = tiny_config().model.init(&device);

        let err = train::<Autodiff<B>>(
            dir.path().join("artifacts").to_str().unwrap(),
            &config,
            model,
            split.clone(),
            split,
            device,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Model(crate::model::ModelError::InputTooSmall { .. })));
    }
}
