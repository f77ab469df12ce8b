//! End-to-end run: load the image folders, train the head, calibrate,
//! quantize and write the TFLite model.

use crate::{
    calibration::{calibrate, RepresentativeDataset},
    dataset::{ImageFolder, TEST_SPLIT, TRAINING_SPLIT},
    error::Result,
    interpreter,
    model::{BackboneWeights, DropNet},
    quantize::{quantize_model, QuantizedGraph},
    tflite::{self, ModelSummary},
    training::{self, TrainingConfig},
};
use burn::{prelude::*, tensor::backend::AutodiffBackend};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Locations used by a run.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Directory holding `training_set/` and `test_set/`.
    pub data_root: PathBuf,
    /// Destination of the `.tflite` model.
    pub output: PathBuf,
    /// Directory receiving the config, the float model and training logs.
    pub artifact_dir: String,
    /// Pretrained backbone record. A random backbone is used without it.
    pub backbone_weights: Option<BackboneWeights>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("imageVer3"),
            output: PathBuf::from("trained.tflite"),
            artifact_dir: "artifacts".to_string(),
            backbone_weights: None,
        }
    }
}

/// Outcome of an export.
#[derive(Clone, Debug)]
pub struct ExportReport {
    pub path: PathBuf,
    pub num_bytes: usize,
    pub summary: ModelSummary,
    /// Accuracy of the int8 model on the test split.
    pub quantized_accuracy: f32,
}

/// Training and test splits of `data_root`, resized to the model input. The
/// training split must hold `config.model.num_classes` class folders and the
/// test split the same ones.
pub fn load_splits(
    data_root: &Path,
    config: &TrainingConfig,
) -> Result<(Arc<ImageFolder>, Arc<ImageFolder>)> {
    let [height, width, _] = config.model.input_shape();
    let size = [height, width];

    let train = ImageFolder::load(
        data_root.join(TRAINING_SPLIT),
        config.model.num_classes,
        size,
    )?;
    let test = ImageFolder::load_matching(data_root.join(TEST_SPLIT), train.classes(), size)?;

    log::info!("Classes: {:?}", train.classes());

    Ok((Arc::new(train), Arc::new(test)))
}

/// Builds the model, loading backbone weights when given.
pub fn build_model<B: Backend>(
    config: &TrainingConfig,
    backbone_weights: Option<&BackboneWeights>,
    device: &B::Device,
) -> Result<DropNet<B>> {
    config.model.validate()?;

    match backbone_weights {
        Some(weights) => Ok(config.model.init_pretrained(weights, device)?),
        None => {
            log::warn!("No backbone weights given, training on a randomly initialized backbone");
            Ok(config.model.init(device))
        }
    }
}

/// Calibrates, quantizes and writes an already trained model.
pub fn export<B: Backend>(
    model: &DropNet<B>,
    train: Arc<ImageFolder>,
    test: &ImageFolder,
    config: &TrainingConfig,
    output: &Path,
    device: &B::Device,
) -> Result<ExportReport> {
    let graph = quantize_trained(model, train, config, device)?;

    let bytes = tflite::serialize(&graph);
    tflite::write_model(output, &bytes)?;
    log::info!("Wrote {} bytes to {}", bytes.len(), output.display());

    let summary = tflite::inspect(&bytes)?;
    let quantized_accuracy = interpreter::evaluate(&graph, test)?;
    log::info!("Int8 accuracy on {}: {:.4}", test.root().display(), quantized_accuracy);

    Ok(ExportReport {
        path: output.to_path_buf(),
        num_bytes: bytes.len(),
        summary,
        quantized_accuracy,
    })
}

/// Collects activation ranges from the representative dataset and builds
/// the int8 graph.
pub fn quantize_trained<B: Backend>(
    model: &DropNet<B>,
    train: Arc<ImageFolder>,
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<QuantizedGraph> {
    let samples = RepresentativeDataset::<B>::new(
        train,
        &config.dataset.augmentation,
        &config.calibration,
        config.seed,
        device,
    );
    let ranges = calibrate(model, samples)?;

    Ok(quantize_model(model, config.model.input_shape(), &ranges)?)
}

/// Loads the data, trains, then exports the int8 model.
pub fn run<B: AutodiffBackend>(
    config: &TrainingConfig,
    options: &RunOptions,
    device: B::Device,
) -> Result<ExportReport> {
    let (train, test) = load_splits(&options.data_root, config)?;
    let model = build_model::<B>(config, options.backbone_weights.as_ref(), &device)?;

    let trained = training::train::<B>(
        &options.artifact_dir,
        config,
        model,
        train.clone(),
        test.clone(),
        device.clone(),
    )?;

    let float_accuracy =
        training::accuracy(&trained, test.clone(), config.dataset.batch_size, &device);
    log::info!("Float accuracy on {}: {:.4}", test.root().display(), float_accuracy);

    export(&trained, train, &test, config, &options.output, &device)
}
