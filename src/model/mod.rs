mod mobilenet;

pub use mobilenet::*;

use crate::CLASS_NUM;
use burn::{
    nn::{Linear, LinearConfig},
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder, RecorderError},
    tensor::activation::softmax,
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use regex::Regex;
use std::path::PathBuf;
use thiserror::Error;

/// Receives every intermediate activation of a forward pass, in execution
/// order: the input images, each convolution block output, then the logits.
pub trait ActivationObserver<B: Backend> {
    fn observe<const D: usize>(&mut self, activation: &Tensor<B, D>);
}

/// Ignores all activations.
pub struct NoObserver;

impl<B: Backend> ActivationObserver<B> for NoObserver {
    fn observe<const D: usize>(&mut self, _activation: &Tensor<B, D>) {}
}

#[derive(Error, Debug)]
pub enum ModelError {
    /// The strided blocks shrink the input to an empty feature map.
    #[error("a {height}x{width} input leaves no features after the strided blocks")]
    InputTooSmall { height: usize, width: usize },

    #[error("the depth multiplier must be at least 1")]
    DepthMultiplier,

    /// A key remap pattern is not a valid regular expression.
    #[error("invalid key remap pattern `{pattern}`: {source}")]
    KeyRemap {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("could not load backbone weights: {0}")]
    Record(#[from] RecorderError),
}

/// Pretrained backbone record and the key renames it needs.
#[derive(Clone, Debug, PartialEq)]
pub struct BackboneWeights {
    /// `.mpk` record, or a `.pt`/`.pth` PyTorch state dict.
    pub path: PathBuf,
    /// `(pattern, replacement)` pairs applied in order to every state dict key.
    pub key_remap: Vec<(String, String)>,
    /// Key holding the state dict when the checkpoint nests it.
    pub top_level_key: Option<String>,
}

impl BackboneWeights {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            key_remap: Vec::new(),
            top_level_key: None,
        }
    }

    pub fn with_key_remap(mut self, pattern: &str, replacement: &str) -> Self {
        self.key_remap
            .push((pattern.to_string(), replacement.to_string()));
        self
    }

    /// Adds the renames of [sequential_key_remaps].
    pub fn with_sequential_keys(mut self) -> Self {
        self.key_remap.extend(sequential_key_remaps());
        self
    }

    pub fn with_top_level_key(mut self, key: Option<String>) -> Self {
        self.top_level_key = key;
        self
    }

    fn is_pytorch(&self) -> bool {
        matches!(
            self.path.extension().and_then(|ext| ext.to_str()),
            Some("pt") | Some("pth")
        )
    }

    /// Compiles the remaps up front so a bad pattern is an error, not a panic.
    fn load_args(&self) -> Result<LoadArgs, ModelError> {
        let mut args = LoadArgs::new(self.path.clone());

        for (pattern, replacement) in self.key_remap.iter() {
            let regex = Regex::new(pattern).map_err(|source| ModelError::KeyRemap {
                pattern: pattern.clone(),
                source,
            })?;
            args.key_remap.push((regex, replacement.clone()));
        }
        if let Some(key) = &self.top_level_key {
            args = args.with_top_level_key(key);
        }

        Ok(args)
    }
}

#[derive(Config, Debug)]
pub struct DropNetConfig {
    #[config(default = "CLASS_NUM")]
    pub num_classes: usize,
    #[config(default = "MobileNetConfig::new()")]
    pub backbone: MobileNetConfig,
}

/// Frozen MobileNet backbone with a trainable dense head.
#[derive(Module, Debug)]
pub struct DropNet<B: Backend> {
    pub backbone: MobileNet<B>,
    pub head: Linear<B>,
}

impl DropNetConfig {
    /// Builds the model with a randomly initialized, frozen backbone.
    pub fn init<B: Backend>(&self, device: &B::Device) -> DropNet<B> {
        let backbone = self.backbone.init(device).no_grad();
        let head = LinearConfig::new(self.backbone.num_features(), self.num_classes)
            .with_bias(true)
            .init(device);

        DropNet { backbone, head }
    }

    /// Builds the model with pretrained backbone weights.
    ///
    /// `.pt`/`.pth` files are read as PyTorch state dicts with the configured
    /// key remaps. Anything else is read as a named MessagePack record.
    pub fn init_pretrained<B: Backend>(
        &self,
        weights: &BackboneWeights,
        device: &B::Device,
    ) -> Result<DropNet<B>, ModelError> {
        let model = self.init::<B>(device);

        let record: MobileNetRecord<B> = if weights.is_pytorch() {
            PyTorchFileRecorder::<FullPrecisionSettings>::default()
                .load(weights.load_args()?, device)?
        } else {
            NamedMpkFileRecorder::<FullPrecisionSettings>::default()
                .load(weights.path.clone(), device)?
        };
        log::info!("Loaded backbone weights from {}", weights.path.display());

        Ok(DropNet {
            backbone: model.backbone.load_record(record).no_grad(),
            head: model.head,
        })
    }

    /// Input `[height, width, channels]` the model is built for.
    pub fn input_shape(&self) -> [usize; 3] {
        [
            self.backbone.input_height,
            self.backbone.input_width,
            self.backbone.in_channels,
        ]
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        self.backbone.validate()
    }
}

impl<B: Backend> DropNet<B> {
    /// Images `[batch, 3, height, width]` in `[0, 1]` to logits `[batch, classes]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward_observed(images, &mut NoObserver)
    }

    pub fn forward_observed<O: ActivationObserver<B>>(
        &self,
        images: Tensor<B, 4>,
        observer: &mut O,
    ) -> Tensor<B, 2> {
        observer.observe(&images);
        let features = self.backbone.forward_observed(images, observer);
        let logits = self.classify(features);
        observer.observe(&logits);
        logits
    }

    /// Class probabilities.
    pub fn infer(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    pub(crate) fn classify(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(features.flatten::<2>(1, 3))
    }

    /// Number of activations reported to an observer per forward pass.
    pub fn num_activations(&self) -> usize {
        // images + stem + two per separable block + logits
        2 + 2 * self.backbone.blocks.len() + 1
    }
}

/// Writes an uncompressed PyTorch `state_dict` archive holding `f32` tensors.
#[cfg(test)]
pub(crate) fn write_state_dict(
    path: &std::path::Path,
    tensors: &[(String, Vec<usize>, Vec<f32>)],
) {
    use std::io::Write;
    use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

    fn unicode(pickle: &mut Vec<u8>, value: &str) {
        pickle.push(b'X');
        pickle.extend_from_slice(&(value.len() as u32).to_le_bytes());
        pickle.extend_from_slice(value.as_bytes());
    }
    fn int(pickle: &mut Vec<u8>, value: usize) {
        pickle.push(b'J');
        pickle.extend_from_slice(&(value as i32).to_le_bytes());
    }
    fn tuple(pickle: &mut Vec<u8>, values: &[usize]) {
        pickle.push(b'(');
        for &value in values {
            int(pickle, value);
        }
        pickle.push(b't');
    }

    // protocol 2, empty dict
    let mut pickle = vec![0x80, 2, b'}'];
    for (key, (name, shape, _)) in tensors.iter().enumerate() {
        let mut strides = vec![1; shape.len()];
        for d in (0..shape.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * shape[d + 1];
        }

        unicode(&mut pickle, name);
        pickle.extend_from_slice(b"ctorch._utils\n_rebuild_tensor_v2\n(");
        pickle.push(b'(');
        unicode(&mut pickle, "storage");
        pickle.extend_from_slice(b"ctorch\nFloatStorage\n");
        unicode(&mut pickle, &key.to_string());
        unicode(&mut pickle, "cpu");
        int(&mut pickle, shape.iter().product());
        // storage tuple, persistent id
        pickle.extend_from_slice(b"tQ");
        int(&mut pickle, 0);
        tuple(&mut pickle, shape);
        tuple(&mut pickle, &strides);
        // requires_grad, backward hooks, args tuple, rebuild, dict entry
        pickle.extend_from_slice(b"\x89NtRs");
    }
    pickle.push(b'.');

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let mut zip = ZipWriter::new(std::fs::File::create(path).unwrap());
    zip.start_file("archive/data.pkl", options).unwrap();
    zip.write_all(&pickle).unwrap();
    for (key, (_, _, values)) in tensors.iter().enumerate() {
        zip.start_file(format!("archive/data/{key}"), options)
            .unwrap();
        for value in values {
            zip.write_all(&value.to_le_bytes()).unwrap();
        }
    }
    zip.finish().unwrap();
}
