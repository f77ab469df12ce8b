//! Representative samples and activation range collection for post-training
//! quantization.

use crate::{
    augment::AugmentationConfig,
    data::image_tensor,
    dataset::{augmented, ImageFolder, ImageItem},
    model::{ActivationObserver, DropNet},
    quantize::QuantizeError,
};
use burn::{data::dataset::Dataset, prelude::*, tensor::ElementConversion};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Images the calibration samples are drawn from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationSource {
    /// The training split with the same random shear and zoom used for training.
    AugmentedTraining,
    /// The training split as stored on disk.
    Clean,
}

#[derive(Config, Debug)]
pub struct CalibrationConfig {
    #[config(default = 100)]
    pub num_samples: usize,
    #[config(default = "CalibrationSource::AugmentedTraining")]
    pub source: CalibrationSource,
}

/// Finite stream of single-image batches `[1, 3, height, width]`.
///
/// Images are visited in a shuffled order that is reshuffled whenever the
/// split is exhausted, so any sample count can be drawn from a small split.
pub struct RepresentativeDataset<B: Backend> {
    dataset: Box<dyn Dataset<ImageItem>>,
    order: Vec<usize>,
    cursor: usize,
    remaining: usize,
    rng: StdRng,
    height: usize,
    width: usize,
    device: B::Device,
}

impl<B: Backend> RepresentativeDataset<B> {
    /// Samples of `train` at its stored image size.
    pub fn new(
        train: Arc<ImageFolder>,
        augmentation: &AugmentationConfig,
        config: &CalibrationConfig,
        seed: u64,
        device: &B::Device,
    ) -> Self {
        let [height, width, _] = train.image_dims();
        let source: Box<dyn Dataset<ImageItem>> = match config.source {
            CalibrationSource::AugmentedTraining => {
                Box::new(augmented(train, augmentation, [height, width]))
            }
            CalibrationSource::Clean => Box::new(train),
        };
        let order: Vec<usize> = (0..source.len()).collect();

        Self {
            cursor: order.len(),
            dataset: source,
            order,
            remaining: config.num_samples,
            rng: StdRng::seed_from_u64(seed),
            height,
            width,
            device: device.clone(),
        }
    }
}

impl<B: Backend> Iterator for RepresentativeDataset<B> {
    type Item = Tensor<B, 4>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.order.is_empty() {
            return None;
        }

        if self.cursor == self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }

        let item = self.dataset.get(self.order[self.cursor])?;
        self.cursor += 1;
        self.remaining -= 1;

        let image = image_tensor::<B>(item.pixels, self.height, self.width, &self.device);
        Some(image.unsqueeze::<4>())
    }
}

/// Observed value range of one activation tensor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActivationRange {
    pub min: f32,
    pub max: f32,
}

/// Running min/max of every activation, indexed by execution order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActivationRanges {
    ranges: Vec<ActivationRange>,
    cursor: usize,
}

impl ActivationRanges {
    pub fn from_ranges(ranges: Vec<ActivationRange>) -> Self {
        Self { ranges, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<ActivationRange> {
        self.ranges.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActivationRange> {
        self.ranges.iter()
    }

    fn record(&mut self, min: f32, max: f32) {
        match self.ranges.get_mut(self.cursor) {
            Some(range) => {
                range.min = range.min.min(min);
                range.max = range.max.max(max);
            }
            None => self.ranges.push(ActivationRange { min, max }),
        }
        self.cursor += 1;
    }

    fn end_pass(&mut self) {
        self.cursor = 0;
    }
}

impl<B: Backend> ActivationObserver<B> for ActivationRanges {
    fn observe<const D: usize>(&mut self, activation: &Tensor<B, D>) {
        let min = activation.clone().min().into_scalar().elem::<f32>();
        let max = activation.clone().max().into_scalar().elem::<f32>();
        self.record(min, max);
    }
}

/// Runs every sample through the model and records activation ranges.
pub fn calibrate<B, I>(model: &DropNet<B>, samples: I) -> Result<ActivationRanges, QuantizeError>
where
    B: Backend,
    I: IntoIterator<Item = Tensor<B, 4>>,
{
    let mut ranges = ActivationRanges::default();
    let mut count = 0;

    for images in samples {
        model.forward_observed(images, &mut ranges);
        ranges.end_pass();
        count += 1;
    }

    if count == 0 {
        return Err(QuantizeError::NoCalibrationData);
    }

    log::info!(
        "Calibrated {} activation ranges on {} samples",
        ranges.len(),
        count
    );

    Ok(ranges)
}
