use crate::{dataset::ImageItem, CHANNELS};
use burn::{data::dataloader::batcher::Batcher, prelude::*};

/// Stacks HWC images into channels-first batches.
#[derive(Clone, Debug)]
pub struct ClassificationBatcher {
    height: usize,
    width: usize,
}

#[derive(Clone, Debug)]
pub struct ClassificationBatch<B: Backend> {
    /// `[batch, channels, height, width]`, values in `[0, 1]`.
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl ClassificationBatcher {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }
}

/// Converts one HWC image into a `[channels, height, width]` tensor.
pub fn image_tensor<B: Backend>(
    pixels: Vec<f32>,
    height: usize,
    width: usize,
    device: &B::Device,
) -> Tensor<B, 3> {
    let data = TensorData::new(pixels, Shape::new([height, width, CHANNELS]));
    Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), device).permute([2, 0, 1])
}

impl<B: Backend> Batcher<B, ImageItem, ClassificationBatch<B>> for ClassificationBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ClassificationBatch<B> {
        let targets: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(targets, [items.len()]).convert::<B::IntElem>(),
            device,
        );

        let images = items
            .into_iter()
            .map(|item| image_tensor::<B>(item.pixels, self.height, self.width, device))
            .collect();
        let images = Tensor::stack(images, 0);

        ClassificationBatch { images, targets }
    }
}
