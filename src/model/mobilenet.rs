use super::{ActivationObserver, ModelError};
use crate::{CHANNELS, HEIGHT, WIDTH};
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::ElementConversion,
};

/// Filters of the stem convolution before the width multiplier.
const STEM_FILTERS: usize = 32;
/// Pointwise filters and depthwise stride of each separable block.
const BLOCKS: [(usize, usize); 13] = [
    (64, 1),
    (128, 2),
    (128, 1),
    (256, 2),
    (256, 1),
    (512, 2),
    (512, 1),
    (512, 1),
    (512, 1),
    (512, 1),
    (512, 1),
    (1024, 2),
    (1024, 1),
];

/// Batch norm epsilon, shared with batch norm folding at export.
pub const BN_EPSILON: f64 = 1e-3;
const BN_MOMENTUM: f64 = 0.01;
/// Upper bound of the ReLU6 activation.
pub const RELU6_MAX: f32 = 6.0;

/// MobileNet v1 feature extractor configuration.
#[derive(Config, Debug)]
pub struct MobileNetConfig {
    /// Width multiplier applied to every layer.
    #[config(default = 0.25)]
    pub alpha: f64,
    /// Depthwise output channels per input channel.
    #[config(default = 1)]
    pub depth_multiplier: usize,
    #[config(default = "HEIGHT")]
    pub input_height: usize,
    #[config(default = "WIDTH")]
    pub input_width: usize,
    #[config(default = "CHANNELS")]
    pub in_channels: usize,
}

/// Spatial padding of a convolution block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockPadding {
    /// TFLite `SAME`: the output has `ceil(size / stride)` positions.
    Same,
    /// One zero row below and one zero column to the right, then a `VALID`
    /// window. Used by the strided depthwise blocks.
    BottomRight,
}

impl BlockPadding {
    /// Zero padding `(before, after)` of one spatial axis.
    pub fn pads(self, size: usize, kernel_size: usize, stride: usize) -> (usize, usize) {
        match self {
            BlockPadding::Same => same_padding(size, kernel_size, stride),
            BlockPadding::BottomRight => (0, 1),
        }
    }

    /// Output positions along one axis. Zero when the window does not fit.
    pub fn output_size(self, size: usize, kernel_size: usize, stride: usize) -> usize {
        match self {
            BlockPadding::Same => size.div_ceil(stride),
            BlockPadding::BottomRight => valid_output_size(size + 1, kernel_size, stride),
        }
    }
}

/// Key remaps for PyTorch MobileNet v1 ports that hold the whole network in
/// one `nn.Sequential` named `model`.
///
/// `model.0` is the stem (conv, bn, relu). `model.1` to `model.13` are the
/// separable blocks (depthwise conv, bn, relu, pointwise conv, bn, relu).
pub fn sequential_key_remaps() -> Vec<(String, String)> {
    let mut remaps = vec![
        (r"^model\.0\.0\.".to_string(), "stem.conv.".to_string()),
        (r"^model\.0\.1\.".to_string(), "stem.norm.".to_string()),
    ];

    for block in 0..BLOCKS.len() {
        let layers = [
            (0, "depthwise.conv"),
            (1, "depthwise.norm"),
            (3, "pointwise.conv"),
            (4, "pointwise.norm"),
        ];
        for (index, target) in layers {
            remaps.push((
                format!(r"^model\.{}\.{index}\.", block + 1),
                format!("blocks.{block}.{target}."),
            ));
        }
    }

    remaps
}

/// Output positions of an unpadded window along one axis.
pub fn valid_output_size(size: usize, kernel_size: usize, stride: usize) -> usize {
    if size < kernel_size {
        0
    } else {
        (size - kernel_size) / stride + 1
    }
}

/// Padding `(before, after)` of one spatial axis under TFLite `SAME` rules.
pub fn same_padding(size: usize, kernel_size: usize, stride: usize) -> (usize, usize) {
    let output = size.div_ceil(stride);
    let total = ((output.max(1) - 1) * stride + kernel_size).saturating_sub(size);
    (total / 2, total - total / 2)
}

/// Convolution, batch norm and ReLU6.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: BatchNorm<B, 2>,
    kernel_size: usize,
    stride: usize,
    depthwise: bool,
}

/// Depthwise 3x3 followed by pointwise 1x1.
#[derive(Module, Debug)]
pub struct SeparableBlock<B: Backend> {
    pub depthwise: ConvBlock<B>,
    pub pointwise: ConvBlock<B>,
}

#[derive(Module, Debug)]
pub struct MobileNet<B: Backend> {
    pub stem: ConvBlock<B>,
    pub blocks: Vec<SeparableBlock<B>>,
}

fn block_padding(depthwise: bool, stride: usize) -> BlockPadding {
    if depthwise && stride > 1 {
        BlockPadding::BottomRight
    } else {
        BlockPadding::Same
    }
}

impl<B: Backend> ConvBlock<B> {
    fn new(
        channels: [usize; 2],
        kernel_size: usize,
        stride: usize,
        depthwise: bool,
        device: &B::Device,
    ) -> Self {
        let groups = if depthwise { channels[0] } else { 1 };
        let conv = Conv2dConfig::new(channels, [kernel_size, kernel_size])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Valid)
            .with_groups(groups)
            .with_bias(false)
            .init(device);
        let norm = BatchNormConfig::new(channels[1])
            .with_epsilon(BN_EPSILON)
            .with_momentum(BN_MOMENTUM)
            .init(device);

        Self {
            conv,
            norm,
            kernel_size,
            stride,
            depthwise,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = input.dims();
        let padding = self.padding();
        let (top, bottom) = padding.pads(height, self.kernel_size, self.stride);
        let (left, right) = padding.pads(width, self.kernel_size, self.stride);

        let x = if top + bottom + left + right > 0 {
            input.pad((left, right, top, bottom), 0.0f32.elem::<B::FloatElem>())
        } else {
            input
        };

        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        x.clamp(0.0, RELU6_MAX)
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn is_depthwise(&self) -> bool {
        self.depthwise
    }

    pub fn padding(&self) -> BlockPadding {
        block_padding(self.depthwise, self.stride)
    }
}

impl MobileNetConfig {
    fn filters(&self, base: usize) -> usize {
        ((base as f64 * self.alpha) as usize).max(1)
    }

    /// Builds the network with freshly initialized weights.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNet<B> {
        let mut channels = self.filters(STEM_FILTERS);
        let stem = ConvBlock::new([self.in_channels, channels], 3, 2, false, device);
        let multiplier = self.depth_multiplier.max(1);

        let blocks = BLOCKS
            .iter()
            .map(|&(filters, stride)| {
                let expanded = channels * multiplier;
                let out = self.filters(filters);
                let block = SeparableBlock {
                    depthwise: ConvBlock::new([channels, expanded], 3, stride, true, device),
                    pointwise: ConvBlock::new([expanded, out], 1, 1, false, device),
                };
                channels = out;
                block
            })
            .collect();

        MobileNet { stem, blocks }
    }

    /// Feature map shape `[height, width, channels]` produced for the
    /// configured input size.
    pub fn output_shape(&self) -> [usize; 3] {
        let mut height = BlockPadding::Same.output_size(self.input_height, 3, 2);
        let mut width = BlockPadding::Same.output_size(self.input_width, 3, 2);

        for (_, stride) in BLOCKS {
            let padding = block_padding(true, stride);
            height = padding.output_size(height, 3, stride);
            width = padding.output_size(width, 3, stride);
        }

        let channels = self.filters(BLOCKS[BLOCKS.len() - 1].0);
        [height, width, channels]
    }

    /// Number of values after flattening the feature map.
    pub fn num_features(&self) -> usize {
        self.output_shape().iter().product()
    }

    /// Rejects input sizes that the strided blocks reduce to nothing.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.depth_multiplier == 0 {
            return Err(ModelError::DepthMultiplier);
        }
        if self.num_features() == 0 {
            return Err(ModelError::InputTooSmall {
                height: self.input_height,
                width: self.input_width,
            });
        }
        Ok(())
    }
}

impl<B: Backend> MobileNet<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward_observed(images, &mut super::NoObserver)
    }

    /// Forward pass reporting the output of every convolution block.
    pub fn forward_observed<O: ActivationObserver<B>>(
        &self,
        images: Tensor<B, 4>,
        observer: &mut O,
    ) -> Tensor<B, 4> {
        let mut x = self.stem.forward(images);
        observer.observe(&x);

        for block in self.blocks.iter() {
            x = block.depthwise.forward(x);
            observer.observe(&x);
            x = block.pointwise.forward(x);
            observer.observe(&x);
        }

        x
    }

    /// Every convolution block, in execution order.
    pub fn layers(&self) -> Vec<&ConvBlock<B>> {
        let mut layers = vec![&self.stem];
        for block in self.blocks.iter() {
            layers.push(&block.depthwise);
            layers.push(&block.pointwise);
        }
        layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn same_padding_matches_tflite() {
        assert_eq!(same_padding(80, 3, 2), (0, 1));
        assert_eq!(same_padding(25, 3, 2), (1, 1));
        assert_eq!(same_padding(5, 3, 2), (1, 1));
        assert_eq!(same_padding(40, 3, 1), (1, 1));
        assert_eq!(same_padding(40, 1, 1), (0, 0));
    }

    #[test]
    fn strided_depthwise_pads_bottom_right() {
        let padding = block_padding(true, 2);
        assert_eq!(padding, BlockPadding::BottomRight);
        assert_eq!(padding.pads(25, 3, 2), (0, 1));
        assert_eq!(padding.output_size(25, 3, 2), 12);
        assert_eq!(padding.output_size(5, 3, 2), 2);
        assert_eq!(padding.output_size(40, 3, 2), 20);
        assert_eq!(padding.output_size(1, 3, 2), 0);

        assert_eq!(block_padding(true, 1), BlockPadding::Same);
        assert_eq!(block_padding(false, 2), BlockPadding::Same);
    }

    #[test]
    fn default_feature_map_shape() {
        let config = MobileNetConfig::new();
        assert_eq!(config.input_height, HEIGHT);
        assert_eq!(config.input_width, WIDTH);
        assert_eq!(config.output_shape(), [2, 3, 256]);
        assert_eq!(config.num_features(), 1536);
    }

    #[test]
    fn width_multiplier_scales_filters() {
        let device = Default::default();
        let model: MobileNet<B> = MobileNetConfig::new().init(&device);

        assert_eq!(model.blocks.len(), 13);
        assert_eq!(model.layers().len(), 27);
        assert_eq!(model.stem.conv.weight.val().dims(), [8, 3, 3, 3]);
        assert_eq!(model.blocks[0].depthwise.conv.weight.val().dims(), [8, 1, 3, 3]);
        assert_eq!(model.blocks[0].pointwise.conv.weight.val().dims(), [16, 8, 1, 1]);
        assert_eq!(model.blocks[12].pointwise.conv.weight.val().dims(), [256, 256, 1, 1]);
        assert_eq!(model.blocks[1].depthwise.padding(), BlockPadding::BottomRight);
        assert_eq!(model.stem.padding(), BlockPadding::Same);
    }

    #[test]
    fn depth_multiplier_widens_depthwise_outputs() {
        let device = Default::default();
        let config = MobileNetConfig::new()
            .with_depth_multiplier(2)
            .with_input_height(32)
            .with_input_width(40);
        let model: MobileNet<B> = config.init(&device);

        assert_eq!(model.blocks[0].depthwise.conv.weight.val().dims(), [16, 1, 3, 3]);
        assert_eq!(model.blocks[0].pointwise.conv.weight.val().dims(), [16, 16, 1, 1]);

        let features = model.forward(Tensor::zeros([1, 3, 32, 40], &device));
        assert_eq!(features.dims(), [1, 256, 1, 1]);
    }

    #[test]
    fn forward_matches_declared_shape_for_odd_sizes() {
        let device = Default::default();
        let config = MobileNetConfig::new()
            .with_input_height(47)
            .with_input_width(53);
        let model: MobileNet<B> = config.init(&device);

        let features = model.forward(Tensor::zeros([2, 3, 47, 53], &device));
        let [h, w, c] = config.output_shape();

        assert_eq!([h, w], [1, 1]);
        assert_eq!(features.dims(), [2, c, h, w]);
    }

    #[test]
    fn default_input_runs_at_declared_shape() {
        let device = Default::default();
        let config = MobileNetConfig::new();
        let model: MobileNet<B> = config.init(&device);

        let features = model.forward(Tensor::zeros([1, 3, HEIGHT, WIDTH], &device));
        assert_eq!(features.dims(), [1, 256, 2, 3]);
    }

    #[test]
    fn sequential_remaps_cover_every_layer() {
        let remaps = sequential_key_remaps();
        assert_eq!(remaps.len(), 2 + 4 * 13);

        let rename = |key: &str| {
            remaps.iter().fold(key.to_string(), |name, (pattern, replacement)| {
                regex::Regex::new(pattern)
                    .unwrap()
                    .replace_all(&name, replacement.as_str())
                    .into_owned()
            })
        };
        assert_eq!(rename("model.0.0.weight"), "stem.conv.weight");
        assert_eq!(rename("model.0.1.running_var"), "stem.norm.running_var");
        assert_eq!(rename("model.1.0.weight"), "blocks.0.depthwise.conv.weight");
        assert_eq!(rename("model.10.4.bias"), "blocks.9.pointwise.norm.bias");
        assert_eq!(rename("model.13.3.weight"), "blocks.12.pointwise.conv.weight");
    }

    #[test]
    fn rejects_inputs_that_collapse() {
        let config = MobileNetConfig::new()
            .with_input_height(16)
            .with_input_width(20);
        assert_eq!(config.output_shape()[0], 0);
        assert!(matches!(
            config.validate(),
            Err(ModelError::InputTooSmall {
                height: 16,
                width: 20
            })
        ));

        let config = MobileNetConfig::new().with_depth_multiplier(0);
        assert!(matches!(config.validate(), Err(ModelError::DepthMultiplier)));

        assert!(MobileNetConfig::new().validate().is_ok());
    }
}
