use super::QuantizeError;
use crate::model::{BlockPadding, ConvBlock, DropNet, BN_EPSILON};
use burn::prelude::*;

/// Float convolution with its batch norm folded in, NHWC filter layout.
#[derive(Clone, Debug)]
pub struct FoldedConv {
    pub name: String,
    pub depthwise: bool,
    /// `[out, kh, kw, in]` for regular convolutions, `[1, kh, kw, channels]`
    /// for depthwise ones.
    pub filter_shape: [usize; 4],
    pub filters: Vec<f32>,
    pub bias: Vec<f32>,
    pub stride: usize,
    pub padding: BlockPadding,
    /// Output channels per input channel of a depthwise convolution, 1
    /// otherwise.
    pub depth_multiplier: usize,
}

impl FoldedConv {
    pub fn out_channels(&self) -> usize {
        if self.depthwise {
            self.filter_shape[3]
        } else {
            self.filter_shape[0]
        }
    }

    pub fn kernel_size(&self) -> [usize; 2] {
        [self.filter_shape[1], self.filter_shape[2]]
    }

    /// Output `[height, width]` for an input of `[height, width]`.
    pub fn output_size(&self, size: [usize; 2]) -> [usize; 2] {
        let [kh, kw] = self.kernel_size();
        [
            self.padding.output_size(size[0], kh, self.stride),
            self.padding.output_size(size[1], kw, self.stride),
        ]
    }

    /// Filter values feeding output channel `channel`.
    pub fn channel_filters(&self, channel: usize) -> Vec<f32> {
        if self.depthwise {
            let channels = self.filter_shape[3];
            self.filters
                .iter()
                .skip(channel)
                .step_by(channels)
                .copied()
                .collect()
        } else {
            let size = self.filters.len() / self.filter_shape[0];
            self.filters[channel * size..(channel + 1) * size].to_vec()
        }
    }
}

/// Dense head with weights `[out, in]`, inputs in NHWC flatten order.
#[derive(Clone, Debug)]
pub struct FoldedDense {
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
    pub in_features: usize,
    pub out_features: usize,
}

/// The model as plain float arrays laid out for an NHWC runtime.
#[derive(Clone, Debug)]
pub struct FoldedModel {
    /// `[height, width, channels]`
    pub input_shape: [usize; 3],
    pub convs: Vec<FoldedConv>,
    /// Feature map `[height, width, channels]` entering the head.
    pub feature_shape: [usize; 3],
    pub dense: FoldedDense,
}

fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>, QuantizeError> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| QuantizeError::TensorRead(format!("{err:?}")))
}

fn fold_conv<B: Backend>(
    block: &ConvBlock<B>,
    name: String,
    in_channels: usize,
) -> Result<FoldedConv, QuantizeError> {
    let [out_channels, in_per_group, kh, kw] = block.conv.weight.val().dims();
    let weights = to_vec(block.conv.weight.val())?;

    let gamma = to_vec(block.norm.gamma.val())?;
    let beta = to_vec(block.norm.beta.val())?;
    let mean = to_vec(block.norm.running_mean.value())?;
    let var = to_vec(block.norm.running_var.value())?;

    let mut bias = Vec::with_capacity(out_channels);
    let mut factors = Vec::with_capacity(out_channels);
    for o in 0..out_channels {
        let factor = gamma[o] / (var[o] + BN_EPSILON as f32).sqrt();
        factors.push(factor);
        bias.push(beta[o] - mean[o] * factor);
    }

    // OIHW -> OHWI, or [C * M, 1, H, W] -> [1, H, W, C * M] for depthwise.
    let mut filters = vec![0.0; weights.len()];
    let filter_shape = if block.is_depthwise() {
        for c in 0..out_channels {
            for y in 0..kh {
                for x in 0..kw {
                    filters[(y * kw + x) * out_channels + c] =
                        weights[(c * kh + y) * kw + x] * factors[c];
                }
            }
        }
        [1, kh, kw, out_channels]
    } else {
        for o in 0..out_channels {
            for i in 0..in_per_group {
                for y in 0..kh {
                    for x in 0..kw {
                        filters[((o * kh + y) * kw + x) * in_per_group + i] =
                            weights[((o * in_per_group + i) * kh + y) * kw + x] * factors[o];
                    }
                }
            }
        }
        [out_channels, kh, kw, in_per_group]
    };

    let depth_multiplier = if block.is_depthwise() {
        (out_channels / in_channels.max(1)).max(1)
    } else {
        1
    };

    Ok(FoldedConv {
        name,
        depthwise: block.is_depthwise(),
        filter_shape,
        filters,
        bias,
        stride: block.stride(),
        padding: block.padding(),
        depth_multiplier,
    })
}

/// Folds batch norms into their convolutions and reorders every weight for
/// NHWC execution.
pub fn fold<B: Backend>(
    model: &DropNet<B>,
    input_shape: [usize; 3],
) -> Result<FoldedModel, QuantizeError> {
    let [mut height, mut width, mut channels] = input_shape;
    let mut convs = Vec::new();

    for (i, layer) in model.backbone.layers().into_iter().enumerate() {
        let name = match i {
            0 => "stem".to_string(),
            i if i % 2 == 1 => format!("block_{}/depthwise", i.div_ceil(2)),
            i => format!("block_{}/pointwise", i / 2),
        };
        let conv = fold_conv(layer, name, channels)?;
        [height, width] = conv.output_size([height, width]);
        channels = conv.out_channels();
        convs.push(conv);
    }
    let feature_shape = [height, width, channels];

    let [in_features, out_features] = model.head.weight.val().dims();
    if in_features != height * width * channels {
        return Err(QuantizeError::FeatureMismatch {
            expected: height * width * channels,
            actual: in_features,
        });
    }

    let linear = to_vec(model.head.weight.val())?;
    let bias = match &model.head.bias {
        Some(bias) => to_vec(bias.val())?,
        None => vec![0.0; out_features],
    };

    // Rows of the burn weight follow the CHW flatten; the runtime flattens HWC.
    let mut weights = vec![0.0; linear.len()];
    for o in 0..out_features {
        for h in 0..height {
            for w in 0..width {
                for c in 0..channels {
                    let chw = (c * height + h) * width + w;
                    let hwc = (h * width + w) * channels + c;
                    weights[o * in_features + hwc] = linear[chw * out_features + o];
                }
            }
        }
    }

    Ok(FoldedModel {
        input_shape,
        convs,
        feature_shape,
        dense: FoldedDense {
            weights,
            bias,
            in_features,
            out_features,
        },
    })
}
