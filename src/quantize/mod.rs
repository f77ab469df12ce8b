//! Full-integer post-training quantization of a trained [DropNet](crate::model::DropNet).
//!
//! Activations are asymmetric int8 derived from calibrated ranges, weights
//! are symmetric int8 (per output channel for convolutions), and biases are
//! int32 at `input_scale * weight_scale`.

mod fold;
mod graph;
mod params;

pub use fold::*;
pub use graph::*;
pub use params::*;

use crate::calibration::{ActivationRange, ActivationRanges};
use crate::model::{BlockPadding, DropNet};
use burn::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuantizeError {
    #[error("no calibration samples were produced")]
    NoCalibrationData,

    #[error("expected {expected} activation ranges, got {actual}")]
    RangeCountMismatch { expected: usize, actual: usize },

    #[error("head expects {actual} features but the backbone produces {expected}")]
    FeatureMismatch { expected: usize, actual: usize },

    #[error("could not read tensor values: {0}")]
    TensorRead(String),

    #[error("tensor {0} does not exist")]
    MissingTensor(usize),

    #[error("operator {position} reads tensor {tensor} before it is produced")]
    UnorderedOperator { position: usize, tensor: usize },
}

/// Folds and quantizes a model in one go.
pub fn quantize_model<B: Backend>(
    model: &DropNet<B>,
    input_shape: [usize; 3],
    ranges: &ActivationRanges,
) -> Result<QuantizedGraph, QuantizeError> {
    let folded = fold(model, input_shape)?;
    quantize(&folded, ranges)
}

struct GraphBuilder {
    graph: QuantizedGraph,
    saturated_biases: usize,
}

impl GraphBuilder {
    fn activation(&mut self, name: String, shape: Vec<usize>, params: QuantParams) -> usize {
        self.graph.push_tensor(GraphTensor {
            name,
            shape,
            element_type: ElementType::Int8,
            quantization: Some(Quantization::per_tensor(params)),
            data: None,
        })
    }

    fn constant(
        &mut self,
        name: String,
        shape: Vec<usize>,
        quantization: Option<Quantization>,
        data: Constant,
    ) -> usize {
        let element_type = match data {
            Constant::Int8(_) => ElementType::Int8,
            Constant::Int32(_) => ElementType::Int32,
        };
        self.graph.push_tensor(GraphTensor {
            name,
            shape,
            element_type,
            quantization,
            data: Some(data),
        })
    }

    fn bias(&mut self, name: String, values: &[f32], scales: Vec<f32>) -> usize {
        let quantized: Vec<i32> = values
            .iter()
            .zip(scales.iter().cycle())
            .map(|(&value, &scale)| {
                let (q, saturated) = quantize_bias(value, scale);
                if saturated {
                    self.saturated_biases += 1;
                }
                q
            })
            .collect();

        self.constant(
            name,
            vec![values.len()],
            Some(Quantization::per_channel(scales, 0)),
            Constant::Int32(quantized),
        )
    }
}

fn activation_params(
    ranges: &ActivationRanges,
    index: usize,
) -> Result<QuantParams, QuantizeError> {
    let ActivationRange { min, max } = ranges.get(index).ok_or(QuantizeError::RangeCountMismatch {
        expected: index + 1,
        actual: ranges.len(),
    })?;
    Ok(QuantParams::asymmetric(min, max))
}

/// Builds the int8 graph: the convolution stack, a reshape to
/// `[1, features]`, the dense head and a softmax.
///
/// Strided depthwise convolutions pad one zero row and column after the
/// input, exported as a `PAD` operator followed by a `VALID` convolution.
///
/// `ranges` holds one range per activation in execution order: the input,
/// every convolution output, then the logits.
pub fn quantize(
    model: &FoldedModel,
    ranges: &ActivationRanges,
) -> Result<QuantizedGraph, QuantizeError> {
    let expected = model.convs.len() + 2;
    if ranges.len() != expected {
        return Err(QuantizeError::RangeCountMismatch {
            expected,
            actual: ranges.len(),
        });
    }

    let mut builder = GraphBuilder {
        graph: QuantizedGraph::default(),
        saturated_biases: 0,
    };

    let [mut height, mut width, mut channels] = model.input_shape;
    let mut params = activation_params(ranges, 0)?;
    let mut current =
        builder.activation("input".to_string(), vec![1, height, width, channels], params);
    builder.graph.inputs = vec![current];

    for (i, conv) in model.convs.iter().enumerate() {
        let out_channels = conv.out_channels();
        let weight_scales: Vec<f32> = (0..out_channels)
            .map(|c| symmetric_scale(&conv.channel_filters(c)))
            .collect();

        let filters: Vec<i8> = if conv.depthwise {
            conv.filters
                .iter()
                .enumerate()
                .map(|(j, &w)| quantize_symmetric(w, weight_scales[j % out_channels]))
                .collect()
        } else {
            let size = conv.filters.len() / out_channels;
            conv.filters
                .iter()
                .enumerate()
                .map(|(j, &w)| quantize_symmetric(w, weight_scales[j / size]))
                .collect()
        };
        let dimension = if conv.depthwise { 3 } else { 0 };

        let filter = builder.constant(
            format!("{}/filter", conv.name),
            conv.filter_shape.to_vec(),
            Some(Quantization::per_channel(weight_scales.clone(), dimension)),
            Constant::Int8(filters),
        );
        let bias_scales = weight_scales.iter().map(|s| s * params.scale).collect();
        let bias = builder.bias(format!("{}/bias", conv.name), &conv.bias, bias_scales);

        let (input, padding) = match conv.padding {
            BlockPadding::Same => (current, Padding::Same),
            BlockPadding::BottomRight => {
                let paddings = builder.constant(
                    format!("{}/paddings", conv.name),
                    vec![4, 2],
                    None,
                    Constant::Int32(vec![0, 0, 0, 1, 0, 1, 0, 0]),
                );
                let padded = builder.activation(
                    format!("{}/pad", conv.name),
                    vec![1, height + 1, width + 1, channels],
                    params,
                );
                builder.graph.operators.push(Operator::Pad {
                    input: current,
                    paddings,
                    output: padded,
                });
                (padded, Padding::Valid)
            }
        };

        [height, width] = conv.output_size([height, width]);
        channels = out_channels;
        params = activation_params(ranges, i + 1)?;
        let output =
            builder.activation(conv.name.clone(), vec![1, height, width, channels], params);

        builder.graph.operators.push(if conv.depthwise {
            Operator::DepthwiseConv2d {
                input,
                filter,
                bias,
                output,
                stride: conv.stride,
                padding,
                depth_multiplier: conv.depth_multiplier,
                activation: Activation::Relu6,
            }
        } else {
            Operator::Conv2d {
                input,
                filter,
                bias,
                output,
                stride: conv.stride,
                padding,
                activation: Activation::Relu6,
            }
        });
        current = output;
    }

    let dense = &model.dense;
    let shape = builder.constant(
        "flatten/shape".to_string(),
        vec![2],
        None,
        Constant::Int32(vec![1, dense.in_features as i32]),
    );
    let flattened = builder.activation("flatten".to_string(), vec![1, dense.in_features], params);
    builder.graph.operators.push(Operator::Reshape {
        input: current,
        shape,
        output: flattened,
    });

    let weight_scale = symmetric_scale(&dense.weights);
    let weights = builder.constant(
        "dense/weights".to_string(),
        vec![dense.out_features, dense.in_features],
        Some(Quantization::per_tensor(QuantParams {
            scale: weight_scale,
            zero_point: 0,
        })),
        Constant::Int8(
            dense
                .weights
                .iter()
                .map(|&w| quantize_symmetric(w, weight_scale))
                .collect(),
        ),
    );
    let bias = builder.bias(
        "dense/bias".to_string(),
        &dense.bias,
        vec![params.scale * weight_scale],
    );
    let logits_params = activation_params(ranges, expected - 1)?;
    let logits =
        builder.activation("logits".to_string(), vec![1, dense.out_features], logits_params);
    builder.graph.operators.push(Operator::FullyConnected {
        input: flattened,
        weights,
        bias,
        output: logits,
        activation: Activation::None,
    });

    let probabilities = builder.activation(
        "probabilities".to_string(),
        vec![1, dense.out_features],
        QuantParams::softmax_output(),
    );
    builder.graph.operators.push(Operator::Softmax {
        input: logits,
        output: probabilities,
        beta: 1.0,
    });
    builder.graph.outputs = vec![probabilities];

    if builder.saturated_biases > 0 {
        log::warn!(
            "{} bias values saturated the int32 range",
            builder.saturated_biases
        );
    }

    builder.graph.validate()?;
    log::info!(
        "Quantized graph with {} operators and {} tensors",
        builder.graph.operators.len(),
        builder.graph.tensors.len()
    );

    Ok(builder.graph)
}
