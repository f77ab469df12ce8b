//! Integer-only reference execution of a [QuantizedGraph].
//!
//! Kernels follow the TFLite reference int8 semantics: int32 accumulation of
//! zero-point corrected products, per-channel requantization, padding with
//! the input zero point and fused activations as clamps.

use crate::dataset::ImageItem;
use crate::model::RELU6_MAX;
use crate::quantize::{
    Activation, Constant, GraphTensor, Operator, Padding, QuantParams, QuantizeError,
    QuantizedGraph,
};
use burn::data::dataset::Dataset;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InterpreterError {
    #[error(transparent)]
    Graph(#[from] QuantizeError),

    #[error("input has {actual} values, expected {expected}")]
    InputSize { expected: usize, actual: usize },

    #[error("tensor `{0}` has no quantization parameters")]
    Unquantized(String),

    #[error("tensor `{0}` is read before it is computed")]
    Uncomputed(String),

    #[error("tensor `{0}` does not hold the expected constant data")]
    ConstantType(String),

    /// Only the spatial and channel axes of an NHWC tensor can be padded.
    #[error("unsupported paddings {0:?}")]
    Paddings(Vec<i32>),
}

type Result<T> = std::result::Result<T, InterpreterError>;

fn params(tensor: &GraphTensor) -> Result<QuantParams> {
    tensor
        .quantization
        .as_ref()
        .map(|q| q.params())
        .ok_or_else(|| InterpreterError::Unquantized(tensor.name.clone()))
}

fn scales(tensor: &GraphTensor) -> Result<&[f32]> {
    tensor
        .quantization
        .as_ref()
        .map(|q| q.scales.as_slice())
        .ok_or_else(|| InterpreterError::Unquantized(tensor.name.clone()))
}

fn int8_data(tensor: &GraphTensor) -> Result<&[i8]> {
    match &tensor.data {
        Some(Constant::Int8(values)) => Ok(values),
        _ => Err(InterpreterError::ConstantType(tensor.name.clone())),
    }
}

fn int32_data(tensor: &GraphTensor) -> Result<&[i32]> {
    match &tensor.data {
        Some(Constant::Int32(values)) => Ok(values),
        _ => Err(InterpreterError::ConstantType(tensor.name.clone())),
    }
}

/// Output clamp bounds of a fused activation.
fn activation_bounds(activation: Activation, output: QuantParams) -> (i32, i32) {
    match activation {
        Activation::None => (-128, 127),
        Activation::Relu6 => (
            output.zero_point.max(-128),
            (output.zero_point + (RELU6_MAX / output.scale).round() as i32).min(127),
        ),
    }
}

fn requantize(acc: i32, multiplier: f64, zero_point: i32, bounds: (i32, i32)) -> i8 {
    let value = (acc as f64 * multiplier).round() as i32 + zero_point;
    value.clamp(bounds.0, bounds.1) as i8
}

/// Quantization and shapes shared by the convolution kernels.
struct ConvArgs<'a> {
    input: &'a [i8],
    /// `[height, width, channels]`
    input_shape: [usize; 3],
    input_zero_point: i32,
    filter: &'a [i8],
    /// `[out, kh, kw, in]` or `[1, kh, kw, channels * depth_multiplier]`
    filter_shape: [usize; 4],
    bias: &'a [i32],
    multipliers: Vec<f64>,
    stride: usize,
    padding: Padding,
    /// `Some(multiplier)` for depthwise convolutions.
    depth_multiplier: Option<usize>,
    output: QuantParams,
    bounds: (i32, i32),
}

fn conv2d(args: &ConvArgs) -> Vec<i8> {
    let [height, width, in_channels] = args.input_shape;
    let [_, kh, kw, _] = args.filter_shape;
    let out_channels = match args.depth_multiplier {
        Some(_) => args.filter_shape[3],
        None => args.filter_shape[0],
    };
    let out_h = args.padding.output_size(height, kh, args.stride);
    let out_w = args.padding.output_size(width, kw, args.stride);
    let (top, _) = args.padding.pads(height, kh, args.stride);
    let (left, _) = args.padding.pads(width, kw, args.stride);

    let mut output = Vec::with_capacity(out_h * out_w * out_channels);
    for oy in 0..out_h {
        for ox in 0..out_w {
            for o in 0..out_channels {
                let mut acc = args.bias[o];
                for y in 0..kh {
                    let iy = (oy * args.stride + y) as isize - top as isize;
                    if iy < 0 || iy >= height as isize {
                        continue;
                    }
                    for x in 0..kw {
                        let ix = (ox * args.stride + x) as isize - left as isize;
                        if ix < 0 || ix >= width as isize {
                            continue;
                        }
                        let pixel = (iy as usize * width + ix as usize) * in_channels;
                        if let Some(multiplier) = args.depth_multiplier {
                            let value =
                                args.input[pixel + o / multiplier] as i32 - args.input_zero_point;
                            acc += value * args.filter[(y * kw + x) * out_channels + o] as i32;
                        } else {
                            let taps = ((o * kh + y) * kw + x) * in_channels;
                            for i in 0..in_channels {
                                let value = args.input[pixel + i] as i32 - args.input_zero_point;
                                acc += value * args.filter[taps + i] as i32;
                            }
                        }
                    }
                }
                output.push(requantize(
                    acc,
                    args.multipliers[o],
                    args.output.zero_point,
                    args.bounds,
                ));
            }
        }
    }
    output
}

/// Zero pads an NHWC tensor. `paddings` holds `(before, after)` per axis and
/// the batch axis must not be padded.
fn pad(input: &[i8], shape: [usize; 3], paddings: &[i32], zero_point: i32) -> Result<Vec<i8>> {
    let unsupported = || InterpreterError::Paddings(paddings.to_vec());
    if paddings.len() != 8 || paddings[0] != 0 || paddings[1] != 0 {
        return Err(unsupported());
    }
    let amounts = paddings[2..]
        .iter()
        .map(|&p| usize::try_from(p).map_err(|_| unsupported()))
        .collect::<Result<Vec<usize>>>()?;
    let [top, bottom, left, right, front, back] = amounts[..] else {
        return Err(unsupported());
    };

    let [height, width, channels] = shape;
    let out_w = left + width + right;
    let out_c = front + channels + back;
    let mut output = vec![zero_point as i8; (top + height + bottom) * out_w * out_c];

    for y in 0..height {
        for x in 0..width {
            let src = (y * width + x) * channels;
            let dst = ((y + top) * out_w + x + left) * out_c + front;
            output[dst..dst + channels].copy_from_slice(&input[src..src + channels]);
        }
    }
    Ok(output)
}

fn softmax(input: &[i8], input_params: QuantParams, beta: f32, output: QuantParams) -> Vec<i8> {
    let values: Vec<f32> = input.iter().map(|&q| input_params.dequantize(q)).collect();
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values.iter().map(|v| ((v - max) * beta).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| output.quantize(e / sum)).collect()
}

/// Runs a quantized graph on single images.
pub struct Interpreter<'a> {
    graph: &'a QuantizedGraph,
}

impl<'a> Interpreter<'a> {
    pub fn new(graph: &'a QuantizedGraph) -> Result<Self> {
        graph.validate()?;
        Ok(Self { graph })
    }

    /// Quantizes an HWC image in `[0, 1]` with the input tensor parameters.
    pub fn quantize_input(&self, pixels: &[f32]) -> Result<Vec<i8>> {
        let input = params(self.graph.input()?)?;
        Ok(pixels.iter().map(|&p| input.quantize(p)).collect())
    }

    /// Executes every operator and returns the raw int8 output.
    pub fn invoke(&self, input: &[i8]) -> Result<Vec<i8>> {
        let graph = self.graph;
        let input_tensor = graph.input()?;
        if input.len() != input_tensor.num_elements() {
            return Err(InterpreterError::InputSize {
                expected: input_tensor.num_elements(),
                actual: input.len(),
            });
        }

        let mut values: Vec<Option<Vec<i8>>> = vec![None; graph.tensors.len()];
        values[graph.inputs[0]] = Some(input.to_vec());

        let read = |values: &[Option<Vec<i8>>], index: usize| -> Result<Vec<i8>> {
            values[index]
                .clone()
                .ok_or_else(|| InterpreterError::Uncomputed(graph.tensors[index].name.clone()))
        };

        for operator in graph.operators.iter() {
            let (output, result) = match *operator {
                Operator::Conv2d {
                    input,
                    filter,
                    bias,
                    output,
                    stride,
                    padding,
                    activation,
                }
                | Operator::DepthwiseConv2d {
                    input,
                    filter,
                    bias,
                    output,
                    stride,
                    padding,
                    activation,
                    ..
                } => {
                    let depth_multiplier = match *operator {
                        Operator::DepthwiseConv2d {
                            depth_multiplier, ..
                        } => Some(depth_multiplier.max(1)),
                        _ => None,
                    };
                    let input_tensor = graph.tensor(input)?;
                    let filter_tensor = graph.tensor(filter)?;
                    let output_tensor = graph.tensor(output)?;
                    let input_params = params(input_tensor)?;
                    let output_params = params(output_tensor)?;
                    let data = read(&values, input)?;

                    let multipliers = scales(filter_tensor)?
                        .iter()
                        .map(|&s| {
                            input_params.scale as f64 * s as f64 / output_params.scale as f64
                        })
                        .collect();
                    let args = ConvArgs {
                        input: &data,
                        input_shape: [
                            input_tensor.shape[1],
                            input_tensor.shape[2],
                            input_tensor.shape[3],
                        ],
                        input_zero_point: input_params.zero_point,
                        filter: int8_data(filter_tensor)?,
                        filter_shape: [
                            filter_tensor.shape[0],
                            filter_tensor.shape[1],
                            filter_tensor.shape[2],
                            filter_tensor.shape[3],
                        ],
                        bias: int32_data(graph.tensor(bias)?)?,
                        multipliers,
                        stride,
                        padding,
                        depth_multiplier,
                        output: output_params,
                        bounds: activation_bounds(activation, output_params),
                    };
                    (output, conv2d(&args))
                }
                Operator::Pad {
                    input,
                    paddings,
                    output,
                } => {
                    let input_tensor = graph.tensor(input)?;
                    let zero_point = params(input_tensor)?.zero_point;
                    let shape = [
                        input_tensor.shape[1],
                        input_tensor.shape[2],
                        input_tensor.shape[3],
                    ];
                    let paddings = int32_data(graph.tensor(paddings)?)?;
                    let data = read(&values, input)?;
                    (output, pad(&data, shape, paddings, zero_point)?)
                }
                Operator::Reshape { input, output, .. } => (output, read(&values, input)?),
                Operator::FullyConnected {
                    input,
                    weights,
                    bias,
                    output,
                    activation,
                } => {
                    let input_params = params(graph.tensor(input)?)?;
                    let weights_tensor = graph.tensor(weights)?;
                    let output_params = params(graph.tensor(output)?)?;
                    let data = read(&values, input)?;
                    let weights = int8_data(weights_tensor)?;
                    let bias = int32_data(graph.tensor(bias)?)?;

                    let multiplier = input_params.scale as f64
                        * params(weights_tensor)?.scale as f64
                        / output_params.scale as f64;
                    let bounds = activation_bounds(activation, output_params);
                    let in_features = data.len();

                    let result = bias
                        .iter()
                        .enumerate()
                        .map(|(o, &b)| {
                            let row = &weights[o * in_features..(o + 1) * in_features];
                            let acc = row.iter().zip(data.iter()).fold(b, |acc, (&w, &x)| {
                                acc + (x as i32 - input_params.zero_point) * w as i32
                            });
                            requantize(acc, multiplier, output_params.zero_point, bounds)
                        })
                        .collect();
                    (output, result)
                }
                Operator::Softmax { input, output, beta } => {
                    let input_params = params(graph.tensor(input)?)?;
                    let output_params = params(graph.tensor(output)?)?;
                    let data = read(&values, input)?;
                    (output, softmax(&data, input_params, beta, output_params))
                }
            };
            values[output] = Some(result);
        }

        read(&values, graph.outputs[0])
    }

    /// Class probabilities of an HWC image in `[0, 1]`.
    pub fn probabilities(&self, pixels: &[f32]) -> Result<Vec<f32>> {
        let output = self.invoke(&self.quantize_input(pixels)?)?;
        let output_params = params(self.graph.output()?)?;
        Ok(output.iter().map(|&q| output_params.dequantize(q)).collect())
    }

    /// Index of the most probable class. Ties resolve to the lowest index.
    pub fn classify(&self, pixels: &[f32]) -> Result<usize> {
        let output = self.invoke(&self.quantize_input(pixels)?)?;
        let mut best = 0;
        for (i, &value) in output.iter().enumerate() {
            if value > output[best] {
                best = i;
            }
        }
        Ok(best)
    }
}

/// Fraction of images the int8 graph classifies correctly.
pub fn evaluate<D: Dataset<ImageItem>>(graph: &QuantizedGraph, dataset: &D) -> Result<f32> {
    let interpreter = Interpreter::new(graph)?;
    let mut correct = 0;
    let mut total = 0;

    for item in dataset.iter() {
        if interpreter.classify(&item.pixels)? == item.label {
            correct += 1;
        }
        total += 1;
    }

    if total == 0 {
        return Ok(0.0);
    }
    Ok(correct as f32 / total as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::calibrate;
    use crate::model::{BlockPadding, DropNet, DropNetConfig, MobileNetConfig};
    use crate::quantize::{
        quantize_model, quantize_symmetric, symmetric_scale, ElementType, Quantization,
    };
    use burn::{backend::NdArray, prelude::*};

    type B = NdArray<f32>;

    fn graph_tensor(
        name: &str,
        shape: Vec<usize>,
        quantization: Option<Quantization>,
        data: Option<Constant>,
    ) -> GraphTensor {
        let element_type = match data {
            Some(Constant::Int32(_)) => ElementType::Int32,
            _ => ElementType::Int8,
        };
        GraphTensor {
            name: name.to_string(),
            shape,
            element_type,
            quantization,
            data,
        }
    }

    fn pattern(len: usize, seed: usize) -> Vec<f32> {
        (0..len)
            .map(|i| ((i * 7 + seed * 13) % 17) as f32 / 16.0)
            .collect()
    }

    /// One convolution on a `[1, 5, 6, 2]` input, checked against float math
    /// on the dequantized operands. `BottomRight` runs a pad then a `VALID`
    /// convolution, the way strided depthwise blocks are exported.
    fn check_conv(depth_multiplier: Option<usize>, stride: usize, padding: BlockPadding) {
        let [h, w, c] = [5, 6, 2];
        let out_channels = depth_multiplier.map_or(3, |m| c * m);
        let filter_shape = match depth_multiplier {
            Some(_) => vec![1, 3, 3, out_channels],
            None => vec![out_channels, 3, 3, c],
        };
        let filter_len: usize = filter_shape.iter().product();
        let size = filter_len / out_channels;

        let input_params = QuantParams::asymmetric(0.0, 1.0);
        let pixels = pattern(h * w * c, 1);
        let input: Vec<i8> = pixels.iter().map(|&p| input_params.quantize(p)).collect();

        let weights: Vec<f32> = pattern(filter_len, 2).iter().map(|v| v - 0.5).collect();
        let channel_of = |j: usize| match depth_multiplier {
            Some(_) => j % out_channels,
            None => j / size,
        };
        let weight_scales: Vec<f32> = (0..out_channels)
            .map(|o| {
                let channel: Vec<f32> = (0..filter_len)
                    .filter(|&j| channel_of(j) == o)
                    .map(|j| weights[j])
                    .collect();
                symmetric_scale(&channel)
            })
            .collect();
        let filter: Vec<i8> = weights
            .iter()
            .enumerate()
            .map(|(j, &v)| quantize_symmetric(v, weight_scales[channel_of(j)]))
            .collect();
        let bias: Vec<i32> = (0..out_channels)
            .map(|o| {
                let value = 0.1 * (o as f32 - 1.0);
                (value / (input_params.scale * weight_scales[o])).round() as i32
            })
            .collect();

        // float reference with the dequantized operands
        let (graph_padding, [(top, _), (left, _)]) = match padding {
            BlockPadding::Same => (
                Padding::Same,
                [
                    Padding::Same.pads(h, 3, stride),
                    Padding::Same.pads(w, 3, stride),
                ],
            ),
            BlockPadding::BottomRight => (Padding::Valid, [(0, 1), (0, 1)]),
        };
        let out_h = padding.output_size(h, 3, stride);
        let out_w = padding.output_size(w, 3, stride);
        let mut expected = Vec::new();
        for oy in 0..out_h {
            for ox in 0..out_w {
                for o in 0..out_channels {
                    let mut acc = bias[o] as f32 * input_params.scale * weight_scales[o];
                    for y in 0..3 {
                        for x in 0..3 {
                            let iy = (oy * stride + y) as isize - top as isize;
                            let ix = (ox * stride + x) as isize - left as isize;
                            if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                continue;
                            }
                            let pixel = (iy as usize * w + ix as usize) * c;
                            let taps: Vec<(usize, usize)> = match depth_multiplier {
                                Some(m) => vec![(o / m, (y * 3 + x) * out_channels + o)],
                                None => (0..c)
                                    .map(|i| (i, o * size + (y * 3 + x) * c + i))
                                    .collect(),
                            };
                            for (i, tap) in taps {
                                let value = input_params.dequantize(input[pixel + i]);
                                let weight = filter[tap] as f32 * weight_scales[o];
                                acc += value * weight;
                            }
                        }
                    }
                    expected.push(acc.clamp(0.0, RELU6_MAX));
                }
            }
        }
        let max = expected.iter().copied().fold(0.0f32, f32::max);
        let output_params = QuantParams::asymmetric(0.0, max);

        let input_quantization = Some(Quantization::per_tensor(input_params));
        let bias_scales = weight_scales.iter().map(|s| s * input_params.scale).collect();
        let dimension = if depth_multiplier.is_some() { 3 } else { 0 };
        let mut graph = QuantizedGraph {
            tensors: vec![
                graph_tensor("input", vec![1, h, w, c], input_quantization.clone(), None),
                graph_tensor(
                    "filter",
                    filter_shape,
                    Some(Quantization::per_channel(weight_scales.clone(), dimension)),
                    Some(Constant::Int8(filter)),
                ),
                graph_tensor(
                    "bias",
                    vec![out_channels],
                    Some(Quantization::per_channel(bias_scales, 0)),
                    Some(Constant::Int32(bias)),
                ),
                graph_tensor(
                    "output",
                    vec![1, out_h, out_w, out_channels],
                    Some(Quantization::per_tensor(output_params)),
                    None,
                ),
            ],
            operators: Vec::new(),
            inputs: vec![0],
            outputs: vec![3],
        };

        let mut conv_input = 0;
        if padding == BlockPadding::BottomRight {
            graph.tensors.push(graph_tensor(
                "paddings",
                vec![4, 2],
                None,
                Some(Constant::Int32(vec![0, 0, 0, 1, 0, 1, 0, 0])),
            ));
            graph.tensors.push(graph_tensor(
                "padded",
                vec![1, h + 1, w + 1, c],
                input_quantization,
                None,
            ));
            graph.operators.push(Operator::Pad {
                input: 0,
                paddings: 4,
                output: 5,
            });
            conv_input = 5;
        }

        graph.operators.push(match depth_multiplier {
            Some(depth_multiplier) => Operator::DepthwiseConv2d {
                input: conv_input,
                filter: 1,
                bias: 2,
                output: 3,
                stride,
                padding: graph_padding,
                depth_multiplier,
                activation: Activation::Relu6,
            },
            None => Operator::Conv2d {
                input: conv_input,
                filter: 1,
                bias: 2,
                output: 3,
                stride,
                padding: graph_padding,
                activation: Activation::Relu6,
            },
        });

        let output = Interpreter::new(&graph).unwrap().invoke(&input).unwrap();

        assert_eq!(output.len(), expected.len());
        for (q, e) in output.iter().zip(expected.iter()) {
            let actual = output_params.dequantize(*q);
            assert!(
                (actual - e).abs() <= output_params.scale * 0.51,
                "{actual} != {e}"
            );
        }
    }

    #[test]
    fn conv_matches_float_reference() {
        check_conv(None, 1, BlockPadding::Same);
        check_conv(None, 2, BlockPadding::Same);
    }

    #[test]
    fn depthwise_matches_float_reference() {
        check_conv(Some(1), 1, BlockPadding::Same);
        check_conv(Some(1), 2, BlockPadding::Same);
        check_conv(Some(2), 1, BlockPadding::Same);
    }

    #[test]
    fn padded_valid_depthwise_matches_float_reference() {
        check_conv(Some(1), 2, BlockPadding::BottomRight);
        check_conv(Some(2), 2, BlockPadding::BottomRight);
    }

    #[test]
    fn pad_fills_with_zero_point() {
        let input: Vec<i8> = (1..=12).collect();
        let output = pad(&input, [2, 3, 2], &[0, 0, 0, 1, 0, 1, 0, 0], -5).unwrap();

        assert_eq!(output.len(), 3 * 4 * 2);
        // rows of 4 pixels with 2 channels each
        assert_eq!(&output[0..8], &[1, 2, 3, 4, 5, 6, -5, -5]);
        assert_eq!(&output[8..16], &[7, 8, 9, 10, 11, 12, -5, -5]);
        assert!(output[16..].iter().all(|&v| v == -5));

        let err = pad(&input, [2, 3, 2], &[1, 0, 0, 1, 0, 1, 0, 0], 0).unwrap_err();
        assert!(matches!(err, InterpreterError::Paddings(_)));
    }

    #[test]
    fn relu6_bounds_follow_output_scale() {
        let params = QuantParams::asymmetric(-1.0, 10.0);
        let (lo, hi) = activation_bounds(Activation::Relu6, params);
        assert_eq!(lo, params.zero_point);
        assert!((params.dequantize(hi as i8) - 6.0).abs() <= params.scale);
        assert_eq!(activation_bounds(Activation::None, params), (-128, 127));
    }

    #[test]
    fn softmax_output_sums_to_one() {
        let input_params = QuantParams::asymmetric(-4.0, 4.0);
        let input: Vec<i8> = [1.0f32, -2.0, 0.5]
            .iter()
            .map(|&v| input_params.quantize(v))
            .collect();
        let output = softmax(&input, input_params, 1.0, QuantParams::softmax_output());

        let sum: f32 = output
            .iter()
            .map(|&q| QuantParams::softmax_output().dequantize(q))
            .sum();
        assert!((sum - 1.0).abs() < 0.02);
        assert!(output[0] > output[2] && output[2] > output[1]);
    }

    #[test]
    fn rejects_wrong_input_size() {
        let params = Some(Quantization::per_tensor(QuantParams::asymmetric(0.0, 1.0)));
        let softmax_params = Some(Quantization::per_tensor(QuantParams::softmax_output()));
        let graph = QuantizedGraph {
            tensors: vec![
                graph_tensor("input", vec![1, 3], params, None),
                graph_tensor("output", vec![1, 3], softmax_params, None),
            ],
            operators: vec![Operator::Softmax {
                input: 0,
                output: 1,
                beta: 1.0,
            }],
            inputs: vec![0],
            outputs: vec![1],
        };

        let err = Interpreter::new(&graph)
            .unwrap()
            .invoke(&[0, 0])
            .unwrap_err();
        assert!(matches!(
            err,
            InterpreterError::InputSize {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn int8_model_agrees_with_float_model() {
        let device = Default::default();
        let [h, w] = [32, 40];
        let model: DropNet<B> = DropNetConfig::new()
            .with_backbone(
                MobileNetConfig::new()
                    .with_input_height(h)
                    .with_input_width(w),
            )
            .init(&device);

        let images: Vec<Vec<f32>> = (0..4).map(|seed| pattern(h * w * 3, seed)).collect();
        let to_tensor = |pixels: &Vec<f32>| {
            crate::data::image_tensor::<B>(pixels.clone(), h, w, &device).unsqueeze::<4>()
        };

        let ranges = calibrate(&model, images.iter().map(to_tensor)).unwrap();
        let graph = quantize_model(&model, [h, w, 3], &ranges).unwrap();
        let interpreter = Interpreter::new(&graph).unwrap();

        for pixels in images.iter() {
            let expected = model
                .infer(to_tensor(pixels))
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .unwrap();
            let actual = interpreter.probabilities(pixels).unwrap();

            assert_eq!(actual.len(), 2);
            for (a, e) in actual.iter().zip(expected.iter()) {
                assert!((a - e).abs() < 0.1, "{actual:?} != {expected:?}");
            }
        }
    }
}
