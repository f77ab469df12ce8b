use super::{QuantParams, QuantizeError};
use crate::model::{same_padding, valid_output_size};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementType {
    Int8,
    Int32,
}

/// Quantization of a tensor, either per tensor (one scale) or per channel
/// along `dimension`.
#[derive(Clone, Debug, PartialEq)]
pub struct Quantization {
    pub scales: Vec<f32>,
    pub zero_points: Vec<i64>,
    pub dimension: usize,
}

impl Quantization {
    pub fn per_tensor(params: QuantParams) -> Self {
        Self {
            scales: vec![params.scale],
            zero_points: vec![params.zero_point as i64],
            dimension: 0,
        }
    }

    /// Symmetric per-channel quantization, zero points all zero.
    pub fn per_channel(scales: Vec<f32>, dimension: usize) -> Self {
        Self {
            zero_points: vec![0; scales.len()],
            scales,
            dimension,
        }
    }

    /// The single affine mapping of a per-tensor quantization.
    pub fn params(&self) -> QuantParams {
        QuantParams {
            scale: self.scales[0],
            zero_point: self.zero_points[0] as i32,
        }
    }
}

/// Constant tensor contents.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Int8(Vec<i8>),
    Int32(Vec<i32>),
}

impl Constant {
    pub fn len(&self) -> usize {
        match self {
            Constant::Int8(values) => values.len(),
            Constant::Int32(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Little endian bytes, the layout of flatbuffer buffers.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Constant::Int8(values) => values.iter().map(|&v| v as u8).collect(),
            Constant::Int32(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GraphTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub element_type: ElementType,
    pub quantization: Option<Quantization>,
    pub data: Option<Constant>,
}

impl GraphTensor {
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    None,
    Relu6,
}

/// Convolution window placement, as TFLite defines it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Padding {
    /// `ceil(size / stride)` outputs, zeros split around the input with the
    /// extra one after.
    Same,
    /// Only windows that fit inside the input.
    Valid,
}

impl Padding {
    pub fn output_size(self, size: usize, kernel_size: usize, stride: usize) -> usize {
        match self {
            Padding::Same => size.div_ceil(stride),
            Padding::Valid => valid_output_size(size, kernel_size, stride),
        }
    }

    /// Zeros `(before, after)` added along one axis.
    pub fn pads(self, size: usize, kernel_size: usize, stride: usize) -> (usize, usize) {
        match self {
            Padding::Same => same_padding(size, kernel_size, stride),
            Padding::Valid => (0, 0),
        }
    }
}

/// Operators of the exported graph. Fields are tensor indices unless noted.
/// Activations are NHWC.
#[derive(Clone, Debug, PartialEq)]
pub enum Operator {
    Conv2d {
        input: usize,
        filter: usize,
        bias: usize,
        output: usize,
        stride: usize,
        padding: Padding,
        activation: Activation,
    },
    DepthwiseConv2d {
        input: usize,
        filter: usize,
        bias: usize,
        output: usize,
        stride: usize,
        padding: Padding,
        /// Output channels per input channel.
        depth_multiplier: usize,
        activation: Activation,
    },
    /// Zero padding. `paddings` is an int32 `[rank, 2]` constant of
    /// `(before, after)` pairs. Pads hold the input zero point.
    Pad {
        input: usize,
        paddings: usize,
        output: usize,
    },
    Reshape {
        input: usize,
        shape: usize,
        output: usize,
    },
    FullyConnected {
        input: usize,
        weights: usize,
        bias: usize,
        output: usize,
        activation: Activation,
    },
    Softmax {
        input: usize,
        output: usize,
        beta: f32,
    },
}

impl Operator {
    pub fn inputs(&self) -> Vec<usize> {
        match *self {
            Operator::Conv2d {
                input, filter, bias, ..
            }
            | Operator::DepthwiseConv2d {
                input, filter, bias, ..
            } => vec![input, filter, bias],
            Operator::Pad {
                input, paddings, ..
            } => vec![input, paddings],
            Operator::Reshape { input, shape, .. } => vec![input, shape],
            Operator::FullyConnected {
                input,
                weights,
                bias,
                ..
            } => vec![input, weights, bias],
            Operator::Softmax { input, .. } => vec![input],
        }
    }

    pub fn outputs(&self) -> Vec<usize> {
        match *self {
            Operator::Conv2d { output, .. }
            | Operator::DepthwiseConv2d { output, .. }
            | Operator::Pad { output, .. }
            | Operator::Reshape { output, .. }
            | Operator::FullyConnected { output, .. }
            | Operator::Softmax { output, .. } => vec![output],
        }
    }
}

/// A fully quantized single-subgraph model.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuantizedGraph {
    pub tensors: Vec<GraphTensor>,
    pub operators: Vec<Operator>,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

impl QuantizedGraph {
    pub(crate) fn push_tensor(&mut self, tensor: GraphTensor) -> usize {
        self.tensors.push(tensor);
        self.tensors.len() - 1
    }

    pub fn tensor(&self, index: usize) -> Result<&GraphTensor, QuantizeError> {
        self.tensors
            .get(index)
            .ok_or(QuantizeError::MissingTensor(index))
    }

    pub fn input(&self) -> Result<&GraphTensor, QuantizeError> {
        let index = *self.inputs.first().ok_or(QuantizeError::MissingTensor(0))?;
        self.tensor(index)
    }

    pub fn output(&self) -> Result<&GraphTensor, QuantizeError> {
        let index = *self.outputs.first().ok_or(QuantizeError::MissingTensor(0))?;
        self.tensor(index)
    }

    /// Checks that operators are in execution order: every operator input is
    /// a graph input, a constant or the output of an earlier operator.
    pub fn validate(&self) -> Result<(), QuantizeError> {
        let mut available = vec![false; self.tensors.len()];

        for &index in self.inputs.iter() {
            self.tensor(index)?;
            available[index] = true;
        }
        for (index, tensor) in self.tensors.iter().enumerate() {
            if tensor.data.is_some() {
                available[index] = true;
            }
        }

        for (position, operator) in self.operators.iter().enumerate() {
            for index in operator.inputs() {
                self.tensor(index)?;
                if !available[index] {
                    return Err(QuantizeError::UnorderedOperator {
                        position,
                        tensor: index,
                    });
                }
            }
            for index in operator.outputs() {
                self.tensor(index)?;
                available[index] = true;
            }
        }

        for &index in self.outputs.iter() {
            self.tensor(index)?;
            if !available[index] {
                return Err(QuantizeError::MissingTensor(index));
            }
        }

        Ok(())
    }
}
