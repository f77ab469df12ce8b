//! TensorFlow Lite flatbuffer serialization of a [QuantizedGraph].
//!
//! Tables are written with the raw flatbuffers builder against the field
//! layout of the TFLite schema (version 3). Only the tables and fields the
//! exported graph needs are emitted.

use crate::quantize::{
    Activation, ElementType, GraphTensor, Operator, Padding, Quantization, QuantizedGraph,
};
use flatbuffers::{
    FlatBufferBuilder, Push, PushAlignment, TableFinishedWIPOffset, VOffsetT, WIPOffset,
};
use std::path::Path;
use thiserror::Error;

pub const FILE_IDENTIFIER: &str = "TFL3";
pub const SCHEMA_VERSION: u32 = 3;
const DESCRIPTION: &str = "dropnet int8";

/// Alignment of constant buffer data, so kernels can map weights in place.
pub const BUFFER_ALIGNMENT: usize = 16;

/// Vtable slot of the field with the given schema id.
const fn slot(id: VOffsetT) -> VOffsetT {
    4 + 2 * id
}

mod field {
    use super::slot;
    use flatbuffers::VOffsetT;

    pub const MODEL_VERSION: VOffsetT = slot(0);
    pub const MODEL_OPERATOR_CODES: VOffsetT = slot(1);
    pub const MODEL_SUBGRAPHS: VOffsetT = slot(2);
    pub const MODEL_DESCRIPTION: VOffsetT = slot(3);
    pub const MODEL_BUFFERS: VOffsetT = slot(4);

    pub const CODE_DEPRECATED_BUILTIN: VOffsetT = slot(0);
    pub const CODE_VERSION: VOffsetT = slot(2);
    pub const CODE_BUILTIN: VOffsetT = slot(3);

    pub const SUBGRAPH_TENSORS: VOffsetT = slot(0);
    pub const SUBGRAPH_INPUTS: VOffsetT = slot(1);
    pub const SUBGRAPH_OUTPUTS: VOffsetT = slot(2);
    pub const SUBGRAPH_OPERATORS: VOffsetT = slot(3);
    pub const SUBGRAPH_NAME: VOffsetT = slot(4);

    pub const TENSOR_SHAPE: VOffsetT = slot(0);
    pub const TENSOR_TYPE: VOffsetT = slot(1);
    pub const TENSOR_BUFFER: VOffsetT = slot(2);
    pub const TENSOR_NAME: VOffsetT = slot(3);
    pub const TENSOR_QUANTIZATION: VOffsetT = slot(4);

    pub const QUANT_SCALE: VOffsetT = slot(2);
    pub const QUANT_ZERO_POINT: VOffsetT = slot(3);
    pub const QUANT_DIMENSION: VOffsetT = slot(6);

    pub const OPERATOR_OPCODE_INDEX: VOffsetT = slot(0);
    pub const OPERATOR_INPUTS: VOffsetT = slot(1);
    pub const OPERATOR_OUTPUTS: VOffsetT = slot(2);
    pub const OPERATOR_OPTIONS_TYPE: VOffsetT = slot(3);
    pub const OPERATOR_OPTIONS: VOffsetT = slot(4);

    pub const BUFFER_DATA: VOffsetT = slot(0);
}

// TensorType
const TENSOR_INT32: i8 = 2;
const TENSOR_INT8: i8 = 9;

// Padding and ActivationFunctionType
const PADDING_SAME: i8 = 0;
const PADDING_VALID: i8 = 1;
const ACTIVATION_NONE: i8 = 0;
const ACTIVATION_RELU6: i8 = 3;

/// Builtin operator code and the operator version it is written with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct OpCode {
    builtin: i32,
    version: i32,
}

const CONV_2D: OpCode = OpCode { builtin: 3, version: 3 };
const DEPTHWISE_CONV_2D: OpCode = OpCode { builtin: 4, version: 3 };
const FULLY_CONNECTED: OpCode = OpCode { builtin: 9, version: 4 };
const RESHAPE: OpCode = OpCode { builtin: 22, version: 1 };
const SOFTMAX: OpCode = OpCode { builtin: 25, version: 2 };
const PAD: OpCode = OpCode { builtin: 34, version: 2 };

// BuiltinOptions union tags
const OPTIONS_CONV_2D: u8 = 1;
const OPTIONS_DEPTHWISE_CONV_2D: u8 = 2;
const OPTIONS_FULLY_CONNECTED: u8 = 8;
const OPTIONS_SOFTMAX: u8 = 9;
const OPTIONS_RESHAPE: u8 = 17;
const OPTIONS_PAD: u8 = 22;

fn op_code(operator: &Operator) -> OpCode {
    match operator {
        Operator::Conv2d { .. } => CONV_2D,
        Operator::DepthwiseConv2d { .. } => DEPTHWISE_CONV_2D,
        Operator::Pad { .. } => PAD,
        Operator::Reshape { .. } => RESHAPE,
        Operator::FullyConnected { .. } => FULLY_CONNECTED,
        Operator::Softmax { .. } => SOFTMAX,
    }
}

fn activation_code(activation: Activation) -> i8 {
    match activation {
        Activation::None => ACTIVATION_NONE,
        Activation::Relu6 => ACTIVATION_RELU6,
    }
}

fn padding_code(padding: Padding) -> i8 {
    match padding {
        Padding::Same => PADDING_SAME,
        Padding::Valid => PADDING_VALID,
    }
}

fn tensor_type(element_type: ElementType) -> i8 {
    match element_type {
        ElementType::Int8 => TENSOR_INT8,
        ElementType::Int32 => TENSOR_INT32,
    }
}

type Table = WIPOffset<TableFinishedWIPOffset>;

/// Buffer byte whose vectors start on a [BUFFER_ALIGNMENT] boundary.
#[derive(Clone, Copy)]
struct AlignedByte(u8);

impl Push for AlignedByte {
    type Output = u8;

    #[inline]
    unsafe fn push(&self, dst: &mut [u8], _written_len: usize) {
        dst[0] = self.0;
    }

    #[inline]
    fn alignment() -> PushAlignment {
        PushAlignment::new(BUFFER_ALIGNMENT)
    }
}

fn write_buffer(fbb: &mut FlatBufferBuilder, bytes: Option<&[u8]>) -> Table {
    let data = bytes.map(|bytes| {
        let bytes: Vec<AlignedByte> = bytes.iter().copied().map(AlignedByte).collect();
        fbb.create_vector(&bytes)
    });
    let start = fbb.start_table();
    if let Some(data) = data {
        fbb.push_slot_always(field::BUFFER_DATA, data);
    }
    fbb.end_table(start)
}

fn write_quantization(fbb: &mut FlatBufferBuilder, quantization: &Quantization) -> Table {
    let scale = fbb.create_vector(&quantization.scales);
    let zero_point = fbb.create_vector(&quantization.zero_points);
    let start = fbb.start_table();
    fbb.push_slot_always(field::QUANT_SCALE, scale);
    fbb.push_slot_always(field::QUANT_ZERO_POINT, zero_point);
    fbb.push_slot::<i32>(field::QUANT_DIMENSION, quantization.dimension as i32, 0);
    fbb.end_table(start)
}

fn write_tensor(fbb: &mut FlatBufferBuilder, tensor: &GraphTensor, buffer: u32) -> Table {
    let shape: Vec<i32> = tensor.shape.iter().map(|&d| d as i32).collect();
    let shape = fbb.create_vector(&shape);
    let name = fbb.create_string(&tensor.name);
    let quantization = tensor
        .quantization
        .as_ref()
        .map(|quantization| write_quantization(fbb, quantization));

    let start = fbb.start_table();
    fbb.push_slot_always(field::TENSOR_SHAPE, shape);
    fbb.push_slot::<i8>(field::TENSOR_TYPE, tensor_type(tensor.element_type), 0);
    fbb.push_slot::<u32>(field::TENSOR_BUFFER, buffer, 0);
    fbb.push_slot_always(field::TENSOR_NAME, name);
    if let Some(quantization) = quantization {
        fbb.push_slot_always(field::TENSOR_QUANTIZATION, quantization);
    }
    fbb.end_table(start)
}

fn write_options(
    fbb: &mut FlatBufferBuilder,
    operator: &Operator,
    graph: &QuantizedGraph,
) -> (u8, Table) {
    match *operator {
        Operator::Conv2d {
            stride,
            padding,
            activation,
            ..
        } => {
            let start = fbb.start_table();
            fbb.push_slot::<i8>(slot(0), padding_code(padding), 0);
            fbb.push_slot::<i32>(slot(1), stride as i32, 0);
            fbb.push_slot::<i32>(slot(2), stride as i32, 0);
            fbb.push_slot::<i8>(slot(3), activation_code(activation), 0);
            fbb.push_slot::<i32>(slot(4), 1, 1);
            fbb.push_slot::<i32>(slot(5), 1, 1);
            (OPTIONS_CONV_2D, fbb.end_table(start))
        }
        Operator::DepthwiseConv2d {
            stride,
            padding,
            depth_multiplier,
            activation,
            ..
        } => {
            let start = fbb.start_table();
            fbb.push_slot::<i8>(slot(0), padding_code(padding), 0);
            fbb.push_slot::<i32>(slot(1), stride as i32, 0);
            fbb.push_slot::<i32>(slot(2), stride as i32, 0);
            fbb.push_slot_always::<i32>(slot(3), depth_multiplier as i32);
            fbb.push_slot::<i8>(slot(4), activation_code(activation), 0);
            fbb.push_slot::<i32>(slot(5), 1, 1);
            fbb.push_slot::<i32>(slot(6), 1, 1);
            (OPTIONS_DEPTHWISE_CONV_2D, fbb.end_table(start))
        }
        Operator::Pad { .. } => {
            let start = fbb.start_table();
            (OPTIONS_PAD, fbb.end_table(start))
        }
        Operator::FullyConnected { activation, .. } => {
            let start = fbb.start_table();
            fbb.push_slot::<i8>(slot(0), activation_code(activation), 0);
            (OPTIONS_FULLY_CONNECTED, fbb.end_table(start))
        }
        Operator::Softmax { beta, .. } => {
            let start = fbb.start_table();
            fbb.push_slot::<f32>(slot(0), beta, 0.0);
            (OPTIONS_SOFTMAX, fbb.end_table(start))
        }
        Operator::Reshape { output, .. } => {
            let new_shape: Vec<i32> = graph
                .tensors
                .get(output)
                .map(|tensor| tensor.shape.iter().map(|&d| d as i32).collect())
                .unwrap_or_default();
            let new_shape = fbb.create_vector(&new_shape);
            let start = fbb.start_table();
            fbb.push_slot_always(slot(0), new_shape);
            (OPTIONS_RESHAPE, fbb.end_table(start))
        }
    }
}

fn write_operator(
    fbb: &mut FlatBufferBuilder,
    operator: &Operator,
    opcode_index: u32,
    graph: &QuantizedGraph,
) -> Table {
    let inputs: Vec<i32> = operator.inputs().iter().map(|&i| i as i32).collect();
    let outputs: Vec<i32> = operator.outputs().iter().map(|&i| i as i32).collect();
    let inputs = fbb.create_vector(&inputs);
    let outputs = fbb.create_vector(&outputs);
    let (options_type, options) = write_options(fbb, operator, graph);

    let start = fbb.start_table();
    fbb.push_slot::<u32>(field::OPERATOR_OPCODE_INDEX, opcode_index, 0);
    fbb.push_slot_always(field::OPERATOR_INPUTS, inputs);
    fbb.push_slot_always(field::OPERATOR_OUTPUTS, outputs);
    fbb.push_slot::<u8>(field::OPERATOR_OPTIONS_TYPE, options_type, 0);
    fbb.push_slot_always(field::OPERATOR_OPTIONS, options);
    fbb.end_table(start)
}

fn write_operator_code(fbb: &mut FlatBufferBuilder, code: OpCode) -> Table {
    let start = fbb.start_table();
    fbb.push_slot::<i8>(field::CODE_DEPRECATED_BUILTIN, code.builtin.min(127) as i8, 0);
    fbb.push_slot::<i32>(field::CODE_VERSION, code.version, 1);
    fbb.push_slot::<i32>(field::CODE_BUILTIN, code.builtin, 0);
    fbb.end_table(start)
}

/// Serializes the graph into a `.tflite` flatbuffer.
pub fn serialize(graph: &QuantizedGraph) -> Vec<u8> {
    let constant_bytes: usize = graph
        .tensors
        .iter()
        .filter_map(|tensor| tensor.data.as_ref())
        .map(|data| data.len() * 4)
        .sum();
    let mut fbb = FlatBufferBuilder::with_capacity(constant_bytes + 16 * 1024);

    let mut codes: Vec<OpCode> = Vec::new();
    let opcode_indices: Vec<u32> = graph
        .operators
        .iter()
        .map(|operator| {
            let code = op_code(operator);
            let index = match codes.iter().position(|&c| c == code) {
                Some(index) => index,
                None => {
                    codes.push(code);
                    codes.len() - 1
                }
            };
            index as u32
        })
        .collect();

    // Buffer 0 is the empty sentinel shared by every activation.
    let mut buffers = vec![write_buffer(&mut fbb, None)];
    let mut tensor_buffers = Vec::with_capacity(graph.tensors.len());
    for tensor in graph.tensors.iter() {
        match &tensor.data {
            Some(data) => {
                buffers.push(write_buffer(&mut fbb, Some(data.to_le_bytes().as_slice())));
                tensor_buffers.push((buffers.len() - 1) as u32);
            }
            None => tensor_buffers.push(0),
        }
    }

    let mut tensors = Vec::with_capacity(graph.tensors.len());
    for (tensor, &buffer) in graph.tensors.iter().zip(tensor_buffers.iter()) {
        tensors.push(write_tensor(&mut fbb, tensor, buffer));
    }

    let mut operators = Vec::with_capacity(graph.operators.len());
    for (operator, &index) in graph.operators.iter().zip(opcode_indices.iter()) {
        operators.push(write_operator(&mut fbb, operator, index, graph));
    }

    let inputs: Vec<i32> = graph.inputs.iter().map(|&i| i as i32).collect();
    let outputs: Vec<i32> = graph.outputs.iter().map(|&i| i as i32).collect();
    let tensors = fbb.create_vector(&tensors);
    let inputs = fbb.create_vector(&inputs);
    let outputs = fbb.create_vector(&outputs);
    let operators = fbb.create_vector(&operators);
    let name = fbb.create_string("main");

    let start = fbb.start_table();
    fbb.push_slot_always(field::SUBGRAPH_TENSORS, tensors);
    fbb.push_slot_always(field::SUBGRAPH_INPUTS, inputs);
    fbb.push_slot_always(field::SUBGRAPH_OUTPUTS, outputs);
    fbb.push_slot_always(field::SUBGRAPH_OPERATORS, operators);
    fbb.push_slot_always(field::SUBGRAPH_NAME, name);
    let subgraph = fbb.end_table(start);

    let mut code_tables = Vec::with_capacity(codes.len());
    for &code in codes.iter() {
        code_tables.push(write_operator_code(&mut fbb, code));
    }

    let operator_codes = fbb.create_vector(&code_tables);
    let subgraphs = fbb.create_vector(&[subgraph]);
    let description = fbb.create_string(DESCRIPTION);
    let buffers = fbb.create_vector(&buffers);

    let start = fbb.start_table();
    fbb.push_slot::<u32>(field::MODEL_VERSION, SCHEMA_VERSION, 0);
    fbb.push_slot_always(field::MODEL_OPERATOR_CODES, operator_codes);
    fbb.push_slot_always(field::MODEL_SUBGRAPHS, subgraphs);
    fbb.push_slot_always(field::MODEL_DESCRIPTION, description);
    fbb.push_slot_always(field::MODEL_BUFFERS, buffers);
    let model = fbb.end_table(start);

    fbb.finish(model, Some(FILE_IDENTIFIER));
    fbb.finished_data().to_vec()
}

#[derive(Error, Debug)]
pub enum TfliteError {
    #[error("missing `TFL3` file identifier")]
    Identifier,

    #[error("offset {0} is out of bounds")]
    OutOfBounds(usize),

    #[error("required field `{0}` is absent")]
    MissingField(&'static str),

    #[error("I/O error on `{path}`: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Writes the flatbuffer to `path`, replacing any previous file.
pub fn write_model(path: &Path, bytes: &[u8]) -> Result<(), TfliteError> {
    std::fs::write(path, bytes).map_err(|source| TfliteError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Shape and type of a graph input or output.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorSummary {
    pub name: String,
    pub shape: Vec<i32>,
    pub element_type: Option<ElementType>,
    pub scale: Option<f32>,
    pub zero_point: Option<i64>,
}

/// Top-level facts read back from a serialized model.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSummary {
    pub version: u32,
    pub num_operators: usize,
    pub num_tensors: usize,
    pub builtin_codes: Vec<i32>,
    pub inputs: Vec<TensorSummary>,
    pub outputs: Vec<TensorSummary>,
}

/// Bounds-checked reader over the flatbuffer wire format.
struct Reader<'a> {
    buf: &'a [u8],
}

impl Reader<'_> {
    fn bytes<const N: usize>(&self, pos: usize) -> Result<[u8; N], TfliteError> {
        self.buf
            .get(pos..pos + N)
            .and_then(|slice| slice.try_into().ok())
            .ok_or(TfliteError::OutOfBounds(pos))
    }

    fn u16(&self, pos: usize) -> Result<u16, TfliteError> {
        self.bytes(pos).map(u16::from_le_bytes)
    }

    fn u32(&self, pos: usize) -> Result<u32, TfliteError> {
        self.bytes(pos).map(u32::from_le_bytes)
    }

    fn i32(&self, pos: usize) -> Result<i32, TfliteError> {
        self.bytes(pos).map(i32::from_le_bytes)
    }

    fn indirect(&self, pos: usize) -> Result<usize, TfliteError> {
        Ok(pos + self.u32(pos)? as usize)
    }

    /// Absolute position of a table field, if present.
    fn field(&self, table: usize, slot: VOffsetT) -> Result<Option<usize>, TfliteError> {
        let vtable = table as i64 - self.i32(table)? as i64;
        let vtable = usize::try_from(vtable).map_err(|_| TfliteError::OutOfBounds(table))?;
        if slot as usize + 2 > self.u16(vtable)? as usize {
            return Ok(None);
        }
        match self.u16(vtable + slot as usize)? {
            0 => Ok(None),
            offset => Ok(Some(table + offset as usize)),
        }
    }

    fn required(
        &self,
        table: usize,
        slot: VOffsetT,
        name: &'static str,
    ) -> Result<usize, TfliteError> {
        self.field(table, slot)?.ok_or(TfliteError::MissingField(name))
    }

    /// Start and length of a vector field.
    fn vector(
        &self,
        table: usize,
        slot: VOffsetT,
        name: &'static str,
    ) -> Result<(usize, usize), TfliteError> {
        let vector = self.indirect(self.required(table, slot, name)?)?;
        Ok((vector + 4, self.u32(vector)? as usize))
    }

    fn table_at(&self, vector: (usize, usize), index: usize) -> Result<usize, TfliteError> {
        if index >= vector.1 {
            return Err(TfliteError::OutOfBounds(index));
        }
        self.indirect(vector.0 + 4 * index)
    }

    fn string(&self, table: usize, slot: VOffsetT) -> Result<String, TfliteError> {
        let Some(pos) = self.field(table, slot)? else {
            return Ok(String::new());
        };
        let start = self.indirect(pos)?;
        let len = self.u32(start)? as usize;
        let bytes = self
            .buf
            .get(start + 4..start + 4 + len)
            .ok_or(TfliteError::OutOfBounds(start))?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn tensor(&self, tensors: (usize, usize), index: usize) -> Result<TensorSummary, TfliteError> {
        let tensor = self.table_at(tensors, index)?;

        let (start, len) = self.vector(tensor, field::TENSOR_SHAPE, "Tensor.shape")?;
        let shape = (0..len)
            .map(|i| self.i32(start + 4 * i))
            .collect::<Result<Vec<_>, _>>()?;

        let element_type = match self.field(tensor, field::TENSOR_TYPE)? {
            Some(pos) => self.bytes::<1>(pos)?[0] as i8,
            None => 0,
        };
        let element_type = match element_type {
            TENSOR_INT8 => Some(ElementType::Int8),
            TENSOR_INT32 => Some(ElementType::Int32),
            _ => None,
        };

        let (scale, zero_point) = match self.field(tensor, field::TENSOR_QUANTIZATION)? {
            Some(pos) => {
                let quantization = self.indirect(pos)?;
                let (scales, num_scales) = self.vector(quantization, field::QUANT_SCALE, "scale")?;
                let (zeros, num_zeros) =
                    self.vector(quantization, field::QUANT_ZERO_POINT, "zero_point")?;
                let scale = match num_scales {
                    0 => None,
                    _ => Some(f32::from_le_bytes(self.bytes(scales)?)),
                };
                let zero_point = match num_zeros {
                    0 => None,
                    _ => Some(i64::from_le_bytes(self.bytes(zeros)?)),
                };
                (scale, zero_point)
            }
            None => (None, None),
        };

        Ok(TensorSummary {
            name: self.string(tensor, field::TENSOR_NAME)?,
            shape,
            element_type,
            scale,
            zero_point,
        })
    }
}

/// Reads the summary of a serialized model back from its bytes.
pub fn inspect(bytes: &[u8]) -> Result<ModelSummary, TfliteError> {
    if bytes.len() < 8 || !flatbuffers::buffer_has_identifier(bytes, FILE_IDENTIFIER, false) {
        return Err(TfliteError::Identifier);
    }

    let reader = Reader { buf: bytes };
    let model = reader.indirect(0)?;

    let version = match reader.field(model, field::MODEL_VERSION)? {
        Some(pos) => reader.u32(pos)?,
        None => 0,
    };

    let codes = reader.vector(model, field::MODEL_OPERATOR_CODES, "Model.operator_codes")?;
    let mut builtin_codes = Vec::with_capacity(codes.1);
    for i in 0..codes.1 {
        let code = reader.table_at(codes, i)?;
        let builtin = match reader.field(code, field::CODE_BUILTIN)? {
            Some(pos) => reader.i32(pos)?,
            None => 0,
        };
        builtin_codes.push(builtin);
    }

    let subgraphs = reader.vector(model, field::MODEL_SUBGRAPHS, "Model.subgraphs")?;
    let subgraph = reader.table_at(subgraphs, 0)?;
    let tensors = reader.vector(subgraph, field::SUBGRAPH_TENSORS, "SubGraph.tensors")?;
    let operators = reader.vector(subgraph, field::SUBGRAPH_OPERATORS, "SubGraph.operators")?;

    let io = |slot: VOffsetT, name: &'static str| -> Result<Vec<TensorSummary>, TfliteError> {
        let (start, len) = reader.vector(subgraph, slot, name)?;
        (0..len)
            .map(|i| {
                let index = reader.i32(start + 4 * i)?;
                let index = usize::try_from(index).map_err(|_| TfliteError::OutOfBounds(start))?;
                reader.tensor(tensors, index)
            })
            .collect()
    };
    let inputs = io(field::SUBGRAPH_INPUTS, "SubGraph.inputs")?;
    let outputs = io(field::SUBGRAPH_OUTPUTS, "SubGraph.outputs")?;

    Ok(ModelSummary {
        version,
        num_operators: operators.1,
        num_tensors: tensors.1,
        builtin_codes,
        inputs,
        outputs,
    })
}
