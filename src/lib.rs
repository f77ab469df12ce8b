//! Drop / no-drop image classifier.
//!
//! A MobileNet v1 backbone with frozen weights is extended with a dense
//! classification head, trained on a directory of labelled images, then
//! quantized to int8 and exported as a TensorFlow Lite flatbuffer.

pub mod augment;
pub mod calibration;
pub mod cli;
pub mod data;
pub mod dataset;
pub mod error;
pub mod interpreter;
pub mod model;
pub mod pipeline;
pub mod quantize;
pub mod tflite;
pub mod training;

pub use error::{Error, Result};

/// Image height fed to the network.
pub const HEIGHT: usize = 80;
/// Image width fed to the network.
pub const WIDTH: usize = 100;
/// RGB.
pub const CHANNELS: usize = 3;
/// Drop and no drop.
pub const CLASS_NUM: usize = 2;
