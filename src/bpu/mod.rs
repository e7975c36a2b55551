//! Accelerator (BPU) binding.
//!
//! - `runtime`: loads a compiled model through the vendor runtime and runs inference
//! - `postprocess`: validates the FCOS output set and turns raw tensors into detections
//! - `decoder`: per-stride FCOS decode, native library or builtin
//! - `tensor`: descriptors and quantization arithmetic
//!
//! The `#[repr(C)]` layouts in `ffi` stay private to this module.

pub mod decoder;
mod ffi;
mod library;
pub mod postprocess;
pub mod runtime;
pub mod tensor;

pub use decoder::{BuiltinFcosDecoder, DecodeConfig, NativeFcosDecoder, StrideDecoder, FCOS_STRIDES};
pub use postprocess::{PostProcessSettings, TensorPostProcessor, FCOS_OUTPUT_COUNT};
pub use runtime::{AcceleratorRuntime, HobotDnnRuntime};
pub use tensor::{dequantize, quantize, ElementType, OutputTensor, Quantization, TensorData, TensorDescriptor, TensorLayout};
