//! Output tensor descriptions and quantization arithmetic.

use anyhow::{anyhow, Result};

use super::ffi;

pub const MAX_TENSOR_RANK: usize = ffi::HB_DNN_TENSOR_MAX_DIMENSIONS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorLayout {
    /// Channel-first.
    Nchw,
    /// Channel-last.
    Nhwc,
}

impl TensorLayout {
    pub(crate) fn from_raw(tag: i32) -> Self {
        if tag == ffi::HB_DNN_LAYOUT_NCHW {
            TensorLayout::Nchw
        } else {
            TensorLayout::Nhwc
        }
    }

    pub(crate) fn to_raw(self) -> i32 {
        match self {
            TensorLayout::Nchw => ffi::HB_DNN_LAYOUT_NCHW,
            TensorLayout::Nhwc => ffi::HB_DNN_LAYOUT_NHWC,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementType {
    F32,
    I32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Quantization {
    None,
    /// `value = (raw - zero_point) * scale`, per channel on the trailing axis.
    Linear {
        scales: Vec<f32>,
        zero_points: Vec<i32>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct TensorDescriptor {
    pub shape: Vec<usize>,
    pub layout: TensorLayout,
    pub element: ElementType,
    pub quantization: Quantization,
}

impl TensorDescriptor {
    pub fn float(shape: Vec<usize>, layout: TensorLayout) -> Self {
        Self {
            shape,
            layout,
            element: ElementType::F32,
            quantization: Quantization::None,
        }
    }

    pub fn quantized(shape: Vec<usize>, layout: TensorLayout, scales: Vec<f32>) -> Self {
        Self {
            shape,
            layout,
            element: ElementType::I32,
            quantization: Quantization::Linear {
                scales,
                zero_points: Vec::new(),
            },
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.quantization, Quantization::Linear { .. })
    }

    /// Channel dimension for a rank-4 tensor in this layout.
    pub fn channels(&self) -> Option<usize> {
        if self.shape.len() != 4 {
            return None;
        }
        Some(match self.layout {
            TensorLayout::Nchw => self.shape[1],
            TensorLayout::Nhwc => self.shape[3],
        })
    }

    /// `(height, width)` for a rank-4 tensor in this layout.
    pub fn spatial(&self) -> Option<(usize, usize)> {
        if self.shape.len() != 4 {
            return None;
        }
        Some(match self.layout {
            TensorLayout::Nchw => (self.shape[2], self.shape[3]),
            TensorLayout::Nhwc => (self.shape[1], self.shape[2]),
        })
    }

    /// Check the shape and expand broadcast quantization parameters.
    ///
    /// Scales are laid out over the trailing dimension. A single scale is
    /// repeated for every channel; a full-length array is kept as is.
    pub fn validate(&mut self) -> Result<()> {
        if self.shape.is_empty() || self.shape.len() > MAX_TENSOR_RANK {
            return Err(anyhow!(
                "tensor rank must be 1..={}, got {}",
                MAX_TENSOR_RANK,
                self.shape.len()
            ));
        }
        if self.shape.contains(&0) {
            return Err(anyhow!("tensor shape {:?} has a zero dimension", self.shape));
        }
        let trailing = self.shape[self.shape.len() - 1];
        if let Quantization::Linear {
            scales,
            zero_points,
        } = &mut self.quantization
        {
            if self.element != ElementType::I32 {
                return Err(anyhow!("quantized tensors must hold I32 elements"));
            }
            *scales = broadcast(std::mem::take(scales), trailing, "scale")?;
            *zero_points = if zero_points.is_empty() {
                vec![0; trailing]
            } else {
                broadcast(std::mem::take(zero_points), trailing, "zero point")?
            };
        }
        Ok(())
    }

    /// Scale and zero point applying to flat element `index`.
    pub fn quant_params(&self, index: usize) -> Option<(f32, i32)> {
        let Quantization::Linear {
            scales,
            zero_points,
        } = &self.quantization
        else {
            return None;
        };
        let trailing = *self.shape.last()?;
        let channel = index % trailing;
        Some((
            *scales.get(channel)?,
            zero_points.get(channel).copied().unwrap_or(0),
        ))
    }
}

fn broadcast<T: Copy>(values: Vec<T>, len: usize, what: &str) -> Result<Vec<T>> {
    match values.len() {
        1 => Ok(vec![values[0]; len]),
        n if n == len => Ok(values),
        n => Err(anyhow!(
            "{} array of length {} does not broadcast over {} channels",
            what,
            n,
            len
        )),
    }
}

pub fn dequantize(raw: i32, scale: f32, zero_point: i32) -> f32 {
    (raw as i64 - zero_point as i64) as f32 * scale
}

pub fn quantize(value: f32, scale: f32, zero_point: i32) -> i32 {
    let q = (value / scale).round() as i64 + zero_point as i64;
    q.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element(&self) -> ElementType {
        match self {
            TensorData::F32(_) => ElementType::F32,
            TensorData::I32(_) => ElementType::I32,
        }
    }
}

/// One inference output buffer, laid out as its descriptor says.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputTensor {
    pub data: TensorData,
}

impl OutputTensor {
    pub fn f32(values: Vec<f32>) -> Self {
        Self {
            data: TensorData::F32(values),
        }
    }

    pub fn i32(values: Vec<i32>) -> Self {
        Self {
            data: TensorData::I32(values),
        }
    }

    /// Element `index` as a real value.
    pub fn value(&self, descriptor: &TensorDescriptor, index: usize) -> f32 {
        match &self.data {
            TensorData::F32(v) => v[index],
            TensorData::I32(v) => match descriptor.quant_params(index) {
                Some((scale, zp)) => dequantize(v[index], scale, zp),
                None => v[index] as f32,
            },
        }
    }
}
