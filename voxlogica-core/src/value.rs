//! The runtime value model shared by the codec, the registry, and the
//! descriptor builder.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Element type of an n-dimensional array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl Dtype {
    pub fn size(self) -> usize {
        match self {
            Dtype::U8 => 1,
            Dtype::I32 | Dtype::F32 => 4,
            Dtype::I64 | Dtype::F64 => 8,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Dtype::U8 => 0,
            Dtype::I32 => 1,
            Dtype::I64 => 2,
            Dtype::F32 => 3,
            Dtype::F64 => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Dtype::U8),
            1 => Some(Dtype::I32),
            2 => Some(Dtype::I64),
            3 => Some(Dtype::F32),
            4 => Some(Dtype::F64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dtype::U8 => "u8",
            Dtype::I32 => "i32",
            Dtype::I64 => "i64",
            Dtype::F32 => "f32",
            Dtype::F64 => "f64",
        }
    }
}

/// Row-major n-dimensional numeric array. Elements are stored big-endian so
/// the encoded form is byte-stable across hosts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    pub dtype: Dtype,
    pub shape: Vec<u64>,
    pub data: Vec<u8>,
}

impl NdArray {
    pub fn from_f64s(shape: Vec<u64>, values: &[f64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Self {
            dtype: Dtype::F64,
            shape,
            data,
        }
    }

    pub fn element_count(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Element at flat index, widened to f64.
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        let size = self.dtype.size();
        let start = index.checked_mul(size)?;
        let raw = self.data.get(start..start + size)?;
        Some(match self.dtype {
            Dtype::U8 => raw[0] as f64,
            Dtype::I32 => i32::from_be_bytes(raw.try_into().ok()?) as f64,
            Dtype::I64 => i64::from_be_bytes(raw.try_into().ok()?) as f64,
            Dtype::F32 => f32::from_be_bytes(raw.try_into().ok()?) as f64,
            Dtype::F64 => f64::from_bits(u64::from_be_bytes(raw.try_into().ok()?)),
        })
    }

    pub fn iter_f64(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.element_count() as usize).filter_map(|i| self.get_f64(i))
    }
}

/// A 2D raster with interleaved channels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Image2d {
    pub width: u64,
    pub height: u64,
    pub channels: u8,
    pub dtype: Dtype,
    pub data: Vec<u8>,
}

/// A 3D scalar volume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Volume3d {
    pub width: u64,
    pub height: u64,
    pub depth: u64,
    pub dtype: Dtype,
    pub data: Vec<u8>,
}

/// Plan record for a lazy sequence. Storage holds the plan, never a
/// realized list; the resolver materializes pages on demand.
///
/// `Map` plans may only name pure unary primitives so page materialization
/// stays synchronous.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LazySeqPlan {
    Range { start: i64, stop: i64, step: i64 },
    Map { operator: String, source: Box<LazySeqPlan> },
}

impl LazySeqPlan {
    pub fn len(&self) -> u64 {
        match self {
            LazySeqPlan::Range { start, stop, step } => {
                if *step > 0 && stop > start {
                    ((stop - start) as u64).div_ceil(*step as u64)
                } else if *step < 0 && stop < start {
                    ((start - stop) as u64).div_ceil(step.unsigned_abs())
                } else {
                    0
                }
            }
            LazySeqPlan::Map { source, .. } => source.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialize the element at `index`. `apply` runs the unary map
    /// operators of `Map` plans.
    pub fn element<F>(&self, index: u64, apply: &F) -> Result<VoxValue, crate::error::OpError>
    where
        F: Fn(&str, &VoxValue) -> Result<VoxValue, crate::error::OpError>,
    {
        match self {
            LazySeqPlan::Range { start, step, .. } => {
                if index >= self.len() {
                    return Err(crate::error::OpError::domain(format!(
                        "index {index} out of range for sequence of length {}",
                        self.len()
                    )));
                }
                Ok(VoxValue::Int(start + step * index as i64))
            }
            LazySeqPlan::Map { operator, source } => {
                let element = source.element(index, apply)?;
                apply(operator, &element)
            }
        }
    }
}

/// Fallback for values the codec has no concrete frame for: a type name
/// plus a JSON rendering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpaqueValue {
    pub type_name: String,
    pub body: serde_json::Value,
}

/// A value produced by an operator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum VoxValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(NdArray),
    Image(Image2d),
    Volume(Volume3d),
    Seq(Vec<VoxValue>),
    Map(BTreeMap<String, VoxValue>),
    Lazy(LazySeqPlan),
    Opaque(OpaqueValue),
}

impl VoxValue {
    /// Stable type name surfaced in descriptors (`vox_type`).
    pub fn vox_type(&self) -> &'static str {
        match self {
            VoxValue::Null => "null",
            VoxValue::Bool(_) => "boolean",
            VoxValue::Int(_) => "integer",
            VoxValue::Float(_) => "float",
            VoxValue::Str(_) => "string",
            VoxValue::Bytes(_) => "bytes",
            VoxValue::Array(_) => "array",
            VoxValue::Image(_) => "image",
            VoxValue::Volume(_) => "volume",
            VoxValue::Seq(_) => "sequence",
            VoxValue::Map(_) => "mapping",
            VoxValue::Lazy(_) => "lazy-sequence",
            VoxValue::Opaque(_) => "opaque",
        }
    }

    /// Numeric view with int → float widening, used by arithmetic
    /// primitives.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            VoxValue::Int(v) => Some(*v as f64),
            VoxValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            VoxValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            VoxValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            VoxValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            VoxValue::Null => false,
            VoxValue::Bool(b) => *b,
            VoxValue::Int(v) => *v != 0,
            VoxValue::Float(v) => *v != 0.0,
            VoxValue::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// JSON rendering used by `print` goals and descriptor summaries.
    /// Bulk payloads (bytes, arrays, rasters) render as a shape note, not
    /// their contents.
    pub fn to_display_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            VoxValue::Null => serde_json::Value::Null,
            VoxValue::Bool(b) => json!(b),
            VoxValue::Int(v) => json!(v),
            VoxValue::Float(v) => json!(v),
            VoxValue::Str(s) => json!(s),
            VoxValue::Bytes(b) => json!({ "bytes": b.len() }),
            VoxValue::Array(a) => json!({ "dtype": a.dtype.name(), "shape": a.shape }),
            VoxValue::Image(i) => {
                json!({ "width": i.width, "height": i.height, "channels": i.channels })
            }
            VoxValue::Volume(v) => {
                json!({ "width": v.width, "height": v.height, "depth": v.depth })
            }
            VoxValue::Seq(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_display_json()).collect())
            }
            VoxValue::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_display_json()))
                    .collect(),
            ),
            VoxValue::Lazy(plan) => json!({ "lazy": true, "length": plan.len() }),
            VoxValue::Opaque(o) => json!({ "type": o.type_name, "body": o.body }),
        }
    }
}
