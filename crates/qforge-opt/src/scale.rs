//! Per-tensor quantization scales and the fixed-point arithmetic that uses
//! them.
//!
//! A scale maps real values to the integer grid: `q = round(x * scale)`,
//! `x ≈ q / scale`. Unsigned tensors use the `[0, 255]` grid, signed tensors
//! `[-128, 127]`.

use std::collections::BTreeMap;
use std::fmt;

/// Whether a tensor is quantized onto the signed or the unsigned int8 grid.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum SignClass {
    Signed,
    Unsigned,
}

impl SignClass {
    /// Largest representable magnitude on this grid.
    pub fn int_max(self) -> f32 {
        match self {
            Self::Signed => 127.0,
            Self::Unsigned => 255.0,
        }
    }

    pub fn is_signed(self) -> bool {
        self == Self::Signed
    }

    /// Signed absorbs unsigned.
    pub fn widen(self, other: Self) -> Self {
        if self.is_signed() || other.is_signed() {
            Self::Signed
        } else {
            Self::Unsigned
        }
    }

    /// `self`, widened to signed if `values` contains a negative number.
    pub fn for_data(self, values: &[f32]) -> Self {
        if self == Self::Unsigned && values.iter().any(|&v| v < 0.0) {
            Self::Signed
        } else {
            self
        }
    }

    fn bounds(self) -> (f32, f32) {
        match self {
            Self::Signed => (-128.0, 127.0),
            Self::Unsigned => (0.0, 255.0),
        }
    }
}

impl fmt::Display for SignClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Signed => "signed",
            Self::Unsigned => "unsigned",
        })
    }
}

/// Scale and grid of one tensor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleEntry {
    pub sign: SignClass,
    pub scale: f32,
}

impl ScaleEntry {
    pub fn new(sign: SignClass, scale: f32) -> Self {
        Self { sign, scale }
    }

    pub fn signed(scale: f32) -> Self {
        Self::new(SignClass::Signed, scale)
    }

    pub fn unsigned(scale: f32) -> Self {
        Self::new(SignClass::Unsigned, scale)
    }
}

/// Tensor name to [`ScaleEntry`].
///
/// Built once by calibration and shared read-only with the rewrite passes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScaleTable {
    entries: BTreeMap<String, ScaleEntry>,
}

impl ScaleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tensor: impl Into<String>, entry: ScaleEntry) -> Option<ScaleEntry> {
        self.entries.insert(tensor.into(), entry)
    }

    pub fn get(&self, tensor: &str) -> Option<ScaleEntry> {
        self.entries.get(tensor).copied()
    }

    pub fn contains(&self, tensor: &str) -> bool {
        self.entries.contains_key(tensor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in tensor-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ScaleEntry)> {
        self.entries.iter().map(|(k, &v)| (k.as_str(), v))
    }

    /// Print the table to the log.
    pub fn log_summary(&self) {
        log::info!("Scale table ({} tensors):", self.entries.len());
        for (name, entry) in &self.entries {
            log::info!("  {}: scale={:.6}, {}", name, entry.scale, entry.sign);
        }
    }
}

impl<S: Into<String>> FromIterator<(S, ScaleEntry)> for ScaleTable {
    fn from_iter<I: IntoIterator<Item = (S, ScaleEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// `round(x * scale)` saturated to the grid of `sign`.
pub fn quantize_value(x: f32, scale: f32, sign: SignClass) -> i32 {
    let (lo, hi) = sign.bounds();
    (x * scale).round().clamp(lo, hi) as i32
}

pub fn dequantize_value(q: i32, scale: f32) -> f32 {
    q as f32 / scale
}

/// Quantize weights onto the signed grid.
pub fn quantize_weights(values: &[f32], scale: f32) -> Vec<i8> {
    values
        .iter()
        .map(|&w| quantize_value(w, scale, SignClass::Signed) as i8)
        .collect()
}

/// Quantize a bias into the int32 accumulator domain, whose scale is
/// `input_scale * weight_scale`.
pub fn quantize_bias(values: &[f32], accumulator_scale: f32) -> Vec<i32> {
    values
        .iter()
        .map(|&b| (b * accumulator_scale).round() as i32)
        .collect()
}
