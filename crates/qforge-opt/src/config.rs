//! Quantizer configuration: which scale algorithm applies to each
//! (operator type, connection) pair, which operator types are quantized,
//! the warmup batch and the histogram resolution.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use qforge_ir::OpDesc;

use crate::calibrate::{DEFAULT_NUM_BINS, NUM_QUANTIZED_BINS};
use crate::error::QuantizeError;
use crate::scale::SignClass;
use crate::warmup::WarmupBatch;

/// Scale computation algorithm for one connection.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum ScaleAlgo {
    /// Do not compute a scale.
    None,
    /// `int_max / max(|min|, |max|)`.
    Max,
    /// Per-output-channel maximum. Recognized but not implemented.
    MaxChannel,
    /// KL-divergence threshold search.
    Kl,
}

impl ScaleAlgo {
    /// Parse an algorithm name as written in host configuration.
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "max" | "minmax" => Some(Self::Max),
            "max_ch" | "max-ch" => Some(Self::MaxChannel),
            "kl" | "entropy" | "kl-divergence" => Some(Self::Kl),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Max => "MAX",
            Self::MaxChannel => "MAX_CH",
            Self::Kl => "KL",
        }
    }
}

impl fmt::Display for ScaleAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug)]
pub struct QuantizerConfig {
    rules: BTreeMap<String, BTreeMap<String, ScaleAlgo>>,
    enabled_op_types: BTreeSet<String>,
    warmup: Option<WarmupBatch>,
    num_bins: usize,
}

impl Default for QuantizerConfig {
    fn default() -> Self {
        use ScaleAlgo::*;
        let mut config = Self::empty();
        for (op, conn, algo) in [
            ("conv2d", "Input", Max),
            ("conv2d", "Filter", Kl),
            ("conv2d", "Bias", None),
            ("conv2d", "ResidualData", Max),
            ("conv2d", "Output", Max),
            ("fc", "Input", Max),
            ("fc", "W", Max),
            ("fc", "Bias", None),
            ("fc", "ResidualData", Max),
            ("fc", "Out", Max),
            ("pool2d", "X", Max),
            ("pool2d", "Out", Max),
        ] {
            config.set_rule(op, conn, algo);
        }
        for op in ["conv2d", "fc", "pool2d"] {
            config.enable_op_type(op);
        }
        config
    }
}

impl QuantizerConfig {
    /// The default rule table, with conv2d, fc and pool2d enabled and no
    /// warmup batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// No rules and no enabled operator types.
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
            enabled_op_types: BTreeSet::new(),
            warmup: None,
            num_bins: DEFAULT_NUM_BINS,
        }
    }

    pub fn set_rule(
        &mut self,
        op_type: impl Into<String>,
        connection: impl Into<String>,
        algo: ScaleAlgo,
    ) -> &mut Self {
        self.rules
            .entry(op_type.into())
            .or_default()
            .insert(connection.into(), algo);
        self
    }

    /// Like [`set_rule`](Self::set_rule) with the algorithm given by name.
    pub fn set_rule_by_name(
        &mut self,
        op_type: &str,
        connection: &str,
        algo: &str,
    ) -> Result<&mut Self, QuantizeError> {
        let algo = ScaleAlgo::from_str_name(algo).ok_or_else(|| {
            QuantizeError::Configuration(format!(
                "unknown scale algorithm '{algo}' for {op_type}.{connection}"
            ))
        })?;
        Ok(self.set_rule(op_type, connection, algo))
    }

    /// Algorithm for a connection. Connections without a rule use
    /// [`ScaleAlgo::Max`].
    pub fn scale_algo(&self, op_type: &str, connection: &str) -> ScaleAlgo {
        self.rules
            .get(op_type)
            .and_then(|conns| conns.get(connection))
            .copied()
            .unwrap_or(ScaleAlgo::Max)
    }

    pub fn has_rules(&self) -> bool {
        self.rules.values().any(|conns| !conns.is_empty())
    }

    pub fn enable_op_type(&mut self, op_type: impl Into<String>) -> &mut Self {
        self.enabled_op_types.insert(op_type.into());
        self
    }

    pub fn disable_op_type(&mut self, op_type: &str) -> &mut Self {
        self.enabled_op_types.remove(op_type);
        self
    }

    pub fn is_enabled(&self, op_type: &str) -> bool {
        self.enabled_op_types.contains(op_type)
    }

    pub fn enabled_op_types(&self) -> impl Iterator<Item = &str> {
        self.enabled_op_types.iter().map(String::as_str)
    }

    pub fn with_warmup(mut self, batch: WarmupBatch) -> Self {
        self.warmup = Some(batch);
        self
    }

    pub fn set_warmup(&mut self, batch: WarmupBatch) -> &mut Self {
        self.warmup = Some(batch);
        self
    }

    pub fn warmup(&self) -> Option<&WarmupBatch> {
        self.warmup.as_ref()
    }

    pub fn with_num_bins(mut self, num_bins: usize) -> Self {
        self.num_bins = num_bins;
        self
    }

    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    /// Check everything calibration needs is present.
    pub fn validate(&self) -> Result<(), QuantizeError> {
        let warmup = self
            .warmup
            .as_ref()
            .ok_or_else(|| QuantizeError::Configuration("no warmup batch provided".into()))?;
        if warmup.is_empty() {
            return Err(QuantizeError::Configuration(
                "warmup batch has no input tensors".into(),
            ));
        }
        if !self.has_rules() {
            return Err(QuantizeError::Configuration(
                "scale algorithm table is empty".into(),
            ));
        }
        if self.enabled_op_types.is_empty() {
            return Err(QuantizeError::Configuration(
                "no operator types enabled for quantization".into(),
            ));
        }
        if self.num_bins <= NUM_QUANTIZED_BINS {
            return Err(QuantizeError::Configuration(format!(
                "histogram needs more than {NUM_QUANTIZED_BINS} bins, got {}",
                self.num_bins
            )));
        }
        Ok(())
    }
}

/// Sign class a connection is declared with before looking at data.
///
/// conv2d/fc inputs and pool2d tensors are unsigned unless the operator
/// says `is_negative_input`; conv2d/fc outputs are unsigned only when a
/// ReLU is fused in; everything else is signed.
pub fn declared_sign(op: &OpDesc, connection: &str) -> SignClass {
    let flag = |name: &str| op.attr_bool(name).unwrap_or(false);
    let unsigned_unless = |negative: bool| {
        if negative {
            SignClass::Signed
        } else {
            SignClass::Unsigned
        }
    };
    match (op.op_type.as_str(), connection) {
        ("conv2d" | "fc", "Input") | ("pool2d", "X" | "Out") => {
            unsigned_unless(flag("is_negative_input"))
        }
        ("conv2d", "Output") | ("fc", "Out") => unsigned_unless(!flag("fuse_relu")),
        _ => SignClass::Signed,
    }
}
