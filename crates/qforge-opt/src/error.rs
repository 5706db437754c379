//! Error types for the quantization pipeline.

use qforge_analysis::PatternError;
use qforge_ir::IrError;

use crate::calibrate::{CalibrationError, DegenerateData};
use crate::config::ScaleAlgo;

/// Fatal errors. Any of these aborts the pipeline; the caller never gets a
/// partially quantized graph back.
#[derive(Debug, thiserror::Error)]
pub enum QuantizeError {
    /// Missing warmup batch, empty algorithm table or similar; raised before
    /// anything is mutated.
    #[error("invalid quantizer configuration: {0}")]
    Configuration(String),

    /// No finite scale exists for a tensor.
    #[error("cannot compute a scale for tensor '{tensor}': {reason}")]
    DegenerateInput {
        tensor: String,
        #[source]
        reason: DegenerateData,
    },

    /// The configured algorithm has no implementation.
    #[error("scale algorithm {algo} selected for {op_type}.{connection} is not implemented")]
    UnimplementedAlgorithm {
        op_type: String,
        connection: String,
        algo: ScaleAlgo,
    },

    /// A pass left the graph structurally inconsistent.
    #[error("pass '{pass}' broke a graph invariant: {source}")]
    StructuralInvariant {
        pass: String,
        #[source]
        source: IrError,
    },

    /// A built-in pattern failed to compile.
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// The executor reported failure during the warmup run.
    #[error("warmup run failed")]
    ExecutionFailed,

    /// Warmup data could not be loaded.
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

impl QuantizeError {
    pub(crate) fn structural(pass: &str, source: IrError) -> Self {
        Self::StructuralInvariant {
            pass: pass.to_string(),
            source,
        }
    }

    pub(crate) fn degenerate(tensor: &str, reason: DegenerateData) -> Self {
        Self::DegenerateInput {
            tensor: tensor.to_string(),
            reason,
        }
    }
}
