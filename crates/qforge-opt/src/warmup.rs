//! Warmup data and the executor seam.
//!
//! The quantizer never runs operators itself: it hands the float graph and
//! a [`WarmupBatch`] to an [`Executor`] supplied by the host, which is
//! expected to leave every activation it computes in the [`Scope`].

use std::path::{Path, PathBuf};

use qforge_ir::{Graph, Scope, Tensor};

use crate::calibrate::CalibrationError;

/// A named input tensor fed to the executor.
#[derive(Clone, Debug, PartialEq)]
pub struct FeedTensor {
    pub name: String,
    pub tensor: Tensor,
}

/// Representative inputs for one warmup run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WarmupBatch {
    pub inputs: Vec<FeedTensor>,
    pub batch_size: usize,
}

impl WarmupBatch {
    pub fn new(batch_size: usize) -> Self {
        Self {
            inputs: Vec::new(),
            batch_size,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.inputs.push(FeedTensor {
            name: name.into(),
            tensor,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Load one input's samples from a directory of `.bin` files.
    ///
    /// Each file holds one sample as raw little-endian f32 values shaped
    /// `sample_dims`. Files are sorted by name and stacked along a new
    /// leading batch dimension.
    pub fn load_from_dir(
        dir: &Path,
        input_name: &str,
        sample_dims: &[usize],
    ) -> Result<Self, CalibrationError> {
        let mut bin_files: Vec<PathBuf> = Vec::new();

        let entries = std::fs::read_dir(dir).map_err(|e| CalibrationError::IoError {
            path: dir.to_path_buf(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| CalibrationError::IoError {
                path: dir.to_path_buf(),
                source: e,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "bin") {
                bin_files.push(path);
            }
        }
        bin_files.sort();

        if bin_files.is_empty() {
            return Err(CalibrationError::NoSamples(dir.to_path_buf()));
        }

        let sample_len: usize = sample_dims.iter().product();
        let mut data = Vec::with_capacity(sample_len * bin_files.len());
        for path in &bin_files {
            let bytes = std::fs::read(path).map_err(|e| CalibrationError::IoError {
                path: path.clone(),
                source: e,
            })?;
            if bytes.len() % 4 != 0 {
                return Err(CalibrationError::InvalidFileSize {
                    path: path.clone(),
                    size: bytes.len() as u64,
                });
            }
            let found = bytes.len() / 4;
            if found != sample_len {
                return Err(CalibrationError::SampleLength {
                    path: path.clone(),
                    expected: sample_len,
                    found,
                });
            }
            data.extend(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );
        }

        let batch_size = bin_files.len();
        let mut dims = Vec::with_capacity(sample_dims.len() + 1);
        dims.push(batch_size);
        dims.extend_from_slice(sample_dims);
        log::info!(
            "Loaded {batch_size} warmup sample(s) for '{input_name}' from {}",
            dir.display()
        );
        Ok(Self::new(batch_size).with_input(input_name, Tensor::from_f32(dims, data)))
    }
}

/// Runs inference on behalf of the quantizer.
pub trait Executor {
    /// Run `graph` on `inputs`, storing every computed activation in
    /// `scope` under its variable name and the fetched results in
    /// `outputs`. Returns `false` on failure.
    fn run(
        &mut self,
        graph: &Graph,
        scope: &mut Scope,
        inputs: &[FeedTensor],
        outputs: &mut Vec<Tensor>,
        batch_size: usize,
    ) -> bool;
}

/// Adapts a closure to [`Executor`].
pub struct FnExecutor<F>(pub F);

impl<F> Executor for FnExecutor<F>
where
    F: FnMut(&Graph, &mut Scope, &[FeedTensor], &mut Vec<Tensor>, usize) -> bool,
{
    fn run(
        &mut self,
        graph: &Graph,
        scope: &mut Scope,
        inputs: &[FeedTensor],
        outputs: &mut Vec<Tensor>,
        batch_size: usize,
    ) -> bool {
        (self.0)(graph, scope, inputs, outputs, batch_size)
    }
}
