//! Versioned parameter blobs keyed by architecture.
//!
//! Layout:
//!
//! ```text
//! b"PUWN" | u32 LE format version | u32 LE header length | JSON header | weights
//! ```
//!
//! The JSON header carries the format version and the [`ArchitectureKey`];
//! the weights are a full-precision burn record. Restoring compares the
//! stored key against the configured one before any weight is touched, then
//! checks every restored parameter shape against a freshly built network.

use std::path::Path;

use burn::module::{ModuleVisitor, ParamId};
use burn::prelude::*;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use phase_map::{Result, UnwrapError};
use serde::{Deserialize, Serialize};

use crate::config::{ArchitectureKey, UnwrapConfig};
use crate::model::network::{PhaseUNet, PhaseUNetRecord};

pub const BLOB_MAGIC: [u8; 4] = *b"PUWN";
pub const BLOB_FORMAT_VERSION: u32 = 1;

/// JSON header stored in front of the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobHeader {
    pub format_version: u32,
    pub architecture: ArchitectureKey,
}

/// Serialize `model` into a blob keyed by `config`'s architecture.
pub fn serialize_parameters<B: Backend>(model: &PhaseUNet<B>, config: &UnwrapConfig) -> Result<Vec<u8>> {
    config.validate()?;
    if model.head_kind() != config.head_kind() {
        return Err(UnwrapError::model_load(
            "head",
            format!("{:?}", config.head_kind()),
            format!("{:?}", model.head_kind()),
        ));
    }

    let header = BlobHeader {
        format_version: BLOB_FORMAT_VERSION,
        architecture: config.architecture_key(),
    };
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let weights = Recorder::<B>::record(&recorder, model.clone().into_record(), ())
        .map_err(|e| UnwrapError::model_load("weights", "serializable record", e))?;
    assemble_blob(&header, &weights)
}

/// Frame an already encoded header and weight record.
fn assemble_blob(header: &BlobHeader, weights: &[u8]) -> Result<Vec<u8>> {
    let header_json = serde_json::to_vec(header)
        .map_err(|e| UnwrapError::model_load("header", "serializable architecture key", e))?;
    let header_len = u32::try_from(header_json.len())
        .map_err(|_| UnwrapError::model_load("header", "at most u32::MAX bytes", header_json.len()))?;

    let mut blob = Vec::with_capacity(12 + header_json.len() + weights.len());
    blob.extend_from_slice(&BLOB_MAGIC);
    blob.extend_from_slice(&BLOB_FORMAT_VERSION.to_le_bytes());
    blob.extend_from_slice(&header_len.to_le_bytes());
    blob.extend_from_slice(&header_json);
    blob.extend_from_slice(weights);
    Ok(blob)
}

/// Dimensions of every float parameter, in visiting order.
#[derive(Default)]
struct ParamShapes(Vec<Vec<usize>>);

impl<B: Backend> ModuleVisitor<B> for ParamShapes {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.0.push(tensor.dims().to_vec());
    }
}

fn param_shapes<B: Backend>(model: &PhaseUNet<B>) -> Vec<Vec<usize>> {
    let mut shapes = ParamShapes::default();
    model.visit(&mut shapes);
    shapes.0
}

/// Fail unless `loaded` has exactly the parameter shapes of `expected`.
fn check_param_shapes(expected: &[Vec<usize>], loaded: &[Vec<usize>]) -> Result<()> {
    if expected.len() != loaded.len() {
        return Err(UnwrapError::model_load(
            "weights",
            format!("{} parameter tensors", expected.len()),
            format!("{} parameter tensors", loaded.len()),
        ));
    }
    match expected.iter().zip(loaded).position(|(a, b)| a != b) {
        Some(i) => Err(UnwrapError::model_load(
            format!("weights[{i}]"),
            format!("{:?}", expected[i]),
            format!("{:?}", loaded[i]),
        )),
        None => Ok(()),
    }
}

/// Split a blob into its header and weight bytes, checking magic and version.
pub fn read_header(blob: &[u8]) -> Result<(BlobHeader, &[u8])> {
    if blob.len() < 12 {
        return Err(UnwrapError::model_load(
            "blob",
            "at least 12 header bytes",
            format!("{} bytes", blob.len()),
        ));
    }
    let magic = &blob[..4];
    if magic != BLOB_MAGIC {
        return Err(UnwrapError::model_load(
            "magic",
            String::from_utf8_lossy(&BLOB_MAGIC),
            String::from_utf8_lossy(magic),
        ));
    }
    let version = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
    if version != BLOB_FORMAT_VERSION {
        return Err(UnwrapError::model_load("format_version", BLOB_FORMAT_VERSION, version));
    }
    let header_len = u32::from_le_bytes([blob[8], blob[9], blob[10], blob[11]]) as usize;
    let body = &blob[12..];
    if body.len() < header_len {
        return Err(UnwrapError::model_load(
            "header",
            format!("{header_len} bytes"),
            format!("{} bytes", body.len()),
        ));
    }
    let (header_json, weights) = body.split_at(header_len);
    let header: BlobHeader = serde_json::from_slice(header_json)
        .map_err(|e| UnwrapError::model_load("header", "valid JSON architecture key", e))?;
    if header.format_version != version {
        return Err(UnwrapError::model_load(
            "header.format_version",
            version,
            header.format_version,
        ));
    }
    Ok((header, weights))
}

/// Restore a network for `config` from a blob.
///
/// Fails with a model load error naming the first architecture field that
/// differs from `config`, or the first parameter whose stored shape differs
/// from the one `config` builds.
pub fn restore_parameters<B: Backend>(
    blob: &[u8],
    config: &UnwrapConfig,
    device: &B::Device,
) -> Result<PhaseUNet<B>> {
    let network = config.network()?;
    let (header, weights) = read_header(blob)?;

    let expected = config.architecture_key();
    if let Some((field, want, found)) = expected.first_mismatch(&header.architecture) {
        return Err(UnwrapError::model_load(field, want, found));
    }

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record: PhaseUNetRecord<B> = Recorder::<B>::load(&recorder, weights.to_vec(), device)
        .map_err(|e| UnwrapError::model_load("weights", "decodable record", e))?;

    let fresh = network.init::<B>(device);
    let want = param_shapes(&fresh);
    let model = fresh.load_record(record);
    check_param_shapes(&want, &param_shapes(&model))?;

    tracing::debug!(
        head = ?expected.head,
        params = want.len(),
        bytes = blob.len(),
        "Restored network parameters"
    );
    Ok(model)
}

/// Write a parameter blob to `path`.
pub fn save_parameters<B: Backend>(model: &PhaseUNet<B>, config: &UnwrapConfig, path: &Path) -> Result<()> {
    let blob = serialize_parameters(model, config)?;
    std::fs::write(path, blob)?;
    tracing::info!(path = %path.display(), "Saved parameter blob");
    Ok(())
}

/// Read a parameter blob from `path` and restore it for `config`.
pub fn load_parameters<B: Backend>(
    path: &Path,
    config: &UnwrapConfig,
    device: &B::Device,
) -> Result<PhaseUNet<B>> {
    let blob = std::fs::read(path)?;
    restore_parameters(&blob, config, device)
}
