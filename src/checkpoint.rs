//! Versioned binary snapshots of a training run.
//!
//! File layout:
//! - magic bytes `LZGANCK1` (8)
//! - architecture version, `u32` little-endian
//! - payload length, `u64` little-endian
//! - payload: `bincode`-encoded [`Checkpoint`]
//!
//! Loading a snapshot written for a different architecture version fails with
//! [`Error::Checkpoint`] instead of silently reinterpreting weights.

use crate::gan::{GanConfig, TrainState};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MAGIC: [u8; 8] = *b"LZGANCK1";
const HEADER_LEN: usize = 8 + 4 + 8;

/// Bumped whenever the generator/discriminator parameter layout changes.
pub const ARCHITECTURE_VERSION: u32 = 1;

/// Everything needed to continue a run: config, both models, both optimizers, and the step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub architecture_version: u32,
    pub config: GanConfig,
    pub state: TrainState,
}

impl Checkpoint {
    pub fn new(config: &GanConfig, state: &TrainState) -> Self {
        Self {
            architecture_version: ARCHITECTURE_VERSION,
            config: config.clone(),
            state: state.clone(),
        }
    }

    pub fn step(&self) -> usize {
        self.state.step
    }

    pub fn into_state(self) -> TrainState {
        self.state
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::Checkpoint(format!("bincode serialization failed: {e}")))?;
        let mut data = Vec::with_capacity(HEADER_LEN + payload.len());
        data.extend_from_slice(&MAGIC);
        data.extend_from_slice(&self.architecture_version.to_le_bytes());
        data.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        data.extend_from_slice(&payload);
        Ok(data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Checkpoint("checkpoint too small".to_string()));
        }
        if data[..8] != MAGIC {
            return Err(Error::Checkpoint("invalid checkpoint magic bytes".to_string()));
        }
        let version = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        if version != ARCHITECTURE_VERSION {
            return Err(Error::Checkpoint(format!(
                "unsupported architecture version {version} (expected {ARCHITECTURE_VERSION})"
            )));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&data[12..HEADER_LEN]);
        let len = u64::from_le_bytes(len_bytes) as usize;
        let payload = &data[HEADER_LEN..];
        if payload.len() != len {
            return Err(Error::Checkpoint(format!(
                "payload length mismatch: header={len}, actual={}",
                payload.len()
            )));
        }

        let ck: Checkpoint = bincode::deserialize(payload)
            .map_err(|e| Error::Checkpoint(format!("bincode deserialization failed: {e}")))?;
        if ck.architecture_version != version {
            return Err(Error::Checkpoint("header and payload versions disagree".to_string()));
        }
        ck.config.validate()?;
        if ck.state.generator.config != ck.config.generator
            || ck.state.discriminator.config != ck.config.discriminator
        {
            return Err(Error::Checkpoint("model configs disagree with the run config".to_string()));
        }
        ck.state
            .generator
            .check_shapes()
            .and_then(|()| ck.state.discriminator.check_shapes())
            .map_err(|e| Error::Checkpoint(format!("stored weights: {e}")))?;
        Ok(ck)
    }

    /// Write atomically (temp file, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.to_bytes()?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }
}

fn file_name(step: usize) -> String {
    format!("step_{step:08}.ckpt")
}

/// Save `state` as `dir/step_XXXXXXXX.ckpt` and return the path.
pub fn save_in_dir(dir: &Path, config: &GanConfig, state: &TrainState) -> Result<PathBuf> {
    let path = dir.join(file_name(state.step));
    Checkpoint::new(config, state).save(&path)?;
    Ok(path)
}

/// The checkpoint in `dir` with the highest step, if any.
pub fn latest_in_dir(dir: &Path) -> Result<Option<PathBuf>> {
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let step = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("step_"))
            .and_then(|n| n.strip_suffix(".ckpt"))
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(step) = step {
            if best.as_ref().map_or(true, |(s, _)| step > *s) {
                best = Some((step, path));
            }
        }
    }
    Ok(best.map(|(_, p)| p))
}
