//! CAN matrix - the container for frame definitions
//!
//! Matrix files are YAML or JSON. DBC/SYM/KCD conversion happens outside
//! this crate; the on-disk shape is:
//!
//! ```yaml
//! meta:
//!   name: Inverter
//!   version: "1.2"
//! frames:
//!   - name: ParameterQuery
//!     id: 0x1FF00
//!     extended: true
//!     multiplexer: MUX
//!     signals:
//!       - { name: MUX, start_bit: 0, length: 8 }
//!     multiplexed:
//!       - id: 3
//!         name: Frequency
//!         signals:
//!           - { name: FrequencyReference, start_bit: 16, length: 16, factor: 0.1, unit: Hz }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};
use crate::frame::Frame;

/// Metadata about the matrix
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MatrixFile {
    #[serde(default)]
    meta: MatrixMeta,
    #[serde(default)]
    frames: Vec<Frame>,
}

/// A validated set of frame definitions with lookup by name and id
#[derive(Debug, Clone, Default)]
pub struct CanMatrix {
    meta: MatrixMeta,
    frames: Vec<Frame>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<(u32, bool), usize>,
}

impl CanMatrix {
    /// Create an empty matrix
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a matrix from frames, validating every frame
    pub fn from_frames(meta: MatrixMeta, frames: Vec<Frame>) -> CodecResult<Self> {
        let mut matrix = Self {
            meta,
            ..Self::default()
        };
        for frame in frames {
            matrix.add_frame(frame)?;
        }
        Ok(matrix)
    }

    /// Load from a file, choosing the format from the extension
    ///
    /// `.json` is parsed as JSON, everything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> CodecResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let matrix = if is_json {
            Self::from_json(&content)?
        } else {
            Self::from_yaml(&content)?
        };
        tracing::debug!(
            path = %path.display(),
            frames = matrix.frames.len(),
            "Loaded CAN matrix"
        );
        Ok(matrix)
    }

    /// Load from a YAML string
    pub fn from_yaml(yaml: &str) -> CodecResult<Self> {
        let file: MatrixFile = serde_yaml::from_str(yaml)?;
        Self::from_frames(file.meta, file.frames)
    }

    /// Load from a JSON string
    pub fn from_json(json: &str) -> CodecResult<Self> {
        let file: MatrixFile = serde_json::from_str(json)?;
        Self::from_frames(file.meta, file.frames)
    }

    /// Add a frame; names and identifiers must be unique
    pub fn add_frame(&mut self, frame: Frame) -> CodecResult<()> {
        frame.validate()?;
        if self.by_name.contains_key(&frame.name) {
            return Err(CodecError::InvalidDefinition(format!(
                "frame {} defined twice",
                frame.name
            )));
        }
        let key = (frame.id, frame.extended);
        if self.by_id.contains_key(&key) {
            return Err(CodecError::InvalidDefinition(format!(
                "frame {} reuses CAN id {}",
                frame.name,
                crate::error::format_can_id(frame.id, frame.extended)
            )));
        }
        let index = self.frames.len();
        self.by_name.insert(frame.name.clone(), index);
        self.by_id.insert(key, index);
        self.frames.push(frame);
        Ok(())
    }

    pub fn meta(&self) -> &MatrixMeta {
        &self.meta
    }

    /// Frames in definition order
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frame by name
    pub fn frame(&self, name: &str) -> CodecResult<&Frame> {
        self.by_name
            .get(name)
            .map(|&i| &self.frames[i])
            .ok_or_else(|| CodecError::UnknownFrame(name.to_string()))
    }

    /// Frame by name, `None` when absent
    pub fn find_frame(&self, name: &str) -> Option<&Frame> {
        self.by_name.get(name).map(|&i| &self.frames[i])
    }

    /// Frame by CAN identifier
    pub fn frame_by_id(&self, id: u32, extended: bool) -> Option<&Frame> {
        self.by_id.get(&(id, extended)).map(|&i| &self.frames[i])
    }

    /// Mutable frame by name, used when rewriting addressing bytes
    pub fn frame_mut(&mut self, name: &str) -> Option<&mut Frame> {
        let index = *self.by_name.get(name)?;
        self.frames.get_mut(index)
    }

    /// Change a frame's identifier, keeping the id index consistent
    pub fn set_frame_id(&mut self, name: &str, id: u32) -> CodecResult<()> {
        let index = *self
            .by_name
            .get(name)
            .ok_or_else(|| CodecError::UnknownFrame(name.to_string()))?;
        let extended = self.frames[index].extended;
        let old = (self.frames[index].id, extended);
        if old.0 == id {
            return Ok(());
        }
        if self.by_id.contains_key(&(id, extended)) {
            return Err(CodecError::InvalidDefinition(format!(
                "frame {} would reuse CAN id {}",
                name,
                crate::error::format_can_id(id, extended)
            )));
        }
        self.by_id.remove(&old);
        self.by_id.insert((id, extended), index);
        self.frames[index].id = id;
        Ok(())
    }
}
