//! Frame definitions
//!
//! A frame is a CAN identifier plus its signals. Multiplexed frames carry a
//! multiplexor signal whose value selects one of several sub-frames; the
//! frame-level signals are present in every sub-frame.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{parse_can_id, CodecError, CodecResult};
use crate::signal::Signal;

/// A sub-frame selected by a multiplexor value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubFrame {
    /// Multiplexor value selecting this sub-frame
    pub id: u64,
    /// Sub-frame name (the multiplex name of the parameters it carries)
    pub name: String,
    /// Signals present only in this sub-frame
    #[serde(default)]
    pub signals: Vec<Signal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl SubFrame {
    pub fn new(id: u64, name: impl Into<String>, signals: Vec<Signal>) -> Self {
        Self {
            id,
            name: name.into(),
            signals,
            comment: None,
        }
    }

    pub fn signal(&self, name: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.name == name)
    }
}

/// Definition of a CAN frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Frame name (e.g. "ParameterQuery")
    pub name: String,
    /// CAN identifier
    #[serde(deserialize_with = "deserialize_can_id")]
    pub id: u32,
    /// 29-bit identifier
    #[serde(default)]
    pub extended: bool,
    /// Payload length in bytes
    #[serde(default = "default_length")]
    pub length: u8,
    /// Signals present regardless of the multiplexor (includes the multiplexor itself)
    #[serde(default)]
    pub signals: Vec<Signal>,
    /// Name of the multiplexor signal within `signals`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplexer: Option<String>,
    /// Sub-frames keyed by multiplexor value
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub multiplexed: Vec<SubFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn default_length() -> u8 {
    8
}

fn deserialize_can_id<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdRepr {
        Number(u32),
        Text(String),
    }

    match IdRepr::deserialize(deserializer)? {
        IdRepr::Number(id) => Ok(id),
        IdRepr::Text(s) => parse_can_id(&s).map_err(serde::de::Error::custom),
    }
}

impl Frame {
    pub fn new(name: impl Into<String>, id: u32, extended: bool) -> Self {
        Self {
            name: name.into(),
            id,
            extended,
            length: 8,
            signals: Vec::new(),
            multiplexer: None,
            multiplexed: Vec::new(),
            comment: None,
        }
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signals.push(signal);
        self
    }

    /// Declare `signal` as the multiplexor and add it to the frame-level signals
    pub fn with_multiplexer(mut self, signal: Signal) -> Self {
        self.multiplexer = Some(signal.name.clone());
        self.signals.push(signal);
        self
    }

    pub fn with_sub_frame(mut self, sub_frame: SubFrame) -> Self {
        self.multiplexed.push(sub_frame);
        self
    }

    pub fn is_multiplexed(&self) -> bool {
        self.multiplexer.is_some()
    }

    /// The multiplexor signal, if this frame is multiplexed
    pub fn multiplexer_signal(&self) -> Option<&Signal> {
        let name = self.multiplexer.as_deref()?;
        self.signals.iter().find(|s| s.name == name)
    }

    /// Sub-frame by multiplexor value
    pub fn sub_frame(&self, mux: u64) -> CodecResult<&SubFrame> {
        self.multiplexed
            .iter()
            .find(|m| m.id == mux)
            .ok_or_else(|| CodecError::UnknownMultiplex {
                frame: self.name.clone(),
                value: mux,
            })
    }

    /// Sub-frame by name
    pub fn sub_frame_by_name(&self, name: &str) -> Option<&SubFrame> {
        self.multiplexed.iter().find(|m| m.name == name)
    }

    /// Frame-level signal by name
    pub fn common_signal(&self, name: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// All signals active when the multiplexor selects `mux`
    pub fn layout(&self, mux: Option<u64>) -> CodecResult<Vec<&Signal>> {
        let mut signals: Vec<&Signal> = self.signals.iter().collect();
        if let Some(mux) = mux {
            signals.extend(self.sub_frame(mux)?.signals.iter());
        }
        Ok(signals)
    }

    /// Signal by name in the layout selected by `mux`
    pub fn signal(&self, mux: Option<u64>, name: &str) -> CodecResult<&Signal> {
        self.layout(mux)?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CodecError::UnknownSignal {
                frame: self.name.clone(),
                signal: name.to_string(),
            })
    }

    /// Check one layout: signals stay inside the payload and do not overlap
    /// unless one of them is the multiplexor
    pub fn check_layout(&self, mux: Option<u64>) -> CodecResult<()> {
        let layout = self.layout(mux)?;
        let payload_bits = self.length as u16 * 8;
        let mut seen: Vec<(&Signal, u64)> = Vec::with_capacity(layout.len());

        for signal in layout {
            if signal.bit_length == 0 || signal.bit_length > 64 {
                return Err(CodecError::InvalidDefinition(format!(
                    "signal {} has bit length {}",
                    signal.name, signal.bit_length
                )));
            }
            if signal
                .bit_positions()
                .into_iter()
                .any(|b| b >= payload_bits)
            {
                return Err(CodecError::OutsidePayload {
                    frame: self.name.clone(),
                    signal: signal.name.clone(),
                    length: self.length,
                });
            }

            let mask = signal.occupancy();
            for (other, other_mask) in &seen {
                if other.name == signal.name {
                    return Err(CodecError::InvalidDefinition(format!(
                        "signal {} appears twice in frame {}",
                        signal.name, self.name
                    )));
                }
                let involves_mux = self.multiplexer.as_deref() == Some(signal.name.as_str())
                    || self.multiplexer.as_deref() == Some(other.name.as_str());
                if mask & other_mask != 0 && !involves_mux {
                    return Err(CodecError::Overlap {
                        frame: self.name.clone(),
                        first: other.name.clone(),
                        second: signal.name.clone(),
                    });
                }
            }
            seen.push((signal, mask));
        }
        Ok(())
    }

    /// Validate the whole frame: every layout, unique multiplexor values
    pub fn validate(&self) -> CodecResult<()> {
        if self.length > 8 {
            return Err(CodecError::InvalidDefinition(format!(
                "frame {} declares {} bytes, CAN allows at most 8",
                self.name, self.length
            )));
        }
        if let Some(name) = &self.multiplexer {
            if self.common_signal(name).is_none() {
                return Err(CodecError::InvalidDefinition(format!(
                    "frame {} names multiplexor {} but does not define it",
                    self.name, name
                )));
            }
        } else if !self.multiplexed.is_empty() {
            return Err(CodecError::InvalidDefinition(format!(
                "frame {} has sub-frames but no multiplexor",
                self.name
            )));
        }

        let mut ids: Vec<u64> = self.multiplexed.iter().map(|m| m.id).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(CodecError::InvalidDefinition(format!(
                "frame {} repeats a multiplexor value",
                self.name
            )));
        }

        if self.is_multiplexed() {
            for sub in &self.multiplexed {
                self.check_layout(Some(sub.id))?;
            }
        }
        self.check_layout(None)
    }
}
