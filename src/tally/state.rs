//! Tally data model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tally designation for a single mixer input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TallyTag {
    /// On air
    Pgm,
    /// Queued next
    Pvw,
    Off,
}

/// A mixer input as reported by vMix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDescriptor {
    /// 1-based input number
    pub number: u32,
    /// Operator-assigned title
    pub name: String,
    /// vMix input type (Capture, Colour, GT, ...)
    #[serde(rename = "type")]
    pub input_type: String,
}

impl InputDescriptor {
    pub fn new(number: u32, name: impl Into<String>, input_type: impl Into<String>) -> Self {
        Self {
            number,
            name: name.into(),
            input_type: input_type.into(),
        }
    }
}

/// Snapshot of mixer state. Replaced wholesale on every successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TallyState {
    /// Input currently on program (0 if none)
    pub program: u32,
    /// Input currently on preview (0 if none)
    pub preview: u32,
    /// All inputs keyed by number
    pub inputs: BTreeMap<u32, InputDescriptor>,
}

impl TallyState {
    pub fn new(program: u32, preview: u32, inputs: impl IntoIterator<Item = InputDescriptor>) -> Self {
        Self {
            program,
            preview,
            inputs: inputs.into_iter().map(|i| (i.number, i)).collect(),
        }
    }

    /// Tag for a single input. Program wins if an input is on both buses.
    pub fn tag(&self, number: u32) -> TallyTag {
        if number != 0 && number == self.program {
            TallyTag::Pgm
        } else if number != 0 && number == self.preview {
            TallyTag::Pvw
        } else {
            TallyTag::Off
        }
    }

    /// Tag for every listed input, plus program/preview even if unlisted.
    pub fn tally_map(&self) -> BTreeMap<u32, TallyTag> {
        self.inputs
            .keys()
            .copied()
            .chain([self.program, self.preview].into_iter().filter(|n| *n != 0))
            .map(|n| (n, self.tag(n)))
            .collect()
    }

    /// Input titles keyed by number
    pub fn input_names(&self) -> BTreeMap<u32, String> {
        self.inputs
            .iter()
            .map(|(n, input)| (*n, input.name.clone()))
            .collect()
    }

    pub fn program_input(&self) -> Option<&InputDescriptor> {
        self.inputs.get(&self.program)
    }

    pub fn preview_input(&self) -> Option<&InputDescriptor> {
        self.inputs.get(&self.preview)
    }

    /// The (program, preview) pair
    pub fn buses(&self) -> (u32, u32) {
        (self.program, self.preview)
    }
}
