//! Change suppression between fetched snapshots and subscribers.

use std::collections::BTreeMap;

use super::state::{InputDescriptor, TallyState};

/// Something subscribers need to hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publication {
    /// The set of inputs (numbers, titles or types) changed
    InputList(TallyState),
    /// Program and/or preview changed
    Tally(TallyState),
}

/// Remembers what was last published and only reports differences.
#[derive(Debug, Default)]
pub struct TallyPublisher {
    last_buses: Option<(u32, u32)>,
    last_inputs: Option<BTreeMap<u32, InputDescriptor>>,
    current: Option<TallyState>,
}

impl TallyPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `state` against the cache.
    ///
    /// An input list change is reported before the tally change so that
    /// consumers can resolve names for the new program/preview.
    pub fn apply(&mut self, state: TallyState) -> Vec<Publication> {
        let mut out = Vec::new();

        // Inputs are keyed by number, so map equality is order-independent
        if self.last_inputs.as_ref() != Some(&state.inputs) {
            self.last_inputs = Some(state.inputs.clone());
            out.push(Publication::InputList(state.clone()));
        }

        if self.last_buses != Some(state.buses()) {
            self.last_buses = Some(state.buses());
            out.push(Publication::Tally(state.clone()));
        }

        if !out.is_empty() {
            self.current = Some(state);
        }
        out
    }

    /// Last published snapshot
    pub fn current(&self) -> Option<&TallyState> {
        self.current.as_ref()
    }

    /// Forget the cache so the next snapshot is published in full.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
