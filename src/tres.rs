//! Trackable resources (TRES).
//!
//! A TRES is a generic resource axis (CPU, memory, node, ...) indexed by a
//! small integer id. Limits over several resources are stored as fixed-length
//! arrays indexed by [`TresId`]; the persistent external format is a
//! string-encoded vector (`"1=200,2=50"`) parsed once at load time against a
//! [`TresDictionary`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Error, Result};

/// Number of tracked resource axes.
pub const TRES_COUNT: usize = 4;

/// Resource axis identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TresId {
    Cpu,
    Mem,
    Energy,
    Node,
}

impl TresId {
    /// All axes, in array order.
    pub const ALL: [TresId; TRES_COUNT] = [TresId::Cpu, TresId::Mem, TresId::Energy, TresId::Node];

    pub(crate) fn index(self) -> usize {
        match self {
            TresId::Cpu => 0,
            TresId::Mem => 1,
            TresId::Energy => 2,
            TresId::Node => 3,
        }
    }

    /// Human-readable label used in diagnostics.
    pub fn label(self) -> &'static str {
        match self {
            TresId::Cpu => "cpu",
            TresId::Mem => "mem",
            TresId::Energy => "energy",
            TresId::Node => "node",
        }
    }
}

/// Per-resource counts or limits; `None` means the slot is disabled/absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TresCounts([Option<u64>; TRES_COUNT]);

impl TresCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: TresId) -> Option<u64> {
        self.0[id.index()]
    }

    pub fn set(&mut self, id: TresId, value: Option<u64>) {
        self.0[id.index()] = value;
    }

    pub fn with(mut self, id: TresId, value: u64) -> Self {
        self.set(id, Some(value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    /// Parse the string-encoded vector format, e.g. `"1=200,2=50"`.
    ///
    /// Numeric ids not present in the dictionary are skipped with a
    /// diagnostic; malformed tokens are an error.
    pub fn parse(encoded: &str, dict: &TresDictionary) -> Result<Self> {
        let mut counts = Self::default();
        for token in encoded.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (id_str, count_str) = token
                .split_once('=')
                .ok_or_else(|| Error::validation(format!("malformed tres token '{}'", token)))?;
            let numeric: u32 = id_str
                .parse()
                .map_err(|_| Error::validation(format!("bad tres id in '{}'", token)))?;
            let count: u64 = count_str
                .parse()
                .map_err(|_| Error::validation(format!("bad tres count in '{}'", token)))?;
            match dict.resolve(numeric) {
                Some(id) => counts.set(id, Some(count)),
                None => debug!("unknown tres id {} in '{}', skipping", numeric, encoded),
            }
        }
        Ok(counts)
    }
}

/// Maps the persistent numeric resource ids onto [`TresId`] slots.
#[derive(Debug, Clone)]
pub struct TresDictionary {
    by_numeric: HashMap<u32, TresId>,
}

impl Default for TresDictionary {
    fn default() -> Self {
        let mut by_numeric = HashMap::new();
        by_numeric.insert(1, TresId::Cpu);
        by_numeric.insert(2, TresId::Mem);
        by_numeric.insert(3, TresId::Energy);
        by_numeric.insert(4, TresId::Node);
        Self { by_numeric }
    }
}

impl TresDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or remap a numeric id.
    pub fn register(&mut self, numeric: u32, id: TresId) {
        self.by_numeric.insert(numeric, id);
    }

    pub fn resolve(&self, numeric: u32) -> Option<TresId> {
        self.by_numeric.get(&numeric).copied()
    }
}
