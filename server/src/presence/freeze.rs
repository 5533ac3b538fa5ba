use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Which part of the platform a freeze applies to.
///
/// On the wire a scope is an optional competition id: absent, empty or
/// `"global"` all mean the global scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum FreezeScope {
    Global,
    Competition(String),
}

impl From<Option<String>> for FreezeScope {
    fn from(value: Option<String>) -> Self {
        match value {
            None => Self::Global,
            Some(s) if s.is_empty() || s == "global" => Self::Global,
            Some(s) => Self::Competition(s),
        }
    }
}

impl From<FreezeScope> for Option<String> {
    fn from(scope: FreezeScope) -> Self {
        match scope {
            FreezeScope::Global => None,
            FreezeScope::Competition(id) => Some(id),
        }
    }
}

impl fmt::Display for FreezeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Competition(id) => write!(f, "competition:{}", id),
        }
    }
}

/// Freeze flags plus the orthogonal maintenance switch.
///
/// A per-competition entry, once set, overrides the global flag for that
/// competition, including an explicit `false` under a global freeze.
#[derive(Debug, Clone)]
pub struct FreezeState {
    global: bool,
    competitions: HashMap<String, bool>,
    enabled: bool,
}

impl Default for FreezeState {
    fn default() -> Self {
        Self {
            global: false,
            competitions: HashMap::new(),
            enabled: true,
        }
    }
}

impl FreezeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the frozen flag for a scope. Returns whether the value changed.
    pub fn set(&mut self, scope: &FreezeScope, frozen: bool) -> bool {
        match scope {
            FreezeScope::Global => std::mem::replace(&mut self.global, frozen) != frozen,
            FreezeScope::Competition(id) => {
                self.competitions.insert(id.clone(), frozen) != Some(frozen)
            }
        }
    }

    /// Effective frozen state for a scope.
    pub fn status(&self, scope: &FreezeScope) -> bool {
        match scope {
            FreezeScope::Global => self.global,
            FreezeScope::Competition(id) => {
                self.competitions.get(id).copied().unwrap_or(self.global)
            }
        }
    }

    pub fn global(&self) -> bool {
        self.global
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Flip maintenance mode. Returns whether the value changed.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.enabled, enabled) != enabled
    }
}
