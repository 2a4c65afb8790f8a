use serde::{Deserialize, Serialize};
use std::fmt;

/// Branch as reported by the VCS probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VcsBranch {
    Branch(String),
    /// HEAD points at a commit; carries the short id
    Detached(String),
    NotARepository,
    /// The repository exists but could not be read
    Unavailable,
    #[default]
    Unknown,
}

impl fmt::Display for VcsBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VcsBranch::Branch(name) => write!(f, "{}", name),
            VcsBranch::Detached(short) => write!(f, "DETACHED ({})", short),
            VcsBranch::NotARepository => write!(f, "Not a Git repo"),
            VcsBranch::Unavailable => write!(f, "Git N/A"),
            VcsBranch::Unknown => write!(f, "-"),
        }
    }
}

/// Working tree state as reported by the VCS probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VcsDirty {
    Clean,
    Dirty,
    #[default]
    Unknown,
}

impl VcsDirty {
    pub fn from_bool(dirty: bool) -> Self {
        if dirty {
            VcsDirty::Dirty
        } else {
            VcsDirty::Clean
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            VcsDirty::Clean => Some(false),
            VcsDirty::Dirty => Some(true),
            VcsDirty::Unknown => None,
        }
    }
}

/// Read-only VCS status for a project directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsInfo {
    pub branch: VcsBranch,
    pub dirty: VcsDirty,
}

impl VcsInfo {
    pub fn not_a_repository() -> Self {
        Self {
            branch: VcsBranch::NotARepository,
            dirty: VcsDirty::Unknown,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            branch: VcsBranch::Unavailable,
            dirty: VcsDirty::Unknown,
        }
    }
}
