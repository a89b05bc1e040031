//! Annotation workflow state machine.
//!
//! Every direct annotation row moves through four states and every expanded
//! annotation row through two. A stage selects only rows in its input state
//! and moves them to its output state, so re-running a stage over rows that
//! are already past its gate selects nothing.
//!
//! ```text
//! direct:   direct_annotation_done -> isa_closure_done -> mapping_done -> indexing_done
//! expanded: pending_index -> indexed
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Workflow status of a direct annotation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectStatus {
    /// Recorded by the tagging stage, not yet expanded.
    DirectAnnotationDone,
    /// Is-a closure expansion emitted.
    IsaClosureDone,
    /// Mapping expansion emitted.
    MappingDone,
    /// Scored into the aggregated index. Terminal.
    IndexingDone,
}

impl DirectStatus {
    /// All states in lifecycle order.
    pub const ALL: [DirectStatus; 4] = [
        DirectStatus::DirectAnnotationDone,
        DirectStatus::IsaClosureDone,
        DirectStatus::MappingDone,
        DirectStatus::IndexingDone,
    ];

    /// Successor state, or `None` for the terminal state.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::DirectAnnotationDone => Some(Self::IsaClosureDone),
            Self::IsaClosureDone => Some(Self::MappingDone),
            Self::MappingDone => Some(Self::IndexingDone),
            Self::IndexingDone => None,
        }
    }

    /// Move this row through `stage`.
    ///
    /// Fails with [`Error::InvalidTransition`] if the row is not in the
    /// stage's input state.
    pub fn advance(self, stage: Stage) -> Result<Self> {
        if self == stage.input() {
            Ok(stage.output())
        } else {
            Err(Error::InvalidTransition {
                from: self.as_str().to_string(),
                stage: stage.as_str().to_string(),
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectAnnotationDone => "direct_annotation_done",
            Self::IsaClosureDone => "isa_closure_done",
            Self::MappingDone => "mapping_done",
            Self::IndexingDone => "indexing_done",
        }
    }
}

impl std::fmt::Display for DirectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DirectStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "direct_annotation_done" => Ok(Self::DirectAnnotationDone),
            "isa_closure_done" => Ok(Self::IsaClosureDone),
            "mapping_done" => Ok(Self::MappingDone),
            "indexing_done" => Ok(Self::IndexingDone),
            _ => Err(format!("Invalid direct annotation status: {}", s)),
        }
    }
}

/// Workflow status of an expanded annotation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpandedStatus {
    /// Emitted by an expander, waiting for aggregation.
    PendingIndex,
    /// Scored into the aggregated index. Terminal.
    Indexed,
}

impl ExpandedStatus {
    pub const ALL: [ExpandedStatus; 2] = [ExpandedStatus::PendingIndex, ExpandedStatus::Indexed];

    pub fn next(self) -> Option<Self> {
        match self {
            Self::PendingIndex => Some(Self::Indexed),
            Self::Indexed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingIndex => "pending_index",
            Self::Indexed => "indexed",
        }
    }
}

impl std::fmt::Display for ExpandedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExpandedStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending_index" => Ok(Self::PendingIndex),
            "indexed" => Ok(Self::Indexed),
            _ => Err(format!("Invalid expanded annotation status: {}", s)),
        }
    }
}

/// A pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    IsaClosure,
    Mapping,
    Aggregation,
}

impl Stage {
    /// Stages in the order they must run for a resource.
    pub const ORDER: [Stage; 3] = [Stage::IsaClosure, Stage::Mapping, Stage::Aggregation];

    /// Direct annotation state this stage consumes.
    pub fn input(self) -> DirectStatus {
        match self {
            Self::IsaClosure => DirectStatus::DirectAnnotationDone,
            Self::Mapping => DirectStatus::IsaClosureDone,
            Self::Aggregation => DirectStatus::MappingDone,
        }
    }

    /// Direct annotation state this stage leaves consumed rows in.
    pub fn output(self) -> DirectStatus {
        match self {
            Self::IsaClosure => DirectStatus::IsaClosureDone,
            Self::Mapping => DirectStatus::MappingDone,
            Self::Aggregation => DirectStatus::IndexingDone,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::IsaClosure => "isa_closure",
            Self::Mapping => "mapping",
            Self::Aggregation => "aggregation",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
