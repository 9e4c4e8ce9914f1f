//! Core data model.
//!
//! A work item is one unit of processing (a subject/timepoint pair). It
//! belongs to exactly one group, carries an in-progress claim flag, and one
//! completion flag per processing stage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Batch group a work item belongs to. Assigned once by the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(pub u32);

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GroupKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u32>()
            .map(GroupKey)
            .map_err(|e| Error::Config(format!("invalid group key '{s}': {e}")))
    }
}

/// Full composite key of one record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemRef {
    pub group_key: GroupKey,
    pub item_key: String,
}

impl ItemRef {
    pub fn new(group_key: GroupKey, item_key: impl Into<String>) -> Self {
        Self {
            group_key,
            item_key: item_key.into(),
        }
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_key, self.item_key)
    }
}

// ---------------------------------------------------------------------------
// Stages and flags
// ---------------------------------------------------------------------------

/// Processing stages tracked per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Segmented,
    Parcellated,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Segmented, Stage::Parcellated];

    /// Stage that must be complete on every item of a group before this
    /// stage may be dispatched for that group.
    pub fn prerequisite(self) -> Option<Stage> {
        match self {
            Stage::Segmented => None,
            Stage::Parcellated => Some(Stage::Segmented),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Segmented => "segmented",
            Stage::Parcellated => "parcellated",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "segmented" | "segmentation" | "seg" => Ok(Stage::Segmented),
            "parcellated" | "parcellation" | "parc" => Ok(Stage::Parcellated),
            other => Err(Error::Config(format!(
                "unknown stage '{other}' (expected segmented or parcellated)"
            ))),
        }
    }
}

/// A boolean attribute of a work item that can be updated or filtered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    InProgress,
    Stage(Stage),
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::InProgress => f.write_str("in_progress"),
            Flag::Stage(stage) => write!(f, "{stage}"),
        }
    }
}

/// Completion flags, one per [`Stage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFlags {
    pub segmented: bool,
    pub parcellated: bool,
}

impl StageFlags {
    pub fn get(&self, stage: Stage) -> bool {
        match stage {
            Stage::Segmented => self.segmented,
            Stage::Parcellated => self.parcellated,
        }
    }

    pub fn set(&mut self, stage: Stage, value: bool) {
        match stage {
            Stage::Segmented => self.segmented = value,
            Stage::Parcellated => self.parcellated = value,
        }
    }
}

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// One tracked unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub group_key: GroupKey,
    pub item_key: String,
    /// True while a worker holds a claim on this item.
    pub in_progress: bool,
    pub stages: StageFlags,
}

impl WorkItem {
    /// A fresh, unclaimed item with every stage incomplete.
    pub fn new(group_key: GroupKey, item_key: impl Into<String>) -> Self {
        Self {
            group_key,
            item_key: item_key.into(),
            in_progress: false,
            stages: StageFlags::default(),
        }
    }

    pub fn key(&self) -> ItemRef {
        ItemRef::new(self.group_key, self.item_key.clone())
    }

    pub fn flag(&self, flag: Flag) -> bool {
        match flag {
            Flag::InProgress => self.in_progress,
            Flag::Stage(stage) => self.stages.get(stage),
        }
    }

    pub fn set_flag(&mut self, flag: Flag, value: bool) {
        match flag {
            Flag::InProgress => self.in_progress = value,
            Flag::Stage(stage) => self.stages.set(stage, value),
        }
    }
}

// ---------------------------------------------------------------------------
// Scan queries
// ---------------------------------------------------------------------------

/// Which attributes a scan returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Projection {
    /// Group and item key.
    #[default]
    Keys,
    /// Group key only; `ScanRow::item_key` is `None`.
    GroupKey,
}

/// A conjunctive filter over one group (optional) and any number of flags.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanQuery {
    pub group: Option<GroupKey>,
    pub conditions: Vec<(Flag, bool)>,
    pub projection: Projection,
}

impl ScanQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_group(mut self, group: GroupKey) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with(mut self, flag: Flag, value: bool) -> Self {
        self.conditions.push((flag, value));
        self
    }

    pub fn project(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    /// Does `item` satisfy the group and every flag condition?
    pub fn matches(&self, item: &WorkItem) -> bool {
        if self.group.is_some_and(|g| g != item.group_key) {
            return false;
        }
        self.conditions
            .iter()
            .all(|&(flag, value)| item.flag(flag) == value)
    }

    /// Project a matching item into a result row.
    pub fn row(&self, item: &WorkItem) -> ScanRow {
        ScanRow {
            group_key: item.group_key,
            item_key: match self.projection {
                Projection::Keys => Some(item.item_key.clone()),
                Projection::GroupKey => None,
            },
        }
    }
}

/// One scan result.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScanRow {
    pub group_key: GroupKey,
    pub item_key: Option<String>,
}

impl ScanRow {
    /// The full composite key, if the projection included the item key.
    pub fn item_ref(&self) -> Option<ItemRef> {
        self.item_key
            .as_ref()
            .map(|key| ItemRef::new(self.group_key, key.clone()))
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Which items or groups a dispatch or worker run considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// Only items still needing the stage.
    #[default]
    Eligible,
    /// Everything, regardless of flags.
    All,
}

/// Per-item predicate for items that still need `stage`.
///
/// Stages without a prerequisite need `in_progress = false` and the stage
/// flag false. Stages with a prerequisite need the prerequisite flag true and
/// the stage flag false; in-progress items are only excluded when
/// `exclude_in_progress_when_ready` is set.
pub fn eligible_item_query(stage: Stage, exclude_in_progress_when_ready: bool) -> ScanQuery {
    match stage.prerequisite() {
        None => ScanQuery::all()
            .with(Flag::InProgress, false)
            .with(Flag::Stage(stage), false),
        Some(prerequisite) => {
            let query = ScanQuery::all()
                .with(Flag::Stage(prerequisite), true)
                .with(Flag::Stage(stage), false);
            if exclude_in_progress_when_ready {
                query.with(Flag::InProgress, false)
            } else {
                query
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Claim lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of one item within a worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    /// Not claimed by this worker.
    Idle,
    /// `in_progress` written true; stage running.
    Claimed,
    /// Stage flag set, claim released.
    Done,
    /// Stage failed, claim released, stage flag untouched.
    Failed,
}

impl ClaimState {
    pub fn can_transition_to(self, to: ClaimState) -> bool {
        use ClaimState::*;
        matches!(
            (self, to),
            (Idle, Claimed) | (Claimed, Done) | (Claimed, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ClaimState::Done | ClaimState::Failed)
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClaimState::Idle => "idle",
            ClaimState::Claimed => "claimed",
            ClaimState::Done => "done",
            ClaimState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}
