//! Release revisions and their status state machine

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chart::Chart;
use crate::error::{CoreError, Result};
use crate::hook::Hook;
use crate::values::Values;

/// One revision of a named release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    /// Release name, stable across revisions
    pub name: String,

    /// Kubernetes namespace
    pub namespace: String,

    /// Revision number, starting at 1
    pub version: u32,

    pub info: Info,

    /// Chart at deploy time
    pub chart: Chart,

    /// Values supplied for this revision
    #[serde(default)]
    pub config: Values,

    /// Rendered manifest, ordered, without hooks
    #[serde(default)]
    pub manifest: String,

    #[serde(default)]
    pub hooks: Vec<Hook>,

    /// Custom labels; system labels are added by the store
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Timestamps and status of a revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    pub first_deployed: DateTime<Utc>,
    pub last_deployed: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,

    #[serde(default)]
    pub description: String,

    pub status: Status,

    /// Rendered notes document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Info {
    pub fn new(status: Status, now: DateTime<Utc>) -> Self {
        Self {
            first_deployed: now,
            last_deployed: now,
            deleted: None,
            description: String::new(),
            status,
            notes: None,
        }
    }
}

/// Release status
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    #[default]
    Unknown,
    Deployed,
    Uninstalled,
    Superseded,
    Failed,
    Uninstalling,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Deployed => "deployed",
            Self::Uninstalled => "uninstalled",
            Self::Superseded => "superseded",
            Self::Failed => "failed",
            Self::Uninstalling => "uninstalling",
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::PendingRollback => "pending-rollback",
        }
    }

    /// An operation owns this revision and has not finalized it yet
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingInstall | Self::PendingUpgrade | Self::PendingRollback
        )
    }

    /// No operation will move this revision any further on its own
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Deployed | Self::Superseded | Self::Failed | Self::Uninstalled
        )
    }

    /// Revision may serve as the baseline for a later diff
    pub fn is_baseline(&self) -> bool {
        matches!(self, Self::Deployed | Self::Superseded)
    }

    /// Allowed status transitions
    ///
    /// Re-asserting the current status is always allowed so descriptions
    /// can be updated. `unknown` records predate status tracking and may
    /// move anywhere.
    pub fn can_transition_to(&self, to: Status) -> bool {
        if *self == to || *self == Self::Unknown {
            return true;
        }
        match self {
            Self::PendingInstall | Self::PendingUpgrade | Self::PendingRollback => matches!(
                to,
                Self::Deployed | Self::Failed | Self::Uninstalling | Self::Superseded
            ),
            Self::Deployed => matches!(to, Self::Superseded | Self::Uninstalling | Self::Failed),
            Self::Failed => matches!(to, Self::Superseded | Self::Uninstalling),
            Self::Superseded => matches!(to, Self::Uninstalling),
            Self::Uninstalling => matches!(to, Self::Uninstalled | Self::Failed),
            Self::Uninstalled => matches!(to, Self::Superseded),
            Self::Unknown => true,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "deployed" => Ok(Self::Deployed),
            "uninstalled" => Ok(Self::Uninstalled),
            "superseded" => Ok(Self::Superseded),
            "failed" => Ok(Self::Failed),
            "uninstalling" => Ok(Self::Uninstalling),
            "pending-install" => Ok(Self::PendingInstall),
            "pending-upgrade" => Ok(Self::PendingUpgrade),
            "pending-rollback" => Ok(Self::PendingRollback),
            other => Err(format!("unknown release status '{}'", other)),
        }
    }
}

impl Release {
    /// Create a new revision in `status`
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        version: u32,
        chart: Chart,
        config: Values,
        status: Status,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            version,
            info: Info::new(status, now),
            chart,
            config,
            manifest: String::new(),
            hooks: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    /// Storage key for a revision: `<name>.v<version>`
    pub fn key_for(name: &str, version: u32) -> String {
        format!("{}.v{}", name, version)
    }

    pub fn key(&self) -> String {
        Self::key_for(&self.name, self.version)
    }

    pub fn status(&self) -> Status {
        self.info.status
    }

    /// Move to `to`, recording the description and timestamps
    pub fn transition(
        &mut self,
        to: Status,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let from = self.info.status;
        if !from.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                name: self.name.clone(),
                from,
                to,
            });
        }
        self.info.status = to;
        self.info.description = description.into();
        match to {
            Status::Deployed => self.info.last_deployed = now,
            Status::Uninstalled => self.info.deleted = Some(now),
            _ => {}
        }
        Ok(())
    }
}
