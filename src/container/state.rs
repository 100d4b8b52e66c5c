//! Container lifecycle state machine (C3).

use serde::{Deserialize, Serialize};

/// States in the container lifecycle DAG (§4.3). `Deleted` is terminal;
/// `Unhealthy` is a sink except for the transition to `Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    Open,
    Closing,
    QuasiClosed,
    Closed,
    Unhealthy,
    Deleted,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Open => "OPEN",
            ContainerState::Closing => "CLOSING",
            ContainerState::QuasiClosed => "QUASI_CLOSED",
            ContainerState::Closed => "CLOSED",
            ContainerState::Unhealthy => "UNHEALTHY",
            ContainerState::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(ContainerState::Open),
            "CLOSING" => Some(ContainerState::Closing),
            "QUASI_CLOSED" => Some(ContainerState::QuasiClosed),
            "CLOSED" => Some(ContainerState::Closed),
            "UNHEALTHY" => Some(ContainerState::Unhealthy),
            "DELETED" => Some(ContainerState::Deleted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerState::Deleted)
    }

    /// True for the two states export (C4) and force-free metadata update
    /// treat as "closed enough to read without interference."
    pub fn is_closed_family(&self) -> bool {
        matches!(self, ContainerState::Closed | ContainerState::QuasiClosed)
    }

    pub fn can_mark_for_close(&self) -> bool {
        matches!(self, ContainerState::Open)
    }

    pub fn can_close_or_quasi_close(&self) -> bool {
        matches!(self, ContainerState::Closing)
    }

    /// Any state other than `Unhealthy` itself or the terminal `Deleted`
    /// may transition to `Unhealthy` unconditionally.
    pub fn can_mark_unhealthy(&self) -> bool {
        !matches!(self, ContainerState::Unhealthy | ContainerState::Deleted)
    }

    pub fn can_delete(&self) -> bool {
        matches!(
            self,
            ContainerState::Closed | ContainerState::QuasiClosed | ContainerState::Unhealthy
        )
    }

    /// Metadata updates are allowed in `Open` unconditionally, or in any
    /// other non-deleted state when the caller passes `force`.
    pub fn can_update_metadata(&self, force: bool) -> bool {
        match self {
            ContainerState::Open => true,
            ContainerState::Deleted => false,
            _ => force,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
