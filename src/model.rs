//! Core data model.
//!
//! A case is a unit of back-office work moving through the origination
//! pipeline. It has identity, provenance (which import produced it), a
//! financial payload the engine never interprets, a pipeline stage, and an
//! optional time-limited assignment lease.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::Stage;

// ---------------------------------------------------------------------------
// Case
// ---------------------------------------------------------------------------

/// A case tracked by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    /// Unique identifier.
    pub id: CaseId,

    /// External dossier/contract reference, carried for operators.
    /// Opaque to the engine.
    pub reference: String,

    /// Where this case came from.
    pub provenance: Provenance,

    /// Financial payload written by external calculators. The engine
    /// doesn't interpret it.
    pub payload: serde_json::Value,

    /// Current pipeline stage.
    pub stage: Stage,

    /// Exclusive assignment, if any. Holder and lease timestamps travel
    /// together; there is no way to set one without the others.
    pub lease: Option<Lease>,

    /// Optimistic-concurrency counter, bumped by every committed mutation.
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Case {
    /// Current holder, if the case carries a lease (expired or not).
    pub fn holder(&self) -> Option<&OperatorId> {
        self.lease.as_ref().map(|l| &l.holder)
    }

    /// Open for claiming: no lease, or the lease deadline has passed.
    pub fn available_at(&self, now: DateTime<Utc>) -> bool {
        match &self.lease {
            None => true,
            Some(lease) => lease.is_expired(now),
        }
    }
}

/// Newtype for case IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaseId(pub Uuid);

impl CaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for CaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for CaseId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// An exclusive, time-limited assignment of a case to one operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: OperatorId,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Grant a lease starting now. The deadline is always derived from the
    /// grant instant; callers never pick it.
    pub fn grant(holder: OperatorId, now: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            holder,
            leased_at: now,
            expires_at: now + duration,
        }
    }

    /// Past the deadline. A lease expires exactly at `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Still live, but the deadline falls within `horizon` from now.
    pub fn expires_within(&self, now: DateTime<Utc>, horizon: Duration) -> bool {
        !self.is_expired(now) && self.expires_at <= now + horizon
    }
}

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

/// Newtype for operator IDs. Assigned by the identity system upstream;
/// opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorId(pub String);

impl OperatorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OperatorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A human operator as seen by the engine: identity plus role. Sourced from
/// the auth layer upstream; the engine only reads these two fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub id: OperatorId,
    pub role: Role,
}

impl Operator {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: OperatorId::new(id),
            role,
        }
    }
}

/// Back-office role. Transition edges name the role allowed to drive them;
/// admins may also force-release and reassign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Agent,
    Analyst,
    Supervisor,
    Finance,
    Admin,
}

impl Role {
    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Agent => "agent",
            Role::Analyst => "analyst",
            Role::Supervisor => "supervisor",
            Role::Finance => "finance",
            Role::Admin => "admin",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Role::Agent),
            "analyst" => Ok(Role::Analyst),
            "supervisor" => Ok(Role::Supervisor),
            "finance" => Ok(Role::Finance),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Where a case came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// High-level source (e.g., "bank-import", "manual").
    pub source: String,

    /// More specific trigger (e.g., "import/2026-08-20", "operator/ines").
    pub trigger: Option<String>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for creating new cases. The engine's public API for intake.
pub struct NewCase {
    pub(crate) reference: String,
    pub(crate) provenance: Provenance,
    pub(crate) payload: serde_json::Value,
}

impl NewCase {
    pub fn new(reference: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            provenance: Provenance {
                source: source.into(),
                trigger: None,
            },
            payload: serde_json::Value::Null,
        }
    }

    pub fn trigger(mut self, trigger: impl Into<String>) -> Self {
        self.provenance.trigger = Some(trigger.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
