//! The origination pipeline: stages and the gated transition table.
//!
//! Stages form a closed enum. Which moves are legal is data: a table of
//! edges, each guarded by a role and an optional decision gate. The table is
//! validated once at engine construction; at runtime an advance either
//! matches exactly one edge or fails, it is never defaulted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::model::Role;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Pipeline stage of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Fresh from import, never touched by an operator.
    Intake,
    /// An agent is formalizing the dossier.
    AgentReview,
    /// Waiting for the financial calculation to be reviewed.
    CalculationPending,
    /// Calculation signed off by an analyst.
    CalculationApproved,
    /// Supervisor cleared the case for closing.
    ClosingApproved,
    /// Funds out the door. Terminal.
    Disbursed,
    /// Refused at some review step. Terminal.
    Rejected,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Intake,
        Stage::AgentReview,
        Stage::CalculationPending,
        Stage::CalculationApproved,
        Stage::ClosingApproved,
        Stage::Disbursed,
        Stage::Rejected,
    ];

    /// Is this a terminal stage?
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Disbursed | Stage::Rejected)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Intake => "intake",
            Stage::AgentReview => "agent-review",
            Stage::CalculationPending => "calculation-pending",
            Stage::CalculationApproved => "calculation-approved",
            Stage::ClosingApproved => "closing-approved",
            Stage::Disbursed => "disbursed",
            Stage::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "intake" => Ok(Stage::Intake),
            "agent-review" => Ok(Stage::AgentReview),
            "calculation-pending" => Ok(Stage::CalculationPending),
            "calculation-approved" => Ok(Stage::CalculationApproved),
            "closing-approved" => Ok(Stage::ClosingApproved),
            "disbursed" => Ok(Stage::Disbursed),
            "rejected" => Ok(Stage::Rejected),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Gates and decisions
// ---------------------------------------------------------------------------

/// Which boolean flag a gate reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Approved,
    Formalized,
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GateKind::Approved => "approved",
            GateKind::Formalized => "formalized",
        };
        write!(f, "{s}")
    }
}

/// Guard on a transition edge: the named flag must carry exactly `when`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate {
    pub kind: GateKind,
    pub when: bool,
}

impl std::fmt::Display for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.kind, self.when)
    }
}

/// The decision an operator supplies with an advance call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved(bool),
    Formalized(bool),
}

impl Decision {
    pub fn kind(self) -> GateKind {
        match self {
            Decision::Approved(_) => GateKind::Approved,
            Decision::Formalized(_) => GateKind::Formalized,
        }
    }

    pub fn value(self) -> bool {
        match self {
            Decision::Approved(v) | Decision::Formalized(v) => v,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.kind(), self.value())
    }
}

/// What an operator submits to move a case forward.
#[derive(Debug, Clone, Default)]
pub struct AdvanceInput {
    pub decision: Option<Decision>,
    pub note: Option<String>,
}

impl AdvanceInput {
    /// Advance with no decision flag. Matches gateless edges only.
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn approved(value: bool) -> Self {
        Self {
            decision: Some(Decision::Approved(value)),
            note: None,
        }
    }

    pub fn formalized(value: bool) -> Self {
        Self {
            decision: Some(Decision::Formalized(value)),
            note: None,
        }
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// One legal move out of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub to: Stage,
    pub role: Role,
    pub gate: Option<Gate>,
}

impl Edge {
    fn open(to: Stage, role: Role) -> Self {
        Self {
            to,
            role,
            gate: None,
        }
    }

    fn gated(to: Stage, role: Role, kind: GateKind, when: bool) -> Self {
        Self {
            to,
            role,
            gate: Some(Gate { kind, when }),
        }
    }
}

/// The pipeline's legal moves, keyed by source stage.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    initial: Stage,
    edges: HashMap<Stage, Vec<Edge>>,
}

impl TransitionTable {
    /// The standard loan-origination pipeline.
    pub fn standard() -> Self {
        use GateKind::{Approved, Formalized};
        use Stage::*;

        let edges = HashMap::from([
            (Intake, vec![Edge::open(AgentReview, Role::Agent)]),
            (
                AgentReview,
                vec![
                    Edge::gated(CalculationPending, Role::Agent, Formalized, true),
                    Edge::gated(Rejected, Role::Agent, Formalized, false),
                ],
            ),
            (
                CalculationPending,
                vec![
                    Edge::gated(CalculationApproved, Role::Analyst, Approved, true),
                    Edge::gated(Rejected, Role::Analyst, Approved, false),
                ],
            ),
            (
                CalculationApproved,
                vec![
                    Edge::gated(ClosingApproved, Role::Supervisor, Approved, true),
                    Edge::gated(Rejected, Role::Supervisor, Approved, false),
                ],
            ),
            (ClosingApproved, vec![Edge::open(Disbursed, Role::Finance)]),
        ]);

        Self {
            initial: Intake,
            edges,
        }
    }

    /// Stage new cases are created in.
    pub fn initial_stage(&self) -> Stage {
        self.initial
    }

    /// First active stage, reached when a case leaves intake on its first
    /// claim. The initial stage always has exactly one outgoing edge.
    pub fn entry_stage(&self) -> Stage {
        self.edges
            .get(&self.initial)
            .and_then(|edges| edges.first())
            .map(|edge| edge.to)
            .unwrap_or(self.initial)
    }

    pub fn edges_from(&self, from: Stage) -> &[Edge] {
        self.edges.get(&from).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Pick the single edge out of `from` matching the supplied decision.
    /// Zero matches and multiple matches are both refusals; the engine
    /// never guesses which move was meant.
    pub fn select_edge(&self, from: Stage, decision: Option<&Decision>) -> Result<&Edge> {
        let mut it = self
            .edges_from(from)
            .iter()
            .filter(|edge| gate_matches(edge.gate.as_ref(), decision));

        match (it.next(), it.next()) {
            (Some(edge), None) => Ok(edge),
            _ => Err(Error::InvalidTransition {
                stage: from.to_string(),
                input: decision_label(decision),
            }),
        }
    }

    /// Structural checks, run once at engine construction.
    pub fn validate(&self) -> Result<()> {
        for (from, edges) in &self.edges {
            if from.is_terminal() {
                return Err(Error::Config(format!(
                    "transition table: terminal stage {from} has outgoing edges"
                )));
            }

            let mut open = 0;
            let mut seen_gates: Vec<Gate> = Vec::new();
            for edge in edges {
                match edge.gate {
                    None => open += 1,
                    Some(gate) => {
                        if seen_gates.contains(&gate) {
                            return Err(Error::Config(format!(
                                "transition table: ambiguous edges from {from} on {gate}"
                            )));
                        }
                        seen_gates.push(gate);
                    }
                }
            }
            if open > 1 {
                return Err(Error::Config(format!(
                    "transition table: {from} has {open} gateless edges"
                )));
            }
        }

        if self.edges_from(self.initial).len() != 1 {
            return Err(Error::Config(format!(
                "transition table: initial stage {} must have exactly one edge",
                self.initial
            )));
        }

        Ok(())
    }
}

fn gate_matches(gate: Option<&Gate>, decision: Option<&Decision>) -> bool {
    match (gate, decision) {
        (None, None) => true,
        (Some(gate), Some(decision)) => {
            gate.kind == decision.kind() && gate.when == decision.value()
        }
        _ => false,
    }
}

fn decision_label(decision: Option<&Decision>) -> String {
    match decision {
        Some(d) => d.to_string(),
        None => "no decision".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table_validates() {
        TransitionTable::standard().validate().unwrap();
    }

    #[test]
    fn entry_stage_is_agent_review() {
        let table = TransitionTable::standard();
        assert_eq!(table.initial_stage(), Stage::Intake);
        assert_eq!(table.entry_stage(), Stage::AgentReview);
    }

    #[test]
    fn formalized_gate_routes_to_calculation_or_rejection() {
        let table = TransitionTable::standard();

        let fwd = table
            .select_edge(Stage::AgentReview, Some(&Decision::Formalized(true)))
            .unwrap();
        assert_eq!(fwd.to, Stage::CalculationPending);
        assert_eq!(fwd.role, Role::Agent);

        let back = table
            .select_edge(Stage::AgentReview, Some(&Decision::Formalized(false)))
            .unwrap();
        assert_eq!(back.to, Stage::Rejected);
    }

    #[test]
    fn missing_decision_where_gate_required_is_invalid() {
        let table = TransitionTable::standard();
        let err = table
            .select_edge(Stage::CalculationPending, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn wrong_gate_kind_is_invalid() {
        let table = TransitionTable::standard();
        // calculation-pending gates on "approved", not "formalized"
        let err = table
            .select_edge(Stage::CalculationPending, Some(&Decision::Formalized(true)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn terminal_stages_have_no_edges() {
        let table = TransitionTable::standard();
        assert!(table.edges_from(Stage::Disbursed).is_empty());
        assert!(table.edges_from(Stage::Rejected).is_empty());
        let err = table.select_edge(Stage::Disbursed, None).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn gateless_edge_needs_no_decision() {
        let table = TransitionTable::standard();
        let edge = table.select_edge(Stage::ClosingApproved, None).unwrap();
        assert_eq!(edge.to, Stage::Disbursed);
        assert_eq!(edge.role, Role::Finance);

        // a decision where none is expected matches nothing
        let err = table
            .select_edge(Stage::ClosingApproved, Some(&Decision::Approved(true)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn duplicate_gates_fail_validation() {
        let table = TransitionTable {
            initial: Stage::Intake,
            edges: HashMap::from([
                (Stage::Intake, vec![Edge::open(Stage::AgentReview, Role::Agent)]),
                (
                    Stage::AgentReview,
                    vec![
                        Edge::gated(Stage::CalculationPending, Role::Agent, GateKind::Formalized, true),
                        Edge::gated(Stage::Rejected, Role::Agent, GateKind::Formalized, true),
                    ],
                ),
            ]),
        };
        assert!(table.validate().is_err());
    }

    #[test]
    fn multiple_gateless_edges_fail_validation() {
        let table = TransitionTable {
            initial: Stage::Intake,
            edges: HashMap::from([(
                Stage::Intake,
                vec![
                    Edge::open(Stage::AgentReview, Role::Agent),
                    Edge::open(Stage::Rejected, Role::Agent),
                ],
            )]),
        };
        assert!(table.validate().is_err());
    }

    #[test]
    fn stage_display_parse_round_trip() {
        for stage in Stage::ALL {
            let parsed: Stage = stage.to_string().parse().unwrap();
            assert_eq!(parsed, stage);
        }
    }
}
