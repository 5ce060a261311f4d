// src/dispatch/session.rs

//! Session budget state machine.
//!
//! A session starts `Active` and ends in one of two terminal states:
//! `Finalizing` when the reasoning process asks to stop, `Exhausted` when a
//! ceiling is hit. Usage counters only ever grow.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use crate::models::{Budget, Resource, Usage};

/// Why a session stopped dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "resource", rename_all = "snake_case")]
pub enum TerminationReason {
    AgentFinalized,
    BudgetExhausted(Resource),
    WallClockExhausted,
    MaxIterations,
}

impl TerminationReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AgentFinalized => "agent_finalized",
            Self::BudgetExhausted(_) => "budget_exhausted",
            Self::WallClockExhausted => "wall_clock_exhausted",
            Self::MaxIterations => "max_iterations",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExhausted(resource) => write!(f, "budget_exhausted({resource})"),
            other => f.write_str(other.code()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Finalizing,
    Exhausted { reason: TerminationReason },
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        match self {
            Self::Active => None,
            Self::Finalizing => Some(TerminationReason::AgentFinalized),
            Self::Exhausted { reason } => Some(*reason),
        }
    }
}

/// Remaining allowance per resource at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetSnapshot {
    /// `(resource, used, ceiling)` in [`Resource::ALL`] order
    pub resources: Vec<(Resource, u64, u64)>,
    pub seconds_used: u64,
    pub seconds_ceiling: u64,
    pub iterations_used: u32,
    pub iterations_ceiling: u32,
}

impl BudgetSnapshot {
    pub fn remaining(&self, resource: Resource) -> u64 {
        self.resources
            .iter()
            .find(|(r, _, _)| *r == resource)
            .map_or(0, |(_, used, ceiling)| ceiling.saturating_sub(*used))
    }
}

impl fmt::Display for BudgetSnapshot {
    /// `Budget Remaining: 2 queries, 4 pages, ...` as shown to the reasoning process.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .resources
            .iter()
            .filter(|(_, _, ceiling)| *ceiling > 0)
            .map(|(resource, used, ceiling)| {
                format!("{} {}", ceiling.saturating_sub(*used), resource)
            })
            .collect();
        if self.seconds_ceiling > 0 {
            parts.push(format!(
                "{} seconds",
                self.seconds_ceiling.saturating_sub(self.seconds_used)
            ));
        }
        parts.push(format!(
            "{} tool calls",
            self.iterations_ceiling.saturating_sub(self.iterations_used)
        ));
        write!(f, "Budget Remaining: {}", parts.join(", "))
    }
}

/// Per-session budget, usage and state. Owned by one dispatcher.
#[derive(Debug)]
pub struct Session {
    budget: Budget,
    usage: Usage,
    started: Instant,
    max_iterations: u32,
    iterations: AtomicU32,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(budget: Budget, max_iterations: u32) -> Self {
        Self {
            budget,
            usage: Usage::new(),
            started: Instant::now(),
            max_iterations,
            iterations: AtomicU32::new(0),
            state: Mutex::new(SessionState::Active),
        }
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub fn usage(&self, resource: Resource) -> u64 {
        self.usage.get(resource)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn iterations(&self) -> u32 {
        self.iterations.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            resources: self
                .usage
                .snapshot()
                .into_iter()
                .map(|(r, used)| (r, used, self.budget.ceiling(r)))
                .collect(),
            seconds_used: self.elapsed().as_secs(),
            seconds_ceiling: self.budget.seconds,
            iterations_used: self.iterations(),
            iterations_ceiling: self.max_iterations,
        }
    }

    /// Move to a terminal state. The first terminal state sticks.
    pub(crate) fn terminate(&self, next: SessionState) -> SessionState {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_active() {
            *state = next;
            match next.termination() {
                Some(TerminationReason::AgentFinalized) => {
                    log::info!("Session finalizing on request")
                }
                Some(reason) => log::info!("Session stopped: {}", reason),
                None => {}
            }
        }
        *state
    }

    pub(crate) fn exhaust(&self, reason: TerminationReason) -> SessionState {
        self.terminate(SessionState::Exhausted { reason })
    }

    /// Wall-clock and iteration guards, checked before each dispatch.
    /// A zero `seconds` budget disables the wall-clock guard.
    pub(crate) fn check_guards(&self) -> Option<TerminationReason> {
        if self.budget.seconds > 0 && self.elapsed() >= Duration::from_secs(self.budget.seconds) {
            return Some(TerminationReason::WallClockExhausted);
        }
        if self.iterations() >= self.max_iterations {
            return Some(TerminationReason::MaxIterations);
        }
        None
    }

    pub(crate) fn count_iteration(&self) -> u32 {
        self.iterations.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// First resource whose projected usage would pass its ceiling.
    pub(crate) fn over_budget(&self, cost: &[(Resource, u64)]) -> Option<Resource> {
        cost.iter()
            .find(|(resource, amount)| {
                self.usage.get(*resource) + amount > self.budget.ceiling(*resource)
            })
            .map(|(resource, _)| *resource)
    }

    pub(crate) fn charge(&self, resource: Resource, amount: u64) -> u64 {
        if amount == 0 {
            return self.usage.get(resource);
        }
        let total = self.usage.add(resource, amount);
        log::debug!(
            "Charged {} {} ({}/{})",
            amount,
            resource,
            total,
            self.budget.ceiling(resource)
        );
        total
    }

    /// First metered resource that has reached its ceiling. Resources with a
    /// zero ceiling are unavailable rather than exhausted.
    pub(crate) fn reached_ceiling(&self) -> Option<Resource> {
        Resource::ALL.into_iter().find(|&resource| {
            let ceiling = self.budget.ceiling(resource);
            ceiling > 0 && self.usage.get(resource) >= ceiling
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(pages: u64) -> Budget {
        Budget {
            pages,
            ..Budget::default()
        }
    }

    #[test]
    fn test_first_terminal_state_sticks() {
        let session = Session::new(budget(2), 10);
        session.terminate(SessionState::Finalizing);
        let state = session.exhaust(TerminationReason::MaxIterations);
        assert_eq!(state, SessionState::Finalizing);
        assert_eq!(
            session.state().termination(),
            Some(TerminationReason::AgentFinalized)
        );
    }

    #[test]
    fn test_projected_usage_is_checked_per_resource() {
        let session = Session::new(budget(2), 10);
        assert_eq!(session.over_budget(&[(Resource::Pages, 2)]), None);
        session.charge(Resource::Pages, 1);
        assert_eq!(
            session.over_budget(&[(Resource::Pages, 2)]),
            Some(Resource::Pages)
        );
        assert_eq!(session.reached_ceiling(), None);
        session.charge(Resource::Pages, 1);
        assert_eq!(session.reached_ceiling(), Some(Resource::Pages));
    }

    #[test]
    fn test_zero_ceiling_is_never_reached() {
        let session = Session::new(
            Budget {
                pdf: 0,
                ..Budget::default()
            },
            10,
        );
        assert_eq!(session.reached_ceiling(), None);
        assert_eq!(session.over_budget(&[(Resource::Pdf, 1)]), Some(Resource::Pdf));
    }

    #[test]
    fn test_iteration_guard_trips_at_the_ceiling() {
        let session = Session::new(Budget::default(), 2);
        assert_eq!(session.check_guards(), None);
        session.count_iteration();
        session.count_iteration();
        assert_eq!(session.check_guards(), Some(TerminationReason::MaxIterations));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_guard_trips_after_the_budget() {
        let session = Session::new(
            Budget {
                seconds: 5,
                ..Budget::default()
            },
            10,
        );
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(session.check_guards(), None);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            session.check_guards(),
            Some(TerminationReason::WallClockExhausted)
        );
    }

    #[test]
    fn test_snapshot_renders_remaining_allowance() {
        let session = Session::new(
            Budget {
                queries: 3,
                pages: 2,
                evidence_tokens: 0,
                ai_overviews: 0,
                pdf: 0,
                ad_intelligence: 0,
                seconds: 0,
            },
            10,
        );
        session.charge(Resource::Queries, 1);
        session.count_iteration();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.remaining(Resource::Queries), 2);
        assert_eq!(
            snapshot.to_string(),
            "Budget Remaining: 2 queries, 2 pages, 9 tool calls"
        );
    }
}
