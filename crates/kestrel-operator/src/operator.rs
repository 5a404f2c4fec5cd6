//! Operators and commanders
//!
//! An [`Operator`] is the unit of work chosen for a phase. It hands out
//! [`Commander`]s one at a time; each commander performs exactly one side
//! effect. Commanders are idempotent so that re-running a partially applied
//! operator on the next tick converges.

use std::collections::VecDeque;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use kestrel_common::{Command, Result};
use kestrel_infra::Infrastructure;

/// One side-effecting step
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Commander: Send + Sync {
    /// Description stored in the operation record
    fn command(&self) -> Command;

    /// Perform the step
    async fn run(&self, infra: &Infrastructure) -> Result<()>;
}

/// A named unit of work for one phase
pub trait Operator: Send {
    /// Operator name, stored in the operation record
    fn name(&self) -> &str;

    /// Node addresses or object keys affected
    fn targets(&self) -> Vec<String>;

    /// The next step, or `None` once every step has been handed out
    fn next_command(&mut self) -> Option<Box<dyn Commander>>;
}

/// An operator whose steps are fixed when it is planned
pub struct Plan {
    name: &'static str,
    targets: Vec<String>,
    commands: VecDeque<Box<dyn Commander>>,
}

impl Plan {
    /// Empty plan
    pub fn new(name: &'static str, targets: Vec<String>) -> Self {
        Self {
            name,
            targets,
            commands: VecDeque::new(),
        }
    }

    /// Append a step
    pub fn push(&mut self, commander: impl Commander + 'static) -> &mut Self {
        self.commands.push_back(Box::new(commander));
        self
    }

    /// Append a step, builder style
    pub fn then(mut self, commander: impl Commander + 'static) -> Self {
        self.push(commander);
        self
    }

    /// Remaining steps
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True when no steps remain
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Descriptions of the remaining steps, in order
    pub fn describe(&self) -> Vec<Command> {
        self.commands.iter().map(|c| c.command()).collect()
    }

    /// `None` for a plan without steps
    pub fn non_empty(self) -> Option<Self> {
        (!self.is_empty()).then_some(self)
    }
}

impl Operator for Plan {
    fn name(&self) -> &str {
        self.name
    }

    fn targets(&self) -> Vec<String> {
        self.targets.clone()
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        self.commands.pop_front()
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("name", &self.name)
            .field("targets", &self.targets)
            .field("commands", &self.describe())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &'static str) -> MockCommander {
        let mut c = MockCommander::new();
        c.expect_command().returning(move || Command::new(name, "10.0.0.1"));
        c
    }

    #[test]
    fn commands_are_handed_out_in_order() {
        let mut plan = Plan::new("etcd-restart", vec!["10.0.0.1".to_string()])
            .then(step("etcd-files"))
            .then(step("container-run"));
        assert_eq!(plan.len(), 2);

        let names: Vec<_> = std::iter::from_fn(|| plan.next_command())
            .map(|c| c.command().name)
            .collect();
        assert_eq!(names, vec!["etcd-files", "container-run"]);
        assert!(plan.next_command().is_none());
    }

    #[test]
    fn empty_plans_collapse_to_none() {
        assert!(Plan::new("rivers-restart", vec![]).non_empty().is_none());
        assert!(Plan::new("rivers-restart", vec![])
            .then(step("container-run"))
            .non_empty()
            .is_some());
    }
}
