//! One reconciliation tick
//!
//! A tick validates the desired cluster, probes the live state, decides on
//! at most one operator and executes its commands in order under an
//! operation record.

use tokio::sync::watch;
use tracing::{debug, info, warn};

use kestrel_common::{Record, Result};
use kestrel_infra::Infrastructure;

use crate::operator::Operator;
use crate::operators::{decide, Context};
use crate::phase::Phase;
use crate::probe::probe;

/// What a tick did
#[derive(Debug)]
pub struct TickOutcome {
    /// Phase the decision landed in
    pub phase: Phase,
    /// The executed operation's record, if an operator ran
    pub record: Option<Record>,
}

impl TickOutcome {
    /// True when the cluster needed no work
    pub fn is_completed(&self) -> bool {
        self.phase == Phase::Completed && self.record.is_none()
    }
}

/// Validate, probe, decide and execute, starting the walk at `start`
pub async fn run_tick(
    infra: &Infrastructure,
    start: Phase,
    stop: &watch::Receiver<bool>,
) -> Result<TickOutcome> {
    let cluster = infra.cluster();
    cluster.validate()?;
    match infra.storage().get_constraints().await {
        Ok(constraints) => constraints.check(cluster)?,
        Err(e) if e.is_not_found() => debug!(cluster = %cluster.name, "no constraints stored"),
        Err(e) => return Err(e),
    }

    let resources = infra.storage().list_resources().await?;
    let status = probe(infra, &resources).await?;
    let ctx = Context {
        cluster,
        status: &status,
        resources: &resources,
        config: infra.config(),
    };
    let decision = decide(start, &ctx)?;

    let Some(mut operator) = decision.operator else {
        debug!(cluster = %cluster.name, "cluster converged");
        return Ok(TickOutcome {
            phase: decision.phase,
            record: None,
        });
    };
    info!(phase = %decision.phase, operation = %operator.name(), "running operation");
    let record = execute(infra, &mut operator, stop).await?;
    Ok(TickOutcome {
        phase: decision.phase,
        record: Some(record),
    })
}

/// Run an operator's commands in order under a new record
///
/// The first failing command finalizes the record with its error and is
/// returned. A raised stop signal cancels the record between commands.
pub async fn execute(
    infra: &Infrastructure,
    operator: &mut dyn Operator,
    stop: &watch::Receiver<bool>,
) -> Result<Record> {
    let storage = infra.storage();
    let leader = infra.leader_key();

    let id = storage.next_record_id(leader).await?;
    let mut record = Record::new(id, operator.name(), operator.targets());
    storage.register_record(leader, &record).await?;

    while let Some(commander) = operator.next_command() {
        if *stop.borrow() {
            info!(id, operation = %record.operation, "operation cancelled by shutdown");
            record.cancel();
            storage.update_record(leader, &record).await?;
            return Ok(record);
        }

        let command = commander.command();
        debug!(id, command = %command, "running command");
        record.set_command(command);
        storage.update_record(leader, &record).await?;

        if let Err(e) = commander.run(infra).await {
            if e.is_lost_leadership() {
                return Err(e);
            }
            warn!(id, command = %record.command, error = %e, "command failed");
            record.set_error(&e);
            if let Err(update) = storage.update_record(leader, &record).await {
                warn!(id, error = %update, "failed to record command failure");
                if update.is_lost_leadership() {
                    return Err(update);
                }
            }
            return Err(e);
        }
    }

    record.complete();
    storage.update_record(leader, &record).await?;
    info!(id, operation = %record.operation, "operation completed");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use kestrel_common::{Command, Constraints, Error, RecordStatus};

    use crate::operator::{MockCommander, Plan};
    use crate::testing::{cluster, Fixture};

    fn ok_step(name: &'static str, runs: Arc<AtomicUsize>) -> MockCommander {
        let mut c = MockCommander::new();
        c.expect_command().returning(move || Command::new(name, "10.0.0.1"));
        c.expect_run().returning(move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        c
    }

    fn failing_step(error: fn() -> Error) -> MockCommander {
        let mut c = MockCommander::new();
        c.expect_command().returning(|| Command::new("container-run", "10.0.0.2"));
        c.expect_run().returning(move |_| Err(error()));
        c
    }

    fn never_run() -> MockCommander {
        let mut c = MockCommander::new();
        c.expect_command().returning(|| Command::new("never", ""));
        c.expect_run().never();
        c
    }

    #[tokio::test]
    async fn successful_operation_completes_its_record() {
        let c = cluster();
        let fx = Fixture::new(&c).await;
        let infra = fx.infra(&c);
        let (_tx, stop) = watch::channel(false);
        let runs = Arc::new(AtomicUsize::new(0));

        let mut plan = Plan::new("etcd-start", vec!["10.0.0.1".to_string()])
            .then(ok_step("etcd-files", runs.clone()))
            .then(ok_step("container-run", runs.clone()));
        let record = execute(&infra, &mut plan, &stop).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(record.status, RecordStatus::Completed);
        let stored = fx.storage.get_record(record.id).await.unwrap();
        assert_eq!(stored.status, RecordStatus::Completed);
        assert_eq!(stored.operation, "etcd-start");
        assert_eq!(stored.targets, vec!["10.0.0.1".to_string()]);
        assert_eq!(stored.command.name, "container-run");
        assert!(stored.end_at.is_some());
    }

    #[tokio::test]
    async fn failed_command_is_recorded_and_stops_the_operation() {
        let c = cluster();
        let fx = Fixture::new(&c).await;
        let infra = fx.infra(&c);
        let (_tx, stop) = watch::channel(false);

        let mut plan = Plan::new("kube-restart", vec!["10.0.0.2".to_string()])
            .then(failing_step(|| Error::transport("10.0.0.2", "connection reset")))
            .then(never_run());
        let err = execute(&infra, &mut plan, &stop).await.unwrap_err();
        assert_eq!(err.node(), Some("10.0.0.2"));

        let records = fx.storage.get_records(1).await.unwrap();
        let stored = &records[0];
        assert_eq!(stored.status, RecordStatus::Cancelled);
        assert_eq!(stored.command.name, "container-run");
        assert!(stored.error.contains("connection reset"));
    }

    #[tokio::test]
    async fn lost_leadership_aborts_without_further_commands() {
        let c = cluster();
        let fx = Fixture::new(&c).await;
        let infra = fx.infra(&c);
        let (_tx, stop) = watch::channel(false);

        let mut plan = Plan::new("upgrade", vec![])
            .then(failing_step(|| Error::LostLeadership))
            .then(never_run());
        let err = execute(&infra, &mut plan, &stop).await.unwrap_err();
        assert!(err.is_lost_leadership());
    }

    #[tokio::test]
    async fn stop_signal_cancels_between_commands() {
        let c = cluster();
        let fx = Fixture::new(&c).await;
        let infra = fx.infra(&c);
        let (tx, stop) = watch::channel(false);
        tx.send(true).unwrap();

        let mut plan = Plan::new("rivers-restart", vec![]).then(never_run());
        let record = execute(&infra, &mut plan, &stop).await.unwrap();
        assert_eq!(record.status, RecordStatus::Cancelled);
        assert!(record.error.is_empty());
    }

    #[tokio::test]
    async fn records_get_increasing_ids() {
        let c = cluster();
        let fx = Fixture::new(&c).await;
        let infra = fx.infra(&c);
        let (_tx, stop) = watch::channel(false);

        let mut first = Plan::new("upgrade", vec![]);
        let mut second = Plan::new("upgrade", vec![]);
        let a = execute(&infra, &mut first, &stop).await.unwrap();
        let b = execute(&infra, &mut second, &stop).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn constraint_violation_fails_before_any_remote_command() {
        let c = cluster();
        let fx = Fixture::new(&c).await;
        fx.storage
            .put_constraints(
                fx.guard.key(),
                &Constraints {
                    control_plane_count: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let infra = fx.infra(&c);
        let (_tx, stop) = watch::channel(false);

        let err = run_tick(&infra, Phase::Upgrade, &stop).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(fx.commands("10.0.0.1").is_empty());
    }
}
