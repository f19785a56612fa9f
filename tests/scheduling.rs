// tests/scheduling.rs

mod common;
use crate::common::{ClusterHarness, SubmissionBuilder, TaskSpecBuilder, TestResult, init_tracing, o, t};

use std::time::Instant;

use taskgov::engine::GovernorOptions;
use taskgov::protocol::{DataSource, FromWorker, ToWorker};
use taskgov::registry::{LivenessPolicy, WorkerInfo, WorkerRegistry};
use taskgov::scheduler::{Scheduler, SchedulerWeights, committed_by_worker};
use taskgov::types::{LoadSnapshot, Resources, WorkerId};

fn harness_with(weights: SchedulerWeights) -> ClusterHarness {
    ClusterHarness::with_options(GovernorOptions {
        debug_consistency_checks: true,
        weights,
        ..GovernorOptions::default()
    })
}

/// Runs T1 to produce kept O1 on the first worker, then keeps that worker
/// half busy with T5. Returns the worker T2 (reading O1) was sent to.
fn place_consumer_next_to_busy_producer(
    h: &mut ClusterHarness,
) -> Result<(WorkerId, DataSource), Box<dyn std::error::Error>> {
    let w1 = h.add_worker(2);
    h.add_worker(2);
    let (client, session) = h.submit_new(SubmissionBuilder::new().kept(1).task(1, &[], &[1]));
    let (worker, request) = h.take_dispatch(t(1)).ok_or("T1 not dispatched")?;
    assert_eq!(worker, w1);
    h.ack(worker, request.task, request.attempt);
    h.finish(worker, &request);

    h.submit(client, session, SubmissionBuilder::new().object(5).task(5, &[], &[5]))?;
    let (busy, request) = h.take_dispatch(t(5)).ok_or("T5 not dispatched")?;
    assert_eq!(busy, w1, "equal load goes to the lowest id");
    h.ack(busy, request.task, request.attempt);

    h.submit(client, session, SubmissionBuilder::new().object(2).task(2, &[1], &[2]))?;
    let (worker, request) = h.take_dispatch(t(2)).ok_or("T2 not dispatched")?;
    Ok((worker, request.inputs[0].source.clone()))
}

#[test]
fn consumer_follows_its_input_despite_moderate_load() -> TestResult {
    init_tracing();
    let mut h = harness_with(SchedulerWeights::default());

    let (worker, source) = place_consumer_next_to_busy_producer(&mut h)?;

    assert_eq!(worker, WorkerId(1));
    assert_eq!(source, DataSource::Local);
    Ok(())
}

#[test]
fn heavy_load_penalty_moves_the_consumer_away() -> TestResult {
    init_tracing();
    let mut h = harness_with(SchedulerWeights {
        locality_bonus: 10.0,
        ..SchedulerWeights::default()
    });

    let (worker, source) = place_consumer_next_to_busy_producer(&mut h)?;

    assert_eq!(worker, WorkerId(2));
    assert_eq!(
        source,
        DataSource::Worker {
            worker: WorkerId(1),
            address: "10.0.0.1:7001".into()
        }
    );
    Ok(())
}

fn shared_input() -> SubmissionBuilder {
    SubmissionBuilder::new()
        .objects(&[1, 2, 3])
        .task(1, &[], &[1])
        .task(2, &[1], &[2])
        .task(3, &[1], &[3])
}

#[test]
fn shared_input_is_replicated_to_the_second_consumer() -> TestResult {
    init_tracing();
    let mut h = ClusterHarness::new();
    let w1 = h.add_worker(1);
    let w2 = h.add_worker(1);
    h.submit_new(shared_input());

    let (worker, first) = h.take_dispatch(t(1)).ok_or("T1 not dispatched")?;
    h.ack(worker, first.task, first.attempt);
    h.finish(worker, &first);

    let (on_producer, _) = h.take_dispatch(t(2)).ok_or("T2 not dispatched")?;
    let (elsewhere, _) = h.take_dispatch(t(3)).ok_or("T3 not dispatched")?;
    assert_eq!((on_producer, elsewhere), (w1, w2));

    let source = DataSource::Worker {
        worker: w1,
        address: "10.0.0.1:7001".into(),
    };
    assert!(
        h.worker_messages(w2)
            .contains(&ToWorker::ObjectTransferRequest { object: o(1), source })
    );

    h.worker_message(w2, FromWorker::ObjectTransferComplete { object: o(1), size: 8 });
    let holders: Vec<_> = h
        .governor
        .store()
        .get(o(1))
        .ok_or("O1 missing")?
        .holders()
        .collect();
    assert_eq!(holders, vec![w1, w2]);
    assert!(h.governor.registry().get(w2).is_some_and(|w| w.objects.contains(&o(1))));
    Ok(())
}

#[test]
fn memory_pressure_drops_a_redundant_replica_not_in_use() -> TestResult {
    init_tracing();
    let mut h = ClusterHarness::new();
    let w1 = h.add_worker_with(Resources::new(1, 64));
    let w2 = h.add_worker_with(Resources::new(1, 64));
    h.submit_new(shared_input());

    let (worker, first) = h.take_dispatch(t(1)).ok_or("T1 not dispatched")?;
    h.ack(worker, first.task, first.attempt);
    h.finish(worker, &first);
    let (_, second) = h.take_dispatch(t(2)).ok_or("T2 not dispatched")?;
    let (_, third) = h.take_dispatch(t(3)).ok_or("T3 not dispatched")?;
    h.ack(w1, second.task, second.attempt);
    h.ack(w2, third.task, third.attempt);
    h.worker_message(w2, FromWorker::ObjectTransferComplete { object: o(1), size: 8 });

    let pressure = LoadSnapshot {
        running_tasks: 1,
        memory_used_bytes: 100,
        stored_objects: 1,
    };
    // Both copies feed a running task.
    h.heartbeat(w1, pressure);
    h.heartbeat(w2, pressure);
    let holders: Vec<_> = h.governor.store().get(o(1)).ok_or("O1 missing")?.holders().collect();
    assert_eq!(holders, vec![w1, w2]);

    // Once T2 is done the copy on w1 is redundant: T3 reads the one on w2.
    h.finish(w1, &second);
    h.heartbeat(w1, pressure);
    assert_eq!(
        h.worker_messages(w1).last(),
        Some(&ToWorker::RemoveObjects { objects: vec![o(1)] })
    );
    let holders: Vec<_> = h.governor.store().get(o(1)).ok_or("O1 missing")?.holders().collect();
    assert_eq!(holders, vec![w2]);

    // The last copy stays while T3 still needs it.
    h.heartbeat(w2, pressure);
    assert!(h.governor.store().is_available(o(1)));
    Ok(())
}

#[test]
fn replication_can_be_switched_off() -> TestResult {
    init_tracing();
    let mut h = harness_with(SchedulerWeights {
        replicate_shared_inputs: false,
        ..SchedulerWeights::default()
    });
    h.add_worker(1);
    let w2 = h.add_worker(1);
    h.submit_new(shared_input());

    let (worker, first) = h.take_dispatch(t(1)).ok_or("T1 not dispatched")?;
    h.ack(worker, first.task, first.attempt);
    h.finish(worker, &first);

    let (_, request) = h.take_dispatch(t(3)).ok_or("T3 not dispatched")?;
    assert!(matches!(request.inputs[0].source, DataSource::Worker { .. }));
    assert!(
        !h.worker_messages(w2)
            .iter()
            .any(|m| matches!(m, ToWorker::ObjectTransferRequest { .. }))
    );
    Ok(())
}

#[test]
fn one_pass_fills_every_worker_with_room() -> TestResult {
    init_tracing();
    // No workers yet, so every source stays Ready.
    let mut h = ClusterHarness::new();
    h.submit_new(
        SubmissionBuilder::new()
            .objects(&[1, 2, 3, 4])
            .task(1, &[], &[1])
            .task(2, &[], &[2])
            .task(3, &[], &[3])
            .task_with(TaskSpecBuilder::new(4).output(4).cpus(4)),
    );
    assert!(h.dispatches.is_empty());

    let mut registry = WorkerRegistry::new(LivenessPolicy::default());
    for (id, cpus) in [(1, 2), (2, 1)] {
        let info = WorkerInfo {
            address: format!("10.0.0.{id}:7000"),
            data_address: format!("10.0.0.{id}:7001"),
            capacity: Resources::cpus(cpus),
        };
        registry.register(WorkerId(id), info, Instant::now())?;
    }

    let plan = Scheduler::default().schedule(h.governor.graph(), h.governor.store(), &registry);

    let placed: Vec<_> = plan.placements.iter().map(|p| (p.task, p.worker)).collect();
    assert_eq!(
        placed,
        vec![(t(1), WorkerId(1)), (t(2), WorkerId(2)), (t(3), WorkerId(1))]
    );
    assert_eq!(plan.worker_of(t(4)), None, "no worker has four cpus");
    let totals = committed_by_worker(&plan, h.governor.graph());
    assert_eq!(totals.get(&WorkerId(1)).map(|r| r.cpus), Some(2));
    assert_eq!(totals.get(&WorkerId(2)).map(|r| r.cpus), Some(1));
    Ok(())
}
