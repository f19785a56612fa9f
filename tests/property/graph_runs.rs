// tests/property/graph_runs.rs

use crate::common::{ClusterHarness, SubmissionBuilder, TaskSpecBuilder, t};

use std::collections::BTreeSet;

use proptest::prelude::*;

use taskgov::graph::TaskState;
use taskgov::types::FailureReason;

/// Random acyclic graph: task `i` reads outputs of tasks with lower indices only.
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = Vec<BTreeSet<usize>>> {
    (1..=max_tasks).prop_flat_map(|num_tasks| {
        proptest::collection::vec(
            proptest::collection::vec(any::<usize>(), 0..num_tasks),
            num_tasks,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, picks)| {
                    if i == 0 {
                        BTreeSet::new()
                    } else {
                        picks.into_iter().map(|dep| dep % i).collect()
                    }
                })
                .collect()
        })
    })
}

/// Task `i` has id `i + 1` and produces object `i + 1`.
fn submission(deps: &[BTreeSet<usize>]) -> SubmissionBuilder {
    let mut builder = SubmissionBuilder::new();
    for (i, inputs) in deps.iter().enumerate() {
        let id = i as u64 + 1;
        let inputs: Vec<u64> = inputs.iter().map(|&dep| dep as u64 + 1).collect();
        builder = builder
            .object(id)
            .task_with(TaskSpecBuilder::new(id).inputs(&inputs).output(id));
    }
    builder
}

fn assert_within_capacity(h: &ClusterHarness) -> Result<(), TestCaseError> {
    for worker in h.governor.registry().workers() {
        prop_assert!(
            worker.committed.cpus <= worker.info.capacity.cpus,
            "worker {} over-committed: {:?} of {:?}",
            worker.id,
            worker.committed,
            worker.info.capacity
        );
    }
    Ok(())
}

proptest! {
    #[test]
    fn every_task_of_an_acyclic_graph_finishes(
        deps in dag_strategy(12),
        cpus in proptest::collection::vec(1u32..4, 1..4),
    ) {
        let mut h = ClusterHarness::new();
        for &c in &cpus {
            h.add_worker(c);
        }
        h.submit_new(submission(&deps));

        let mut ran = Vec::new();
        while let Some((worker, request)) = h.dispatches.pop_front() {
            assert_within_capacity(&h)?;
            h.ack(worker, request.task, request.attempt);
            h.finish(worker, &request);
            ran.push(request.task);
        }

        prop_assert_eq!(ran.len(), deps.len(), "each task runs exactly once");
        for (i, inputs) in deps.iter().enumerate() {
            let task = t(i as u64 + 1);
            prop_assert_eq!(h.state(task), Some(TaskState::Finished));
            let position = ran.iter().position(|&r| r == task);
            for &dep in inputs {
                let dep_position = ran.iter().position(|&r| r == t(dep as u64 + 1));
                prop_assert!(dep_position < position, "{} ran before its input producer", task);
            }
        }
    }

    #[test]
    fn failures_reach_exactly_the_downstream_tasks(
        deps in dag_strategy(10),
        failing in proptest::collection::btree_set(0usize..10, 0..3),
    ) {
        let mut h = ClusterHarness::new();
        h.add_worker(2);
        h.add_worker(2);
        h.submit_new(submission(&deps));

        while let Some((worker, request)) = h.dispatches.pop_front() {
            h.ack(worker, request.task, request.attempt);
            let index = (request.task.0 - 1) as usize;
            if failing.contains(&index) {
                h.fail(worker, &request, FailureReason::Application("boom".into()));
            } else {
                h.finish(worker, &request);
            }
        }

        // A task fails when it fails itself or any task upstream of it does.
        let mut doomed = vec![false; deps.len()];
        for (i, inputs) in deps.iter().enumerate() {
            doomed[i] = failing.contains(&i) || inputs.iter().any(|&dep| doomed[dep]);
        }
        for (i, &doomed) in doomed.iter().enumerate() {
            let expected = if doomed { TaskState::Failed } else { TaskState::Finished };
            prop_assert_eq!(h.state(t(i as u64 + 1)), Some(expected));
        }
    }
}
