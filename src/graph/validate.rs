// src/graph/validate.rs

//! Submission validation. Runs before any state is touched.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::errors::GraphError;
use crate::graph::TaskGraph;
use crate::graph::submission::{ObjectSpec, TaskSpec};
use crate::store::ObjectStore;
use crate::types::{ObjectId, SessionId, TaskId};

pub(crate) fn validate_submission(
    graph: &TaskGraph,
    store: &ObjectStore,
    session: SessionId,
    tasks: &[TaskSpec],
    objects: &[ObjectSpec],
) -> Result<(), GraphError> {
    check_unique_tasks(graph, tasks)?;
    let declared = check_unique_objects(graph, objects)?;
    let producers = collect_producers(tasks, &declared)?;
    check_object_sources(objects, &producers)?;
    check_inputs(graph, store, session, tasks, &declared)?;
    check_acyclic(tasks, &producers)?;
    Ok(())
}

fn check_unique_tasks(graph: &TaskGraph, tasks: &[TaskSpec]) -> Result<(), GraphError> {
    let mut seen = BTreeSet::new();
    for task in tasks {
        if !seen.insert(task.id) || graph.task(task.id).is_some() {
            return Err(GraphError::DuplicateTask(task.id));
        }
    }
    Ok(())
}

fn check_unique_objects(
    graph: &TaskGraph,
    objects: &[ObjectSpec],
) -> Result<BTreeSet<ObjectId>, GraphError> {
    let mut declared = BTreeSet::new();
    for object in objects {
        if !declared.insert(object.id) || graph.object(object.id).is_some() {
            return Err(GraphError::DuplicateObject(object.id));
        }
    }
    Ok(declared)
}

fn collect_producers(
    tasks: &[TaskSpec],
    declared: &BTreeSet<ObjectId>,
) -> Result<BTreeMap<ObjectId, TaskId>, GraphError> {
    let mut producers: BTreeMap<ObjectId, TaskId> = BTreeMap::new();
    for task in tasks {
        for &object in &task.outputs {
            if !declared.contains(&object) {
                return Err(GraphError::UndeclaredOutput {
                    task: task.id,
                    object,
                });
            }
            if let Some(&first) = producers.get(&object) {
                return Err(GraphError::MultipleProducers {
                    object,
                    first,
                    second: task.id,
                });
            }
            producers.insert(object, task.id);
        }
    }
    Ok(producers)
}

fn check_object_sources(
    objects: &[ObjectSpec],
    producers: &BTreeMap<ObjectId, TaskId>,
) -> Result<(), GraphError> {
    for object in objects {
        match (object.data.is_some(), producers.contains_key(&object.id)) {
            (true, true) => return Err(GraphError::DataAndProducer(object.id)),
            (false, false) => return Err(GraphError::NoSource(object.id)),
            _ => {}
        }
    }
    Ok(())
}

fn check_inputs(
    graph: &TaskGraph,
    store: &ObjectStore,
    session: SessionId,
    tasks: &[TaskSpec],
    declared: &BTreeSet<ObjectId>,
) -> Result<(), GraphError> {
    for task in tasks {
        for &object in &task.inputs {
            if declared.contains(&object) {
                continue;
            }
            match graph.object(object) {
                None => {
                    return Err(GraphError::DanglingInput {
                        task: task.id,
                        object,
                    });
                }
                Some(node) if node.session != session => {
                    return Err(GraphError::ForeignObject {
                        task: task.id,
                        object,
                    });
                }
                Some(_) if store.is_removed(object) => {
                    return Err(GraphError::RemovedInput {
                        task: task.id,
                        object,
                    });
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Tasks of earlier submissions never consume objects of this one, so a
/// cycle can only involve new tasks.
fn check_acyclic(
    tasks: &[TaskSpec],
    producers: &BTreeMap<ObjectId, TaskId>,
) -> Result<(), GraphError> {
    // Edge direction: producer -> consumer.
    let mut graph: DiGraphMap<TaskId, ()> = DiGraphMap::new();

    for task in tasks {
        graph.add_node(task.id);
    }

    for task in tasks {
        for object in &task.inputs {
            if let Some(&producer) = producers.get(object) {
                graph.add_edge(producer, task.id, ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(GraphError::Cycle {
            task: cycle.node_id(),
        }),
    }
}
