// src/scheduler/mod.rs

//! Scheduler: places Ready tasks on workers.
//!
//! Each pass is a pure function of the task graph, the object store and the
//! worker registry; it returns a [`SchedulePlan`] and never blocks. Load
//! committed by earlier placements in the same pass counts against later
//! ones, so one pass fills every worker that has room.

pub mod placement;

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::config::SchedulerSection;
use crate::graph::{TaskGraph, TaskRecord};
use crate::registry::WorkerRegistry;
use crate::store::{Location, ObjectStore};
use crate::types::{ObjectId, Resources, WorkerId};

pub use placement::{Placement, SchedulePlan};

const MIB: f64 = 1024.0 * 1024.0;

/// Weights of the placement score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerWeights {
    pub locality_bonus: f64,
    pub load_penalty: f64,
    pub transfer_cost_per_mib: f64,
    pub replicate_shared_inputs: bool,
}

impl Default for SchedulerWeights {
    fn default() -> Self {
        Self::from(&SchedulerSection::default())
    }
}

impl From<&SchedulerSection> for SchedulerWeights {
    fn from(section: &SchedulerSection) -> Self {
        Self {
            locality_bonus: section.locality_bonus,
            load_penalty: section.load_penalty,
            transfer_cost_per_mib: section.transfer_cost_per_mib,
            replicate_shared_inputs: section.replicate_shared_inputs,
        }
    }
}

/// Worker state as seen during one pass.
struct WorkerView<'a> {
    id: WorkerId,
    capacity: Resources,
    committed: Resources,
    objects: &'a BTreeSet<ObjectId>,
}

impl WorkerView<'_> {
    fn fits(&self, request: &Resources) -> bool {
        self.committed.fits(request, &self.capacity)
    }

    fn load_fraction(&self) -> f64 {
        self.committed.fraction_of(&self.capacity)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    weights: SchedulerWeights,
}

impl Scheduler {
    pub fn new(weights: SchedulerWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &SchedulerWeights {
        &self.weights
    }

    /// Compute placements for the current Ready set.
    pub fn schedule(
        &self,
        graph: &TaskGraph,
        store: &ObjectStore,
        registry: &WorkerRegistry,
    ) -> SchedulePlan {
        let mut views: Vec<WorkerView<'_>> = registry
            .candidates()
            .map(|w| WorkerView {
                id: w.id,
                capacity: w.info.capacity,
                committed: w.committed,
                objects: &w.objects,
            })
            .collect();

        let mut plan = SchedulePlan::default();
        if views.is_empty() {
            return plan;
        }

        for task_id in graph.ready_tasks() {
            let Some(task) = graph.task(task_id) else {
                continue;
            };

            let Some(index) = self.pick_worker(task, store, &views) else {
                trace!(task = %task_id, "no worker has room for task");
                continue;
            };

            let view = &mut views[index];
            view.committed = view.committed.add(&task.resources);
            let replicate = self.replications(task, store, view);
            debug!(
                task = %task_id,
                worker = %view.id,
                replicate = replicate.len(),
                "task placed"
            );
            plan.placements.push(Placement {
                task: task_id,
                worker: view.id,
                replicate,
            });
        }

        plan
    }

    fn pick_worker(
        &self,
        task: &TaskRecord,
        store: &ObjectStore,
        views: &[WorkerView<'_>],
    ) -> Option<usize> {
        let fitting: Vec<usize> = views
            .iter()
            .enumerate()
            .filter(|(_, view)| view.fits(&task.resources))
            .map(|(index, _)| index)
            .collect();

        // Workers that timed out on this task are skipped unless nothing else fits.
        let preferred: Vec<usize> = fitting
            .iter()
            .copied()
            .filter(|&index| !task.avoid.contains(&views[index].id))
            .collect();
        let candidates = if preferred.is_empty() {
            fitting
        } else {
            preferred
        };

        if task.is_source() {
            return least_loaded(&candidates, views);
        }

        let mut best: Option<(usize, f64)> = None;
        for index in candidates {
            let score = self.score(task, store, &views[index]);
            trace!(task = %task.id, worker = %views[index].id, score, "placement score");
            // Views are in ascending worker id order; only a strictly better
            // score replaces the current best.
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((index, score)),
            }
        }
        best.map(|(index, _)| index)
    }

    /// Locality bonus minus load penalty minus transfer cost.
    fn score(&self, task: &TaskRecord, store: &ObjectStore, view: &WorkerView<'_>) -> f64 {
        let worker_objects = view.objects;
        let load_fraction = view.load_fraction();
        let inputs = task.distinct_inputs();
        let holds_any = inputs.iter().any(|input| worker_objects.contains(input));
        let remote_bytes: u64 = inputs
            .iter()
            .filter(|input| !worker_objects.contains(input))
            .map(|input| store.size(*input))
            .sum();

        let locality = if holds_any {
            self.weights.locality_bonus
        } else {
            0.0
        };
        let load = self.weights.load_penalty * load_fraction;
        let transfer = self.weights.transfer_cost_per_mib * (remote_bytes as f64 / MIB);

        locality - load - transfer
    }

    /// Remote inputs worth copying to the chosen worker because other tasks
    /// still need them.
    fn replications(
        &self,
        task: &TaskRecord,
        store: &ObjectStore,
        view: &WorkerView<'_>,
    ) -> Vec<ObjectId> {
        if !self.weights.replicate_shared_inputs {
            return Vec::new();
        }
        task.distinct_inputs()
            .into_iter()
            .filter(|input| !view.objects.contains(input))
            .filter(|input| {
                store.get(*input).is_some_and(|record| {
                    matches!(record.location, Location::Placed { .. }) && record.ref_count() > 1
                })
            })
            .collect()
    }
}

/// Lowest committed fraction; ties go to the lowest worker id.
fn least_loaded(candidates: &[usize], views: &[WorkerView<'_>]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for &index in candidates {
        let load = views[index].load_fraction();
        match best {
            Some((_, best_load)) if load >= best_load => {}
            _ => best = Some((index, load)),
        }
    }
    best.map(|(index, _)| index)
}

/// Per-worker sums of a plan, handy for assertions and logging.
pub fn committed_by_worker(plan: &SchedulePlan, graph: &TaskGraph) -> BTreeMap<WorkerId, Resources> {
    let mut totals: BTreeMap<WorkerId, Resources> = BTreeMap::new();
    for placement in &plan.placements {
        if let Some(task) = graph.task(placement.task) {
            let entry = totals.entry(placement.worker).or_default();
            *entry = entry.add(&task.resources);
        }
    }
    totals
}
