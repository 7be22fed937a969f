//! Deterministic scheduling: total order, reachability and liveness.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use crate::error::{error, ErrorKind, Result};
use crate::graph::Graph;
use crate::op::OpId;

/// Heap key: ready ops are drained by ascending pipeline stage, then
/// descending schedule priority, then ascending op id.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ReadyKey {
    stage: i64,
    priority: f64,
    op: OpId,
}

impl Eq for ReadyKey {}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Inverted so the max-heap pops the smallest logical key first.
        self.stage
            .cmp(&other.stage)
            .then_with(|| other.priority.total_cmp(&self.priority))
            .then_with(|| self.op.cmp(&other.op))
            .reverse()
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Dataflow successors plus explicit topological constraints, deduplicated.
fn direct_successors(graph: &Graph) -> Result<BTreeMap<OpId, BTreeSet<OpId>>> {
    let mut successors: BTreeMap<OpId, BTreeSet<OpId>> = BTreeMap::new();
    for id in graph.op_ids() {
        successors.entry(id).or_default();
        let op = graph.op(id)?;
        for (_, tensor) in op.outputs() {
            for consumer in graph.tensor(tensor)?.consumers.ops() {
                if consumer != id {
                    successors.entry(id).or_default().insert(consumer);
                }
            }
        }
    }
    for (before, after) in graph.topo_cons.iter() {
        if graph.has_op(before) && graph.has_op(after) {
            successors.entry(before).or_default().insert(after);
        }
    }
    Ok(successors)
}

/// A total order respecting every data dependency and every explicit
/// constraint. Deterministic for a given graph.
pub fn op_schedule(graph: &Graph) -> Result<Vec<OpId>> {
    let successors = direct_successors(graph)?;
    let mut in_degree: HashMap<OpId, usize> = successors.keys().map(|&id| (id, 0)).collect();
    for afters in successors.values() {
        for &after in afters {
            *in_degree.entry(after).or_insert(0) += 1;
        }
    }

    let mut ready = BinaryHeap::new();
    for (&id, &degree) in &in_degree {
        if degree == 0 {
            ready.push(ready_key(graph, id)?);
        }
    }

    let mut schedule = Vec::with_capacity(in_degree.len());
    while let Some(key) = ready.pop() {
        schedule.push(key.op);
        if let Some(afters) = successors.get(&key.op) {
            for &after in afters {
                let degree = in_degree
                    .get_mut(&after)
                    .ok_or_else(|| crate::error::Error::internal("successor missing from degree map"))?;
                *degree -= 1;
                if *degree == 0 {
                    ready.push(ready_key(graph, after)?);
                }
            }
        }
    }

    if schedule.len() != in_degree.len() {
        return Err(error!(
            ErrorKind::Cycle,
            "constraint graph is not a DAG: {} of {} ops schedulable",
            schedule.len(),
            in_degree.len()
        ));
    }
    Ok(schedule)
}

fn ready_key(graph: &Graph, op: OpId) -> Result<ReadyKey> {
    let op_ref = graph.op(op)?;
    Ok(ReadyKey {
        stage: op_ref.settings.pipeline_stage.unwrap_or(i64::MIN),
        priority: op_ref.settings.priority,
        op,
    })
}

/// Full forward-reachability map: each op's set of descendants along
/// dataflow and constraint edges. Consistent with [`op_schedule`].
pub fn edge_map(graph: &Graph) -> Result<BTreeMap<OpId, BTreeSet<OpId>>> {
    let successors = direct_successors(graph)?;
    let order = op_schedule(graph)?;
    let mut descendants: BTreeMap<OpId, BTreeSet<OpId>> = BTreeMap::new();
    for &op in order.iter().rev() {
        let mut reach = BTreeSet::new();
        if let Some(direct) = successors.get(&op) {
            for &next in direct {
                reach.insert(next);
                if let Some(transitive) = descendants.get(&next) {
                    reach.extend(transitive.iter().copied());
                }
            }
        }
        descendants.insert(op, reach);
    }
    Ok(descendants)
}

/// For each schedule position `i`, the set of already-run ops at least one
/// of whose outputs is still consumed by a later position.
pub fn live_sets(graph: &Graph, schedule: &[OpId]) -> Result<Vec<BTreeSet<OpId>>> {
    let position: HashMap<OpId, usize> = schedule
        .iter()
        .enumerate()
        .map(|(index, &op)| (op, index))
        .collect();

    let mut last_use: HashMap<OpId, usize> = HashMap::new();
    for &op in schedule {
        let op_ref = graph.op(op)?;
        let mut last = None;
        for (_, tensor) in op_ref.outputs() {
            for consumer in graph.tensor(tensor)?.consumers.ops() {
                if let Some(&pos) = position.get(&consumer) {
                    last = Some(last.map_or(pos, |l: usize| l.max(pos)));
                }
            }
        }
        if let Some(last) = last {
            last_use.insert(op, last);
        }
    }

    let mut sets = Vec::with_capacity(schedule.len());
    let mut live: BTreeSet<OpId> = BTreeSet::new();
    for (index, &op) in schedule.iter().enumerate() {
        if last_use.get(&op).is_some_and(|&last| last > index) {
            live.insert(op);
        }
        live.retain(|candidate| last_use.get(candidate).is_some_and(|&last| last > index));
        sets.push(live.clone());
    }
    Ok(sets)
}
