//! # Order
//!
//! Resolves the before/after declarations of registered units into the order the auto patcher
//! applies them in.
//!
//! Units without a declared relation keep their registration order. Declarations naming a unit
//! that isn't registered impose nothing.

use std::collections::{BTreeSet, HashMap};

use log::warn;
use thiserror::Error;

use crate::registry::PatchRegistry;
use crate::unit::{PatchOrder, PatchUnit, UnitId};

/// Errors resolving the patch order
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderError {
    /// The declarations contradict each other. Holds the units on the cycle, closing on the first.
    #[error("Circular patch order: {}", cycle_path(.0))]
    Cycle(Vec<UnitId>),
}

/// Formats a cycle as `A -> B -> A`
fn cycle_path(units: &[UnitId]) -> String {
    units
        .iter()
        .map(|unit| unit.name())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Everything a unit declares, including declarations on the sites it would patch
pub fn declared_order(unit: &dyn PatchUnit) -> PatchOrder {
    let mut order = unit.order();
    for site in unit.scope().patchable_sites() {
        order.merge(&site.order);
    }
    order
}

/// Orders every registered unit so each one comes after everything it must follow
pub fn resolve_order(registry: &PatchRegistry) -> Result<Vec<UnitId>, OrderError> {
    let units: Vec<(UnitId, PatchOrder)> = registry
        .get_registered_auto_patches()
        .map(|(id, unit)| (id, declared_order(unit)))
        .collect();
    let index: HashMap<UnitId, usize> = units
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (*id, i))
        .collect();

    let mut successors = vec![BTreeSet::new(); units.len()];
    for (i, (id, order)) in units.iter().enumerate() {
        let edges = order
            .before
            .iter()
            .map(|other| (other, true))
            .chain(order.after.iter().map(|other| (other, false)));
        for (other, before) in edges {
            match index.get(other) {
                Some(&j) if j == i => {}
                Some(&j) if before => {
                    successors[i].insert(j);
                }
                Some(&j) => {
                    successors[j].insert(i);
                }
                None => {
                    warn!(
                        target: "autopatch::loading",
                        "{id} declares an order relative to {other}, which is not registered"
                    );
                }
            }
        }
    }

    let mut in_degree = vec![0usize; units.len()];
    for next in successors.iter().flatten() {
        in_degree[*next] += 1;
    }

    // lowest registration index first keeps unrelated units in registration order
    let mut ready: BTreeSet<usize> = (0..units.len()).filter(|i| in_degree[*i] == 0).collect();
    let mut sorted = Vec::with_capacity(units.len());
    while let Some(i) = ready.pop_first() {
        sorted.push(units[i].0);
        for &next in &successors[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if sorted.len() == units.len() {
        return Ok(sorted);
    }
    let cycle = find_cycle(&successors, &in_degree);
    Err(OrderError::Cycle(
        cycle.into_iter().map(|i| units[i].0).collect(),
    ))
}

/// Finds one cycle among the nodes Kahn's algorithm couldn't emit.
///
/// Every leftover node has a leftover predecessor, so walking predecessors must revisit a node.
fn find_cycle(successors: &[BTreeSet<usize>], in_degree: &[usize]) -> Vec<usize> {
    let leftover = |i: usize| in_degree[i] > 0;
    let mut predecessors = vec![Vec::new(); successors.len()];
    for (from, nexts) in successors.iter().enumerate() {
        for &to in nexts {
            if leftover(from) && leftover(to) {
                predecessors[to].push(from);
            }
        }
    }

    let Some(start) = (0..successors.len()).find(|i| leftover(*i)) else {
        return Vec::new();
    };
    let mut walk = vec![start];
    let mut seen = HashMap::from([(start, 0usize)]);
    let mut current = start;
    loop {
        let Some(&previous) = predecessors[current].first() else {
            return Vec::new();
        };
        if let Some(&position) = seen.get(&previous) {
            // the walk runs against the edges, flip it back
            let mut cycle: Vec<usize> = walk[position..].iter().rev().copied().collect();
            let lowest = cycle
                .iter()
                .enumerate()
                .min_by_key(|(_, unit)| **unit)
                .map_or(0, |(i, _)| i);
            cycle.rotate_left(lowest);
            cycle.push(cycle[0]);
            return cycle;
        }
        seen.insert(previous, walk.len());
        walk.push(previous);
        current = previous;
    }
}
