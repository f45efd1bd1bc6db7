use proptest::prelude::*;

use super::builders::plan_with_parents;
use flow_driver::ExecutionPlan;

/// Parent lists for `count` step groups; every parent precedes its child, so
/// the result is always a DAG
pub fn parents_strategy(max_groups: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..=max_groups).prop_flat_map(|count| {
        (0..count)
            .map(|group| {
                if group == 0 {
                    Just(Vec::new()).boxed()
                } else {
                    prop::collection::btree_set(0..group, 0..=group.min(3))
                        .prop_map(|parents| parents.into_iter().collect::<Vec<_>>())
                        .boxed()
                }
            })
            .collect::<Vec<_>>()
    })
}

pub fn plan_strategy(max_groups: usize) -> impl Strategy<Value = ExecutionPlan> {
    (parents_strategy(max_groups), 1usize..=3)
        .prop_map(|(parents, steps_per_group)| {
            plan_with_parents("generated", &parents, steps_per_group)
        })
}

pub fn flow_bid_strategy() -> impl Strategy<Value = f64> {
    0.5f64..1_000.0
}
