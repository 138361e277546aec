//! Property-based tests for the tracing compiler using proptest.
//!
//! Random expression DAGs are appended to fresh contexts and the
//! bookkeeping invariants are validated: element count propagation,
//! subtree accounting, reference count consistency and full collection
//! once every handle is gone.

use enoki_rs::{Trace, VarType};
use proptest::prelude::*;

// =============================================================================
// GENERATORS
// =============================================================================

/// One step of DAG construction; operand picks are reduced modulo the
/// number of variables built so far.
#[derive(Debug, Clone)]
enum Step {
    Literal,
    Unary(usize),
    Binary(usize, usize),
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Literal),
        (0usize..64).prop_map(Step::Unary),
        (0usize..64, 0usize..64).prop_map(|(a, b)| Step::Binary(a, b)),
    ]
}

fn arb_steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(arb_step(), 1..24)
}

/// Builds the DAG, returning every created index with its operand list.
fn build(trace: &mut Trace, steps: &[Step]) -> Vec<(u32, Vec<u32>)> {
    let a = trace
        .register_input(VarType::F32, 4, 0x1000, 0, false)
        .unwrap();
    let mut nodes = vec![(a, Vec::new())];
    for step in steps {
        let pick = |i: usize| nodes[i % nodes.len()].0;
        let (stmt, deps): (&str, Vec<u32>) = match *step {
            Step::Literal => ("mov.$t1 $r1, 0f3F800000", vec![]),
            Step::Unary(x) => ("neg.$t1 $r1, $r2", vec![pick(x)]),
            Step::Binary(x, y) => ("add.$t1 $r1, $r2, $r3", vec![pick(x), pick(y)]),
        };
        let index = trace.append(VarType::F32, stmt, &deps).unwrap();
        nodes.push((index, deps));
    }
    nodes
}

// =============================================================================
// INVARIANTS
// =============================================================================

proptest! {
    #[test]
    fn prop_element_count_is_max_of_operands(steps in arb_steps()) {
        let mut trace = Trace::new();
        let nodes = build(&mut trace, &steps);

        for (index, deps) in &nodes {
            let size = trace.var(*index).unwrap().size;
            if deps.is_empty() {
                // Inputs were registered with 4 lanes, literals with 1.
                prop_assert!(size == 1 || size == 4);
            } else {
                let expected = deps
                    .iter()
                    .map(|&d| trace.var(d).unwrap().size)
                    .max()
                    .unwrap();
                prop_assert_eq!(size, expected);
            }
        }
    }

    #[test]
    fn prop_subtree_size_accumulates(steps in arb_steps()) {
        let mut trace = Trace::new();
        let nodes = build(&mut trace, &steps);

        for (index, deps) in &nodes {
            let expected: usize = 1 + deps
                .iter()
                .map(|&d| trace.var(d).unwrap().subtree_size)
                .sum::<usize>();
            prop_assert_eq!(trace.var(*index).unwrap().subtree_size, expected);
        }
    }

    #[test]
    fn prop_internal_refs_count_consumers(steps in arb_steps()) {
        let mut trace = Trace::new();
        let nodes = build(&mut trace, &steps);

        for (index, _) in &nodes {
            let uses = nodes
                .iter()
                .flat_map(|(_, deps)| deps.iter())
                .filter(|&&d| d == *index)
                .count() as u32;
            let var = trace.var(*index).unwrap();
            prop_assert_eq!(var.ref_count_int, uses);
            prop_assert_eq!(var.ref_count_ext, 1);
        }
    }

    #[test]
    fn prop_compilation_succeeds_and_clears_dirty(steps in arb_steps()) {
        let mut trace = Trace::new();
        let nodes = build(&mut trace, &steps);
        trace.mark_dirty(nodes[0].0).unwrap();

        // Dirty state only matters for new consumers; compiling the
        // pending work must succeed and clear the queue.
        let kernels = trace.compile().unwrap();
        prop_assert!(kernels.len() <= 2); // at most one scalar and one 4-wide bucket
        for (index, _) in &nodes {
            prop_assert!(!trace.var(*index).unwrap().dirty);
        }
    }

    #[test]
    fn prop_dropping_every_handle_collects_everything(steps in arb_steps()) {
        let mut trace = Trace::new();
        let nodes = build(&mut trace, &steps);

        for (index, _) in &nodes {
            trace.dec_ref_ext(*index).unwrap();
        }
        prop_assert!(trace.is_empty());
    }

    #[test]
    fn prop_collection_is_order_independent(steps in arb_steps(), seed in 0u64..1024) {
        let mut trace = Trace::new();
        let mut nodes = build(&mut trace, &steps);

        // Drop handles in a shuffled order; the result must not depend
        // on it.
        let mut state = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut order = Vec::with_capacity(nodes.len());
        while !nodes.is_empty() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let pick = (state as usize) % nodes.len();
            order.push(nodes.swap_remove(pick).0);
        }
        for index in order {
            trace.dec_ref_ext(index).unwrap();
        }
        prop_assert!(trace.is_empty());
    }
}
