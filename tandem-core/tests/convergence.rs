//! Randomized multi-replica editing. Whatever the interleaving of local
//! edits, undo/redo and partial syncs, replicas that have exchanged
//! everything must show the same text over an acyclic tree.

use proptest::prelude::*;
use proptest::test_runner::Config;

use tandem_core::{CrdtBuffer, Delta, NodeId};

#[derive(Debug, Clone)]
enum Step {
    Insert { replica: usize, at: f64, value: char },
    Delete { replica: usize, at: f64 },
    Undo { replica: usize },
    Redo { replica: usize },
    Sync { from: usize, to: usize },
}

fn step(replicas: usize) -> impl Strategy<Value = Step> {
    prop_oneof![
        5 => (0..replicas, 0.0..1.0f64, prop::char::range('a', 'z'))
            .prop_map(|(replica, at, value)| Step::Insert { replica, at, value }),
        3 => (0..replicas, 0.0..1.0f64).prop_map(|(replica, at)| Step::Delete { replica, at }),
        1 => (0..replicas).prop_map(|replica| Step::Undo { replica }),
        1 => (0..replicas).prop_map(|replica| Step::Redo { replica }),
        2 => (0..replicas, 0..replicas).prop_map(|(from, to)| Step::Sync { from, to }),
    ]
}

fn scaled(len: usize, at: f64) -> usize {
    ((len as f64) * at) as usize
}

/// Run the steps, returning the replicas and every delta any of them
/// produced, in production order.
fn run(replicas: usize, steps: &[Step]) -> (Vec<CrdtBuffer>, Vec<Delta>) {
    let mut buffers: Vec<CrdtBuffer> = (0..replicas)
        .map(|i| CrdtBuffer::new(format!("site{i}")))
        .collect();
    let mut log = Vec::new();

    for step in steps {
        match *step {
            Step::Insert { replica, at, value } => {
                let buffer = &mut buffers[replica];
                let pos = scaled(buffer.len() + 1, at);
                let parent = match pos {
                    0 => NodeId::root(),
                    p => buffer.node_id_at(p - 1),
                };
                let id = buffer.insert(value, &parent);
                log.push(buffer.delta_for(&[id], &[]));
            }
            Step::Delete { replica, at } => {
                let buffer = &mut buffers[replica];
                if buffer.is_empty() {
                    continue;
                }
                let id = buffer.node_id_at(scaled(buffer.len(), at));
                if buffer.delete_id(&id).is_some() {
                    log.push(buffer.delta_for(&[], &[id]));
                }
            }
            Step::Undo { replica } => {
                if let Some(edit) = buffers[replica].undo() {
                    log.push(edit.delta);
                }
            }
            Step::Redo { replica } => {
                if let Some(edit) = buffers[replica].redo() {
                    log.push(edit.delta);
                }
            }
            Step::Sync { from, to } => {
                let snapshot = buffers[from].snapshot();
                buffers[to].merge(&snapshot);
            }
        }
    }
    (buffers, log)
}

fn full_mesh(buffers: &mut [CrdtBuffer]) {
    let snapshots: Vec<Delta> = buffers.iter().map(|b| b.snapshot()).collect();
    for buffer in buffers.iter_mut() {
        for snapshot in &snapshots {
            buffer.merge(snapshot);
        }
    }
}

proptest! {
    #![proptest_config(Config {
        cases: 128,
        ..Config::default()
    })]

    #[test]
    fn replicas_converge_after_full_exchange(
        steps in prop::collection::vec(step(3), 1..80),
    ) {
        let (mut buffers, _) = run(3, &steps);
        full_mesh(&mut buffers);

        let text = buffers[0].document();
        for (i, buffer) in buffers.iter().enumerate() {
            prop_assert_eq!(&buffer.document(), &text, "replica {} diverged", i);
            prop_assert!(buffer.check_acyclic());
            prop_assert_eq!(buffer.pending_count(), 0);
            prop_assert_eq!(buffer.len(), text.chars().count());
        }
    }

    #[test]
    fn delivery_order_does_not_matter(
        steps in prop::collection::vec(step(2), 1..60),
        seed in any::<u64>(),
    ) {
        let (mut buffers, log) = run(2, &steps);
        full_mesh(&mut buffers);

        let mut in_order = CrdtBuffer::new("observer-a");
        for delta in &log {
            in_order.merge(delta);
        }

        // Deterministic shuffle driven by the seed.
        let mut shuffled = log.clone();
        let mut state = seed | 1;
        for i in (1..shuffled.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            shuffled.swap(i, (state % (i as u64 + 1)) as usize);
        }
        let mut out_of_order = CrdtBuffer::new("observer-b");
        for delta in shuffled.iter().rev() {
            out_of_order.merge(delta);
        }

        prop_assert_eq!(in_order.document(), buffers[0].document());
        prop_assert_eq!(out_of_order.document(), buffers[0].document());
        prop_assert_eq!(out_of_order.pending_count(), 0);
        prop_assert!(out_of_order.check_acyclic());
    }

    #[test]
    fn merge_is_idempotent(
        steps in prop::collection::vec(step(2), 1..50),
    ) {
        let (buffers, _) = run(2, &steps);
        let snapshot = buffers[1].snapshot();

        let mut once = buffers[0].clone();
        once.merge(&snapshot);
        let mut twice = once.clone();
        let outcome = twice.merge(&snapshot);

        prop_assert!(!outcome.changed());
        prop_assert_eq!(once.document(), twice.document());
        prop_assert_eq!(once.node_count(), twice.node_count());
    }
}
