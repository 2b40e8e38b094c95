//! THE MOST IMPORTANT TEST IN THE PROJECT.
//!
//! Two simulators, same seed, same scenario.
//! They must produce byte-identical event traces.
//! Any divergence is a blocker — do not merge until fixed.

use tokensnap_core::{
    engine::Simulator,
    scenario::{Scenario, ScriptedAction},
    store::SimStore,
};

/// A ring with enough traffic that delivery delays, marker
/// propagation, and in-transit recording all show up in the trace.
fn scripted_ring() -> Scenario {
    let mut scenario = Scenario::ring(3, 12);
    scenario.script = vec![
        ScriptedAction::PassTokens {
            tick: 1,
            src: "S1".into(),
            dest: "S2".into(),
            amount: 4,
        },
        ScriptedAction::StartSnapshot {
            tick: 2,
            server: "S2".into(),
            snapshot_id: 1,
        },
        ScriptedAction::PassTokens {
            tick: 3,
            src: "S1".into(),
            dest: "S2".into(),
            amount: 2,
        },
        ScriptedAction::StartSnapshot {
            tick: 8,
            server: "S3".into(),
            snapshot_id: 2,
        },
    ];
    scenario
}

fn build_sim(seed: u64) -> Simulator {
    let store = SimStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    let run_id = format!("det-test-{seed}");
    store.insert_run(&run_id, seed, "0.1.0-test").expect("insert run");
    Simulator::build(run_id, seed, store, &scripted_ring()).expect("build")
}

fn collect_event_log(sim: &Simulator, run_id: &str) -> Vec<String> {
    // Collect all event payloads in tick+id order.
    (0..=sim.clock.current_tick)
        .flat_map(|tick| {
            sim.store_events_for_tick(run_id, tick)
                .expect("read events")
                .into_iter()
                .map(|e| e.payload)
        })
        .collect()
}

#[test]
fn same_seed_produces_identical_event_logs() {
    const SEED: u64 = 0xDEAD_BEEF_CAFE_1234;

    let mut sim_a = build_sim(SEED);
    let mut sim_b = build_sim(SEED);

    sim_a.run_until_idle(1_000).expect("sim_a run");
    sim_b.run_until_idle(1_000).expect("sim_b run");

    let log_a = collect_event_log(&sim_a, &format!("det-test-{SEED}"));
    let log_b = collect_event_log(&sim_b, &format!("det-test-{SEED}"));

    assert!(!log_a.is_empty(), "trace should not be empty");
    assert_eq!(
        log_a.len(), log_b.len(),
        "Event log lengths differ: {} vs {}",
        log_a.len(), log_b.len()
    );

    for (i, (a, b)) in log_a.iter().zip(log_b.iter()).enumerate() {
        assert_eq!(
            a, b,
            "Event log diverged at entry {i}:\n  A: {a}\n  B: {b}"
        );
    }
}

#[test]
fn different_seeds_produce_different_logs() {
    let mut sim_a = build_sim(42);
    let mut sim_b = build_sim(99);

    sim_a.run_until_idle(1_000).expect("run a");
    sim_b.run_until_idle(1_000).expect("run b");

    // Different seeds draw different link delays, so receive ticks must
    // diverge somewhere. This verifies the seed is actually being used.
    let log_a = collect_event_log(&sim_a, "det-test-42");
    let log_b = collect_event_log(&sim_b, "det-test-99");

    let any_different = log_a.len() != log_b.len()
        || log_a.iter().zip(log_b.iter()).any(|(a, b)| a != b);
    assert!(
        any_different,
        "Different seeds produced identical logs — seed is not being used"
    );
}

#[test]
fn same_seed_produces_identical_snapshots() {
    const SEED: u64 = 7;

    let mut sim_a = build_sim(SEED);
    let mut sim_b = build_sim(SEED);

    sim_a.run_until_idle(1_000).expect("sim_a run");
    sim_b.run_until_idle(1_000).expect("sim_b run");

    for snapshot_id in [1, 2] {
        let snap_a = sim_a.collect_snapshot(snapshot_id).expect("snapshot a");
        let snap_b = sim_b.collect_snapshot(snapshot_id).expect("snapshot b");
        assert_eq!(snap_a.tokens, snap_b.tokens);
        assert_eq!(snap_a.messages, snap_b.messages);
    }
}
