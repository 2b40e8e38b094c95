//! snap-runner: headless runner for the token snapshot simulation.
//!
//! Usage:
//!   snap-runner --seed 12345 --scenario scenarios/ring.json
//!   snap-runner --seed 12345 --db run.db --max-ticks 5000

use anyhow::Result;
use std::env;
use tokensnap_core::{
    engine::Simulator,
    scenario::{Scenario, ScriptedAction},
    store::SimStore,
};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let max_ticks = parse_arg(&args, "--max-ticks", 10_000u64);
    let db = args
        .windows(2)
        .find(|w| w[0] == "--db")
        .map(|w| w[1].as_str())
        .unwrap_or(":memory:");
    let scenario_path = args
        .windows(2)
        .find(|w| w[0] == "--scenario")
        .map(|w| w[1].as_str());

    let scenario = match scenario_path {
        Some(path) => Scenario::load(path)?,
        None => default_scenario(),
    };

    println!("tokensnap — snap-runner");
    println!("  started:   {}", chrono::Utc::now().to_rfc3339());
    println!("  seed:      {seed}");
    println!("  scenario:  {}", scenario.name);
    println!("  servers:   {}", scenario.servers.len());
    println!("  db:        {db}");
    println!();

    let store = if db == ":memory:" {
        SimStore::in_memory()?
    } else {
        SimStore::open(db)?
    };
    store.migrate()?;

    let run_id = format!("run-{seed}-{}", uuid::Uuid::new_v4().simple());
    store.insert_run(&run_id, seed, env!("CARGO_PKG_VERSION"))?;

    let initial_total = scenario.total_tokens();
    let mut sim = Simulator::build(run_id.clone(), seed, store, &scenario)?;
    sim.run_until_idle(max_ticks)?;

    print_summary(&sim, &scenario, &run_id, initial_total)?;
    Ok(())
}

/// A three-server ring passing tokens around with one snapshot taken
/// mid-flight. Used when no scenario file is given.
fn default_scenario() -> Scenario {
    let mut scenario = Scenario::ring(3, 5);
    scenario.script = vec![
        ScriptedAction::PassTokens {
            tick: 1,
            src: "S1".into(),
            dest: "S2".into(),
            amount: 3,
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
    ];
    scenario
}

fn print_summary(
    sim: &Simulator,
    scenario: &Scenario,
    run_id: &str,
    initial_total: u64,
) -> Result<()> {
    println!("=== RUN SUMMARY ===");
    println!("  run_id:     {run_id}");
    println!("  final tick: {}", sim.clock.current_tick);
    println!("  servers:    {}", sim.server_count());
    println!("  tokens:     {initial_total}");

    let mut snapshot_ids = sim.collector.known_snapshots();
    snapshot_ids.sort_unstable();
    if snapshot_ids.is_empty() {
        println!("  (no snapshots taken)");
        return Ok(());
    }

    for snapshot_id in snapshot_ids {
        println!();
        println!("=== SNAPSHOT {snapshot_id} ===");
        if !sim.snapshot_complete(snapshot_id) {
            println!("  INCOMPLETE: {} of {} servers reported",
                sim.collector.reported_count(snapshot_id),
                sim.server_count());
            continue;
        }
        let snapshot = sim.collect_snapshot(snapshot_id)?;
        for (server, tokens) in &snapshot.tokens {
            println!("  {server}: {tokens} tokens");
        }
        for message in &snapshot.messages {
            println!("  in transit {} -> {}: {} tokens",
                message.src, message.dest, message.amount);
        }
        let total = snapshot.total_tokens();
        let verdict = if total == initial_total { "OK" } else { "VIOLATED" };
        println!("  conservation: {total} / {initial_total} [{verdict}]");
    }

    println!();
    let trace_rows = sim.store_events_for_run(run_id)?.len();
    println!("  trace rows: {trace_rows} ({} scripted actions)", scenario.script.len());
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
