//! The simulation engine — the event loop driving the snapshot protocol.
//!
//! TICK ORDER (fixed, documented, never reordered):
//!   1. Advance the clock.
//!   2. Apply scripted actions due at the new tick, in script order.
//!   3. Scan links in sorted (src, dest) order and deliver every due
//!      head-of-queue message, FIFO within each link.
//!
//! RULES:
//!   - Execution is fully serialized: one message delivered at a time.
//!   - Servers mutate only their own state; everything else happens by
//!     applying the actions they return.
//!   - All randomness flows through the RngBank.
//!   - Every send, receive, and snapshot step is recorded in the trace.

use crate::{
    clock::SimClock,
    collector::{CollectedSnapshot, InTransitMessage, SnapshotCollector},
    error::{SimError, SimResult},
    event::{EventLogEntry, Message, SimEvent},
    link::{Link, ScheduledMessage},
    rng::{RngBank, RngSlot, SimRng},
    scenario::{Scenario, ScriptedAction},
    server::{Action, Server},
    store::SimStore,
    types::{RunId, ServerId, SnapshotId, Tick, TokenCount},
};
use std::collections::{BTreeMap, VecDeque};

/// Upper bound (exclusive) on the random extra delivery delay. A send
/// at tick t arrives somewhere in [t + 1, t + MAX_LINK_DELAY].
pub const MAX_LINK_DELAY: Tick = 5;

pub struct Simulator {
    pub run_id: RunId,
    pub clock: SimClock,
    pub collector: SnapshotCollector,
    delivery_rng: SimRng,
    seed: u64,
    servers: BTreeMap<ServerId, Server>,
    links: BTreeMap<(ServerId, ServerId), Link>,
    script: VecDeque<ScriptedAction>,
    store: SimStore,
}

impl Simulator {
    pub fn new(run_id: RunId, seed: u64, store: SimStore) -> Self {
        let rng_bank = RngBank::new(seed);
        Self {
            clock: SimClock::new(run_id.clone()),
            collector: SnapshotCollector::new(),
            delivery_rng: rng_bank.stream(RngSlot::Delivery),
            seed,
            servers: BTreeMap::new(),
            links: BTreeMap::new(),
            script: VecDeque::new(),
            store,
            run_id,
        }
    }

    /// Build a fully wired simulator from a scenario: servers, links,
    /// and the scripted timeline. Call this instead of new() + manual
    /// topology calls.
    pub fn build(run_id: RunId, seed: u64, store: SimStore, scenario: &Scenario) -> SimResult<Self> {
        scenario.validate()?;
        let mut sim = Simulator::new(run_id, seed, store);
        for server in &scenario.servers {
            sim.add_server(&server.id, server.tokens)?;
        }
        for link in &scenario.links {
            sim.add_link(&link.src, &link.dest)?;
        }
        let mut script = scenario.script.clone();
        // Stable by-tick sort keeps same-tick actions in file order.
        script.sort_by_key(ScriptedAction::tick);
        sim.script = script.into();
        Ok(sim)
    }

    // ── Topology ───────────────────────────────────────────────

    pub fn add_server(&mut self, id: &ServerId, tokens: TokenCount) -> SimResult<()> {
        if self.servers.contains_key(id) {
            return Err(SimError::DuplicateServer { id: id.clone() });
        }
        self.servers.insert(id.clone(), Server::new(id.clone(), tokens));
        Ok(())
    }

    /// Add a unidirectional link. Self-links are ignored.
    pub fn add_link(&mut self, src: &ServerId, dest: &ServerId) -> SimResult<()> {
        if src == dest {
            log::debug!("ignoring self-link on server {src}");
            return Ok(());
        }
        for id in [src, dest] {
            if !self.servers.contains_key(id) {
                return Err(SimError::UnknownServer { id: id.clone() });
            }
        }
        self.links
            .entry((src.clone(), dest.clone()))
            .or_insert_with(|| Link::new(src.clone(), dest.clone()));
        if let Some(server) = self.servers.get_mut(src) {
            server.add_outbound(dest);
        }
        if let Some(server) = self.servers.get_mut(dest) {
            server.add_inbound(src);
        }
        Ok(())
    }

    // ── Harness entry points ───────────────────────────────────

    /// Start the snapshot algorithm at one server. Re-initiating a
    /// known id is a no-op and leaves no trace row.
    pub fn start_snapshot(&mut self, server_id: &ServerId, snapshot_id: SnapshotId) -> SimResult<()> {
        let actions = match self.servers.get_mut(server_id) {
            Some(server) => server.start_snapshot(snapshot_id),
            None => return Err(SimError::UnknownServer { id: server_id.clone() }),
        };
        if actions.is_empty() {
            return Ok(());
        }
        let tick = self.clock.current_tick;
        self.record_event(
            server_id,
            &SimEvent::SnapshotInitiated {
                tick,
                server: server_id.clone(),
                snapshot_id,
            },
        )?;
        self.apply_actions(server_id, actions)
    }

    /// Move tokens from `src` toward `dest`. Fatal on over-send or an
    /// unknown destination — recovering would corrupt conservation.
    pub fn send_tokens(&mut self, src: &ServerId, amount: TokenCount, dest: &ServerId) -> SimResult<()> {
        let actions = match self.servers.get_mut(src) {
            Some(server) => server.send_tokens(amount, dest)?,
            None => return Err(SimError::UnknownServer { id: src.clone() }),
        };
        self.apply_actions(src, actions)
    }

    // ── The tick loop ──────────────────────────────────────────

    /// Advance one tick. This is the core simulation step.
    pub fn tick(&mut self) -> SimResult<()> {
        assert!(!self.clock.paused, "tick() called on paused engine");
        let now = self.clock.advance();

        // Scripted actions due at this tick fire before any delivery.
        loop {
            match self.script.front() {
                Some(action) if action.tick() <= now => {}
                _ => break,
            }
            if let Some(action) = self.script.pop_front() {
                self.apply_scripted(&action)?;
            }
        }

        // Deliver every due head-of-queue message, links in sorted
        // order. New sends land at tick now + 1 at the earliest, so the
        // scan cannot loop.
        let link_ids: Vec<(ServerId, ServerId)> = self.links.keys().cloned().collect();
        for key in link_ids {
            while let Some(message) = self.links.get_mut(&key).and_then(|l| l.pop_due(now)) {
                self.deliver(message)?;
            }
        }
        Ok(())
    }

    /// Run n ticks in a loop. Used for testing and fast-forward.
    pub fn run_ticks(&mut self, n: u64) -> SimResult<()> {
        self.emit_run_initialized()?;
        self.clock.resume();
        for _ in 0..n {
            self.tick()?;
        }
        self.clock.pause();
        Ok(())
    }

    /// Tick until the script is exhausted and every link is empty, or
    /// fail once the budget runs out.
    pub fn run_until_idle(&mut self, max_ticks: Tick) -> SimResult<()> {
        self.emit_run_initialized()?;
        self.clock.resume();
        while !self.idle() {
            if self.clock.current_tick >= max_ticks {
                self.clock.pause();
                return Err(SimError::Other(anyhow::anyhow!(
                    "simulation did not quiesce within {max_ticks} ticks"
                )));
            }
            self.tick()?;
        }
        self.clock.pause();
        Ok(())
    }

    /// No pending scripted actions and no message on any link.
    pub fn idle(&self) -> bool {
        self.script.is_empty() && self.links.values().all(Link::is_empty)
    }

    // ── Results and accessors ──────────────────────────────────

    pub fn snapshot_complete(&self, snapshot_id: SnapshotId) -> bool {
        self.collector.is_complete(snapshot_id, self.servers.len())
    }

    pub fn collect_snapshot(&self, snapshot_id: SnapshotId) -> SimResult<CollectedSnapshot> {
        self.collector.collect(snapshot_id, self.servers.len())
    }

    /// Tokens held on servers plus tokens sitting on links. Constant
    /// for the lifetime of a run.
    pub fn total_tokens(&self) -> TokenCount {
        let held: TokenCount = self.servers.values().map(|s| s.tokens).sum();
        let in_flight: TokenCount = self
            .links
            .values()
            .flat_map(|link| link.pending())
            .map(|m| match &m.message {
                Message::Token { amount } => *amount,
                Message::Marker { .. } => 0,
            })
            .sum();
        held + in_flight
    }

    pub fn server(&self, id: &ServerId) -> Option<&Server> {
        self.servers.get(id)
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Query trace events for a specific tick from the store.
    /// Used by the determinism test and replay tooling.
    pub fn store_events_for_tick(&self, run_id: &str, tick: Tick) -> SimResult<Vec<EventLogEntry>> {
        self.store.events_for_tick(run_id, tick)
    }

    /// Query the full trace for a run, in append order.
    pub fn store_events_for_run(&self, run_id: &str) -> SimResult<Vec<EventLogEntry>> {
        self.store.events_for_run(run_id)
    }

    // ── Internals ──────────────────────────────────────────────

    fn apply_scripted(&mut self, action: &ScriptedAction) -> SimResult<()> {
        match action {
            ScriptedAction::PassTokens { src, dest, amount, .. } => {
                self.send_tokens(src, *amount, dest)
            }
            ScriptedAction::StartSnapshot { server, snapshot_id, .. } => {
                self.start_snapshot(server, *snapshot_id)
            }
        }
    }

    /// Opaque future delivery tick for a send queued now.
    fn receive_time(&mut self) -> Tick {
        self.clock.current_tick + 1 + self.delivery_rng.next_u64_below(MAX_LINK_DELAY)
    }

    fn deliver(&mut self, message: ScheduledMessage) -> SimResult<()> {
        let ScheduledMessage { src, dest, message, .. } = message;
        let tick = self.clock.current_tick;
        self.record_event(
            &dest,
            &SimEvent::MessageReceived {
                tick,
                src: src.clone(),
                dest: dest.clone(),
                message: message.clone(),
            },
        )?;
        let actions = match self.servers.get_mut(&dest) {
            Some(server) => server.handle_packet(&src, message),
            None => return Err(SimError::UnknownServer { id: dest.clone() }),
        };
        self.apply_actions(&dest, actions)
    }

    /// Apply what a server asked for. Sends are traced before they are
    /// queued, so the trace reflects causal send order even though
    /// delivery is link-delayed.
    fn apply_actions(&mut self, origin: &ServerId, actions: Vec<Action>) -> SimResult<()> {
        let tick = self.clock.current_tick;
        for action in actions {
            match action {
                Action::Send { dest, message } => {
                    self.record_event(
                        origin,
                        &SimEvent::MessageSent {
                            tick,
                            src: origin.clone(),
                            dest: dest.clone(),
                            message: message.clone(),
                        },
                    )?;
                    let deliver_at = self.receive_time();
                    match self.links.get_mut(&(origin.clone(), dest.clone())) {
                        Some(link) => link.push(ScheduledMessage {
                            src: origin.clone(),
                            dest,
                            message,
                            deliver_at,
                        }),
                        None => {
                            return Err(SimError::UnknownNeighbor {
                                server: origin.clone(),
                                dest,
                            })
                        }
                    }
                }
                Action::RecordBalance { snapshot_id, tokens } => {
                    self.collector.record_balance(snapshot_id, origin, tokens);
                    self.record_event(
                        origin,
                        &SimEvent::StateRecorded {
                            tick,
                            server: origin.clone(),
                            snapshot_id,
                            tokens,
                        },
                    )?;
                }
                Action::RecordInTransit { snapshot_id, src, amount } => {
                    self.collector.record_in_transit(
                        snapshot_id,
                        InTransitMessage {
                            src: src.clone(),
                            dest: origin.clone(),
                            amount,
                        },
                    );
                    self.record_event(
                        origin,
                        &SimEvent::InTransitRecorded {
                            tick,
                            snapshot_id,
                            src,
                            dest: origin.clone(),
                            amount,
                        },
                    )?;
                }
                Action::SnapshotDone { snapshot_id } => {
                    // The collector guard makes the notification
                    // exactly-once per (server, snapshot).
                    if self.collector.notify_complete(origin, snapshot_id) {
                        log::info!(
                            "tick={tick} server {origin} completed snapshot {snapshot_id}"
                        );
                        self.record_event(
                            origin,
                            &SimEvent::ServerSnapshotComplete {
                                tick,
                                server: origin.clone(),
                                snapshot_id,
                            },
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_run_initialized(&mut self) -> SimResult<()> {
        // Emit at tick 0 only, so seed differences are observable from
        // the very first trace row.
        if self.clock.current_tick != 0 {
            return Ok(());
        }
        let event = SimEvent::RunInitialized {
            run_id: self.run_id.clone(),
            seed: self.seed,
        };
        let engine_id: ServerId = "engine".into();
        self.record_event(&engine_id, &event)
    }

    fn record_event(&self, server: &ServerId, event: &SimEvent) -> SimResult<()> {
        let entry = EventLogEntry {
            id: None,
            run_id: self.run_id.clone(),
            tick: self.clock.current_tick,
            server: server.clone(),
            event_type: event_type_name(event).to_string(),
            payload: serde_json::to_string(event)?,
        };
        self.store.append_event(&entry)
    }
}

/// Extract a stable string name from a SimEvent variant.
/// Used for the event_type column in event_log.
fn event_type_name(event: &SimEvent) -> &'static str {
    match event {
        SimEvent::RunInitialized { .. }         => "run_initialized",
        SimEvent::MessageSent { .. }            => "message_sent",
        SimEvent::MessageReceived { .. }        => "message_received",
        SimEvent::SnapshotInitiated { .. }      => "snapshot_initiated",
        SimEvent::StateRecorded { .. }          => "state_recorded",
        SimEvent::InTransitRecorded { .. }      => "in_transit_recorded",
        SimEvent::ServerSnapshotComplete { .. } => "server_snapshot_complete",
    }
}
