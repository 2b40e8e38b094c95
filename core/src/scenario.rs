//! Scenario files — a topology plus a scripted timeline.
//!
//! A scenario names the servers with their initial balances, the
//! directed links between them, and the actions the harness injects at
//! given ticks. Scenarios are plain JSON on disk; the built-in
//! constructors cover the topologies the tests and the runner default
//! workload use.

use crate::error::{SimError, SimResult};
use crate::types::{ServerId, SnapshotId, Tick, TokenCount};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    pub id: ServerId,
    pub tokens: TokenCount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSpec {
    pub src: ServerId,
    pub dest: ServerId,
}

/// A harness-injected action. Ticks start at 1: the clock advances
/// before scripted actions fire, so nothing can be scheduled "before
/// the simulation starts".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScriptedAction {
    PassTokens {
        tick: Tick,
        src: ServerId,
        dest: ServerId,
        amount: TokenCount,
    },
    StartSnapshot {
        tick: Tick,
        server: ServerId,
        snapshot_id: SnapshotId,
    },
}

impl ScriptedAction {
    pub fn tick(&self) -> Tick {
        match self {
            Self::PassTokens { tick, .. } => *tick,
            Self::StartSnapshot { tick, .. } => *tick,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub servers: Vec<ServerSpec>,
    pub links: Vec<LinkSpec>,
    #[serde(default)]
    pub script: Vec<ScriptedAction>,
}

impl Scenario {
    pub fn from_json(json: &str) -> SimResult<Self> {
        let scenario: Scenario = serde_json::from_str(json)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: impl AsRef<Path>) -> SimResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Reject topologies and scripts the simulator cannot honor.
    pub fn validate(&self) -> SimResult<()> {
        let mut ids = BTreeSet::new();
        for server in &self.servers {
            if !ids.insert(server.id.as_str()) {
                return Err(invalid(format!("duplicate server id '{}'", server.id)));
            }
        }
        for link in &self.links {
            if link.src == link.dest {
                return Err(invalid(format!("self-link on server '{}'", link.src)));
            }
            for endpoint in [&link.src, &link.dest] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(invalid(format!("link names unknown server '{endpoint}'")));
                }
            }
        }
        for action in &self.script {
            if action.tick() < 1 {
                return Err(invalid("scripted actions must fire at tick >= 1".into()));
            }
            match action {
                ScriptedAction::PassTokens { src, dest, amount, .. } => {
                    if *amount == 0 {
                        return Err(invalid(format!("zero-token transfer from '{src}'")));
                    }
                    for endpoint in [src, dest] {
                        if !ids.contains(endpoint.as_str()) {
                            return Err(invalid(format!(
                                "script names unknown server '{endpoint}'"
                            )));
                        }
                    }
                }
                ScriptedAction::StartSnapshot { server, .. } => {
                    if !ids.contains(server.as_str()) {
                        return Err(invalid(format!("script names unknown server '{server}'")));
                    }
                }
            }
        }
        Ok(())
    }

    /// Tokens present in the system before any message moves.
    pub fn total_tokens(&self) -> TokenCount {
        self.servers.iter().map(|s| s.tokens).sum()
    }

    pub fn last_scripted_tick(&self) -> Tick {
        self.script.iter().map(ScriptedAction::tick).max().unwrap_or(0)
    }

    /// Two servers, links both ways. The canonical smoke topology.
    pub fn pair(tokens_a: TokenCount, tokens_b: TokenCount) -> Self {
        Self {
            name: "pair".into(),
            servers: vec![
                ServerSpec { id: "A".into(), tokens: tokens_a },
                ServerSpec { id: "B".into(), tokens: tokens_b },
            ],
            links: vec![
                LinkSpec { src: "A".into(), dest: "B".into() },
                LinkSpec { src: "B".into(), dest: "A".into() },
            ],
            script: Vec::new(),
        }
    }

    /// A unidirectional ring of `n` servers with every token on the
    /// first one. Server ids count up from "S1".
    pub fn ring(n: usize, tokens: TokenCount) -> Self {
        assert!(n >= 2, "a ring needs at least two servers");
        let servers: Vec<ServerSpec> = (1..=n)
            .map(|i| ServerSpec {
                id: format!("S{i}"),
                tokens: if i == 1 { tokens } else { 0 },
            })
            .collect();
        let links = (0..n)
            .map(|i| LinkSpec {
                src: servers[i].id.clone(),
                dest: servers[(i + 1) % n].id.clone(),
            })
            .collect();
        Self {
            name: format!("ring-{n}"),
            servers,
            links,
            script: Vec::new(),
        }
    }
}

fn invalid(reason: String) -> SimError {
    SimError::InvalidScenario { reason }
}
