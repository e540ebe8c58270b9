//! Ordinal name resolution.
//!
//! A device proposes `prefix.ordinal` on the bus and keeps it if nobody
//! objects for a grace period. Objections are:
//!
//! - a probe for the same name from a device that wins the tie-break
//!   (lower `(id, address)`),
//! - `/name/registered` or a `/device` announcement for the name.
//!
//! After an objection the device waits a backoff and proposes the next
//! ordinal. Once locked, it answers probes for its name with
//! `/name/registered`.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::NamingConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Nothing proposed yet.
    Idle,
    Probing { since: Instant },
    Backoff { until: Instant },
    Locked,
    Failed,
}

/// What the device should do after a naming step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NamingAction {
    None,
    /// Broadcast a probe for the current proposal.
    Probe,
    /// Tell a prober the name is taken.
    Registered,
    /// The current proposal is now ours.
    Locked,
}

#[derive(Debug)]
pub(crate) struct Naming {
    prefix: String,
    config: NamingConfig,
    ordinal: u32,
    attempts: u32,
    /// Tie-break key; lower wins.
    id: u32,
    address: SocketAddr,
    state: State,
}

impl Naming {
    pub fn new(prefix: &str, config: NamingConfig, id: u32, address: SocketAddr) -> Self {
        Self {
            prefix: prefix.to_string(),
            ordinal: config.initial_ordinal,
            config,
            attempts: 0,
            id,
            address,
            state: State::Idle,
        }
    }

    pub fn name(&self) -> String {
        format!("{}.{}", self.prefix, self.ordinal)
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Advance timers.
    pub fn tick(&mut self, now: Instant) -> Result<NamingAction> {
        match self.state {
            State::Idle => self.propose(now),
            State::Backoff { until } if now >= until => {
                self.ordinal = self.ordinal.wrapping_add(1);
                self.propose(now)
            }
            State::Probing { since } if now.saturating_duration_since(since) >= self.grace() => {
                self.state = State::Locked;
                info!(name = %self.name(), attempts = self.attempts, "name locked");
                Ok(NamingAction::Locked)
            }
            State::Failed => Err(Error::NameResolutionFailed {
                prefix: self.prefix.clone(),
                attempts: self.attempts,
            }),
            _ => Ok(NamingAction::None),
        }
    }

    /// Another device probed `name`.
    pub fn on_probe(&mut self, name: &str, id: u32, from: SocketAddr, now: Instant) -> NamingAction {
        if name != self.name() {
            return NamingAction::None;
        }
        match self.state {
            State::Locked => NamingAction::Registered,
            State::Probing { .. } => {
                if (id, from) < (self.id, self.address) {
                    self.collide(now);
                    NamingAction::None
                } else {
                    // Make sure the other side hears about us.
                    NamingAction::Probe
                }
            }
            _ => NamingAction::None,
        }
    }

    /// Someone else holds `name`.
    pub fn on_taken(&mut self, name: &str, now: Instant) {
        if name == self.name() && matches!(self.state, State::Probing { .. }) {
            self.collide(now);
        }
    }

    fn propose(&mut self, now: Instant) -> Result<NamingAction> {
        if self.attempts >= self.config.max_attempts {
            self.state = State::Failed;
            return Err(Error::NameResolutionFailed { prefix: self.prefix.clone(), attempts: self.attempts });
        }
        self.attempts += 1;
        self.state = State::Probing { since: now };
        debug!(name = %self.name(), attempt = self.attempts, "probing name");
        Ok(NamingAction::Probe)
    }

    fn collide(&mut self, now: Instant) {
        debug!(name = %self.name(), "name collision");
        self.state = State::Backoff { until: now + Duration::from_millis(self.config.backoff_ms) };
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.config.grace_ms)
    }
}
