//! Readiness gating between consecutive launches.
//!
//! A [`ReadinessGate`] answers "can dependents of this service start yet?" for a
//! given elapsed time. [`await_ready`] drives a gate while listening to the
//! supervisor's event channel, so a crash or signal during a long wait is acted on
//! immediately instead of after the wait expires.
use std::{
    net::{TcpStream, ToSocketAddrs},
    sync::mpsc::{Receiver, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use reqwest::blocking::Client;
use tracing::{debug, trace};

use crate::{
    constants::{PROBE_ATTEMPT_TIMEOUT, READINESS_POLL_INTERVAL},
    services::{ProbeTarget, ReadinessPolicy, ServiceDescriptor},
    supervisor::Event,
};

/// Result of a single readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending,
    TimedOut,
}

/// Decides whether a launched service is ready for dependents.
pub trait ReadinessGate {
    fn check(&self, descriptor: &ServiceDescriptor, elapsed: Duration) -> Readiness;
}

/// Outcome of waiting on a gate.
#[derive(Debug)]
pub enum GateOutcome {
    Ready,
    TimedOut,
    /// Something arrived on the event channel before the service became ready.
    Interrupted(Event),
}

/// Gate that applies each descriptor's own [`ReadinessPolicy`].
#[derive(Debug, Clone)]
pub struct PolicyGate {
    client: Client,
}

impl PolicyGate {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(PROBE_ATTEMPT_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    fn probe(&self, target: &ProbeTarget) -> bool {
        match target {
            ProbeTarget::Tcp(address) => probe_tcp(address),
            ProbeTarget::Http(url) => match self.client.get(url).send() {
                Ok(response) => response.status().is_success(),
                Err(err) => {
                    trace!("Probe of {url} failed: {err}");
                    false
                }
            },
        }
    }
}

impl ReadinessGate for PolicyGate {
    fn check(&self, descriptor: &ServiceDescriptor, elapsed: Duration) -> Readiness {
        match &descriptor.readiness {
            ReadinessPolicy::Immediate => Readiness::Ready,
            ReadinessPolicy::Delay(delay) if elapsed >= *delay => Readiness::Ready,
            ReadinessPolicy::Delay(_) => Readiness::Pending,
            ReadinessPolicy::Probe { target, timeout } => {
                if self.probe(target) {
                    Readiness::Ready
                } else if elapsed >= *timeout {
                    Readiness::TimedOut
                } else {
                    Readiness::Pending
                }
            }
        }
    }
}

fn probe_tcp(address: &str) -> bool {
    let Ok(addrs) = address.to_socket_addrs() else {
        trace!("Probe address {address} did not resolve");
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, PROBE_ATTEMPT_TIMEOUT).is_ok())
}

/// Polls `gate` for `descriptor` until it is ready, times out, or an event arrives.
pub fn await_ready(
    gate: &dyn ReadinessGate,
    descriptor: &ServiceDescriptor,
    events: &Receiver<Event>,
) -> GateOutcome {
    let started = Instant::now();
    debug!(
        "Waiting for '{}' to become ready ({})",
        descriptor.name, descriptor.readiness
    );

    loop {
        // An event already queued wins over a gate that happens to be ready.
        if let Ok(event) = events.try_recv() {
            return GateOutcome::Interrupted(event);
        }

        match gate.check(descriptor, started.elapsed()) {
            Readiness::Ready => return GateOutcome::Ready,
            Readiness::TimedOut => return GateOutcome::TimedOut,
            Readiness::Pending => {}
        }

        match events.recv_timeout(READINESS_POLL_INTERVAL) {
            Ok(event) => return GateOutcome::Interrupted(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(READINESS_POLL_INTERVAL),
        }
    }
}
