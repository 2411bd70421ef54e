//! Every live connection and the subscriptions between them.
//!
//! Owned by the hub loop and mutated only there, so nothing in here locks.
//! Work that has to leave the current event (viewer ticks, admin-site
//! calls) is queued as [`Deferred`] jobs for the loop to pick up.

use crate::agent_session::{AgentEffect, AgentSession, Outbox, SessionSettings};
use crate::link::Link;
use crate::viewer_session::ViewerSession;
use indexmap::{IndexMap, IndexSet};
use rpiws_core::binding::BindingRequest;
use rpiws_core::flow::TickOutcome;
use rpiws_core::protocol::{
    decode_message, AgentPresence, BrokerToViewer, InterfaceDescriptor, ViewerToBroker,
};
use rpiws_core::session::SessionError;
use rpiws_core::AgentId;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// WebSocket close code for policy violations.
pub const CLOSE_POLICY: u16 = 1008;

#[derive(Debug, Clone, PartialEq)]
pub enum Deferred {
    ViewerTick(String),
    SiteRegister {
        conn_id: String,
        mac: AgentId,
        ip: String,
        inter_face: InterfaceDescriptor,
    },
    SiteDisconnect {
        mac: AgentId,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentSummary {
    pub mac: AgentId,
    pub ip: String,
    pub state: &'static str,
    pub subscribers: usize,
}

struct AgentEntry {
    link: Link,
    ip: String,
    session: AgentSession,
}

struct ViewerEntry {
    link: Link,
    session: ViewerSession,
}

pub struct Registry {
    settings: SessionSettings,
    agents: IndexMap<String, AgentEntry>,
    agents_by_mac: HashMap<AgentId, String>,
    viewers: IndexMap<String, ViewerEntry>,
    subscribers: HashMap<AgentId, IndexSet<String>>,
    deferred: VecDeque<Deferred>,
}

impl Registry {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            agents: IndexMap::new(),
            agents_by_mac: HashMap::new(),
            viewers: IndexMap::new(),
            subscribers: HashMap::new(),
            deferred: VecDeque::new(),
        }
    }

    pub fn take_deferred(&mut self) -> Option<Deferred> {
        self.deferred.pop_front()
    }

    pub fn open_agent(&mut self, conn_id: String, link: Link, ip: String) {
        info!(event = "agent_connected", conn_id = %conn_id, ip = %ip);
        let session = AgentSession::new(self.settings.clone());
        self.agents.insert(conn_id, AgentEntry { link, ip, session });
    }

    pub fn open_viewer(&mut self, conn_id: String, link: Link) {
        info!(event = "viewer_connected", conn_id = %conn_id);
        self.viewers.insert(
            conn_id,
            ViewerEntry {
                link,
                session: ViewerSession::new(),
            },
        );
    }

    pub fn handle_message(&mut self, conn_id: &str, raw: &str) {
        debug!(event = "message_received", conn_id = %conn_id, raw = %raw);
        if self.agents.contains_key(conn_id) {
            self.handle_agent_message(conn_id, raw);
        } else if self.viewers.contains_key(conn_id) {
            self.handle_viewer_message(conn_id, raw);
        }
    }

    pub fn disconnect(&mut self, conn_id: &str) {
        if self.agents.contains_key(conn_id) {
            self.disconnect_agent(conn_id);
        } else {
            self.disconnect_viewer(conn_id);
        }
    }

    fn handle_agent_message(&mut self, conn_id: &str, raw: &str) {
        let Some(entry) = self.agents.get_mut(conn_id) else {
            return;
        };
        if entry.link.is_closing() {
            return;
        }
        let mut out = Outbox::default();
        let result = entry.session.on_message(raw, &mut out);
        self.flush_agent(conn_id, out);
        if let Err(err) = result {
            let reason = match err {
                SessionError::AuthenticationFailed { .. } => "authentication_failed",
                _ => "protocol_violation",
            };
            warn!(event = "agent_session_error", conn_id = %conn_id, error = %err);
            if let Some(entry) = self.agents.get(conn_id) {
                entry.link.close(CLOSE_POLICY, reason);
            }
        }
    }

    fn flush_agent(&mut self, conn_id: &str, out: Outbox) {
        let Some(entry) = self.agents.get(conn_id) else {
            return;
        };
        for msg in &out.messages {
            entry.link.send(msg);
        }
        let mac = entry.session.mac().map(str::to_owned);
        for effect in out.effects {
            match (effect, &mac) {
                (AgentEffect::Registered, Some(mac)) => self.register_agent(conn_id, mac),
                (AgentEffect::Presence(state), Some(mac)) => {
                    self.on_agent_presence(conn_id, mac, state)
                }
                (AgentEffect::NewData, Some(mac)) => self.on_agent_new_data(mac),
                (_, None) => {}
            }
        }
    }

    fn register_agent(&mut self, conn_id: &str, mac: &str) {
        if let Some(previous) = self
            .agents_by_mac
            .insert(mac.to_string(), conn_id.to_string())
        {
            if previous != conn_id {
                info!(event = "agent_replaced", mac = %mac, old_conn_id = %previous, conn_id = %conn_id);
                if let Some(old) = self.agents.get(&previous) {
                    old.link.close(CLOSE_POLICY, "replaced");
                }
            }
        }
        let Some(entry) = self.agents.get(conn_id) else {
            return;
        };
        info!(event = "agent_registered", conn_id = %conn_id, mac = %mac, ip = %entry.ip);
        self.deferred.push_back(Deferred::SiteRegister {
            conn_id: conn_id.to_string(),
            mac: mac.to_string(),
            ip: entry.ip.clone(),
            inter_face: entry.session.inter_face().clone(),
        });
    }

    fn owns_mac(&self, conn_id: &str, mac: &str) -> bool {
        self.agents_by_mac.get(mac).map(String::as_str) == Some(conn_id)
    }

    fn on_agent_presence(&mut self, conn_id: &str, mac: &str, state: AgentPresence) {
        if !self.owns_mac(conn_id, mac) {
            return;
        }
        info!(event = "agent_state", conn_id = %conn_id, mac = %mac, state = %state);
        if state == AgentPresence::Stream && self.subscriber_count(mac) > 0 {
            self.with_agent(mac, AgentSession::resume_streaming);
        }
        self.notify_state(mac, state);
    }

    /// Runs `op` against the agent currently owning `mac` and flushes
    /// whatever it queued.
    fn with_agent<F>(&mut self, mac: &str, op: F) -> bool
    where
        F: FnOnce(&mut AgentSession, &mut Outbox) -> bool,
    {
        let Some(conn_id) = self.agents_by_mac.get(mac).cloned() else {
            return false;
        };
        let Some(entry) = self.agents.get_mut(&conn_id) else {
            return false;
        };
        let mut out = Outbox::default();
        let applied = op(&mut entry.session, &mut out);
        self.flush_agent(&conn_id, out);
        applied
    }

    /// Presence broadcast. `config` only reaches the agent's subscribers.
    pub fn notify_state(&self, mac: &str, state: AgentPresence) {
        let msg = BrokerToViewer::RpiStateChange {
            rpi_mac: mac.to_string(),
            rpi_state: state,
        };
        if state == AgentPresence::Config {
            if let Some(subscribed) = self.subscribers.get(mac) {
                for conn_id in subscribed {
                    if let Some(viewer) = self.viewers.get(conn_id) {
                        viewer.link.send(&msg);
                    }
                }
            }
            return;
        }
        for viewer in self.viewers.values() {
            viewer.link.send(&msg);
        }
    }

    pub fn on_agent_new_data(&mut self, mac: &str) {
        let Some(subscribed) = self.subscribers.get(mac) else {
            return;
        };
        let subscribed: Vec<String> = subscribed.iter().cloned().collect();
        for conn_id in subscribed {
            self.schedule_tick(&conn_id);
        }
    }

    fn schedule_tick(&mut self, conn_id: &str) {
        if let Some(viewer) = self.viewers.get_mut(conn_id) {
            if viewer.session.schedule_tick() {
                self.deferred
                    .push_back(Deferred::ViewerTick(conn_id.to_string()));
            }
        }
    }

    /// One downstream sender tick for a viewer.
    pub fn viewer_tick(&mut self, conn_id: &str) {
        let Some(viewer) = self.viewers.get_mut(conn_id) else {
            return;
        };
        let source = viewer
            .session
            .agent()
            .and_then(|mac| self.agents_by_mac.get(mac))
            .and_then(|agent_conn| self.agents.get(agent_conn))
            .and_then(|entry| entry.session.transformed());
        let (outcome, frame) = viewer.session.poll_frame(source);
        if let Some(frame) = frame {
            viewer.link.send(&frame);
        }
        match outcome {
            TickOutcome::Sent => self.schedule_tick(conn_id),
            TickOutcome::Halted => {
                debug!(event = "viewer_window_closed", conn_id = %conn_id, credit = viewer.session.credit());
            }
            TickOutcome::Idle => {}
        }
    }

    fn handle_viewer_message(&mut self, conn_id: &str, raw: &str) {
        let Some(viewer) = self.viewers.get(conn_id) else {
            return;
        };
        if viewer.link.is_closing() {
            return;
        }
        let msg: ViewerToBroker = match decode_message(raw, self.settings.max_message_bytes) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(event = "viewer_message_invalid", conn_id = %conn_id, error = %err);
                viewer.link.close(CLOSE_POLICY, "protocol_violation");
                return;
            }
        };
        match msg {
            ViewerToBroker::ConnectRpi { rpi_mac } => {
                self.subscribe(conn_id, &rpi_mac);
            }
            ViewerToBroker::AckData { ack_count } => {
                if let Some(viewer) = self.viewers.get_mut(conn_id) {
                    viewer.session.grant(ack_count);
                }
                self.schedule_tick(conn_id);
            }
            ViewerToBroker::WriteData {
                inter_face_port,
                value,
            } => {
                let Some(mac) = viewer.session.agent().map(str::to_owned) else {
                    debug!(event = "write_without_subscription", conn_id = %conn_id);
                    return;
                };
                self.with_agent(&mac, |session, out| {
                    session.write_interface(&inter_face_port, value, out)
                });
            }
        }
    }

    /// Subscribes a viewer to an agent, moving it off any previous one.
    /// The first subscriber resumes the agent's stream.
    pub fn subscribe(&mut self, conn_id: &str, mac: &str) -> bool {
        if !self.agents_by_mac.contains_key(mac) {
            debug!(event = "subscribe_unknown_agent", conn_id = %conn_id, mac = %mac);
            return false;
        }
        let Some(viewer) = self.viewers.get(conn_id) else {
            return false;
        };
        if viewer.session.agent() != Some(mac) {
            self.unsubscribe(conn_id);
        }
        let Some(viewer) = self.viewers.get_mut(conn_id) else {
            return false;
        };
        viewer.session.subscribe(mac.to_string());
        let subscribed = self.subscribers.entry(mac.to_string()).or_default();
        let added = subscribed.insert(conn_id.to_string());
        let count = subscribed.len();
        info!(event = "viewer_subscribed", conn_id = %conn_id, mac = %mac, subscribers = count);
        if added && count == 1 {
            self.with_agent(mac, AgentSession::resume_streaming);
        }
        self.schedule_tick(conn_id);
        true
    }

    /// Drops the viewer's subscription. The last subscriber pauses the agent.
    pub fn unsubscribe(&mut self, conn_id: &str) -> Option<AgentId> {
        let mac = self.viewers.get_mut(conn_id)?.session.unsubscribe()?;
        let remaining = match self.subscribers.get_mut(&mac) {
            Some(subscribed) => {
                subscribed.shift_remove(conn_id);
                subscribed.len()
            }
            None => 0,
        };
        info!(event = "viewer_unsubscribed", conn_id = %conn_id, mac = %mac, subscribers = remaining);
        if remaining == 0 {
            self.subscribers.remove(&mac);
            self.with_agent(&mac, AgentSession::pause_streaming);
        }
        Some(mac)
    }

    pub fn disconnect_viewer(&mut self, conn_id: &str) {
        self.unsubscribe(conn_id);
        if self.viewers.shift_remove(conn_id).is_some() {
            info!(event = "viewer_disconnected", conn_id = %conn_id);
        }
    }

    pub fn disconnect_agent(&mut self, conn_id: &str) {
        let Some(mut entry) = self.agents.shift_remove(conn_id) else {
            return;
        };
        entry.session.teardown();
        let Some(mac) = entry.session.mac().map(str::to_owned) else {
            info!(event = "agent_disconnected", conn_id = %conn_id);
            return;
        };
        info!(event = "agent_disconnected", conn_id = %conn_id, mac = %mac);
        if !self.owns_mac(conn_id, &mac) {
            return;
        }
        self.agents_by_mac.remove(&mac);
        for viewer_conn in self.subscribers.remove(&mac).unwrap_or_default() {
            if let Some(viewer) = self.viewers.get_mut(&viewer_conn) {
                viewer.session.unsubscribe();
            }
        }
        self.deferred.push_back(Deferred::SiteDisconnect { mac });
    }

    /// Pushes a new binding configuration to the agent owning `mac`.
    pub fn config_agent(
        &mut self,
        mac: &str,
        reads: &[BindingRequest],
        writes: &[BindingRequest],
    ) -> bool {
        let applied = self.with_agent(mac, |session, out| session.configure(reads, writes, out));
        info!(event = "config_agent", mac = %mac, applied = applied);
        applied
    }

    pub fn site_registered(&mut self, conn_id: &str, mac: &str) {
        if self.owns_mac(conn_id, mac) {
            self.notify_state(mac, AgentPresence::Online);
        }
    }

    pub fn site_disconnected(&mut self, mac: &str) {
        if !self.agents_by_mac.contains_key(mac) {
            self.notify_state(mac, AgentPresence::Offline);
        }
    }

    pub fn subscriber_count(&self, mac: &str) -> usize {
        self.subscribers.get(mac).map_or(0, IndexSet::len)
    }

    pub fn is_streaming(&self, mac: &str) -> bool {
        self.agents_by_mac
            .get(mac)
            .and_then(|conn_id| self.agents.get(conn_id))
            .is_some_and(|entry| entry.session.is_streaming())
    }

    pub fn agents_summary(&self) -> Vec<AgentSummary> {
        let mut summary: Vec<AgentSummary> = self
            .agents_by_mac
            .iter()
            .filter_map(|(mac, conn_id)| {
                let entry = self.agents.get(conn_id)?;
                Some(AgentSummary {
                    mac: mac.clone(),
                    ip: entry.ip.clone(),
                    state: entry.session.phase()?.as_str(),
                    subscribers: self.subscriber_count(mac),
                })
            })
            .collect();
        summary.sort_by(|a, b| a.mac.cmp(&b.mac));
        summary
    }
}
