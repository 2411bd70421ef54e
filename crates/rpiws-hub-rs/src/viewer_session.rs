//! Broker side of one viewer connection: the subscription and the windowed
//! sender feeding it.

use indexmap::IndexMap;
use rpiws_core::buffer::DeltaBuffer;
use rpiws_core::flow::{AckWindow, TickOutcome};
use rpiws_core::protocol::{BrokerToViewer, ValueMap, WriteSample};
use rpiws_core::AgentId;
use serde_json::Value;

#[derive(Debug, Default)]
pub struct ViewerSession {
    agent: Option<AgentId>,
    read: DeltaBuffer<String, Value>,
    write: DeltaBuffer<String, WriteSample>,
    window: AckWindow,
    tick_scheduled: bool,
}

impl ViewerSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(&self) -> Option<&str> {
        self.agent.as_deref()
    }

    pub fn credit(&self) -> i32 {
        self.window.credit()
    }

    /// Starts a fresh subscription: empty buffers so the first frame carries
    /// the agent's full current state, and a reset window. Returns the
    /// previous agent, if any.
    pub fn subscribe(&mut self, agent: AgentId) -> Option<AgentId> {
        self.read.clear();
        self.write.clear();
        self.window.reset();
        self.agent.replace(agent)
    }

    pub fn unsubscribe(&mut self) -> Option<AgentId> {
        self.read.clear();
        self.write.clear();
        self.agent.take()
    }

    pub fn grant(&mut self, count: i32) {
        self.window.grant(count);
    }

    /// Marks a tick as pending. False when one already is.
    pub fn schedule_tick(&mut self) -> bool {
        !std::mem::replace(&mut self.tick_scheduled, true)
    }

    /// One sender tick: pulls the agent's latest transformed values in and,
    /// if anything changed and the window allows it, produces a DATA frame.
    pub fn poll_frame(
        &mut self,
        source: Option<(&ValueMap, &IndexMap<String, WriteSample>)>,
    ) -> (TickOutcome, Option<BrokerToViewer>) {
        self.tick_scheduled = false;
        if let Some((read, write)) = source {
            self.read.merge_from(read);
            self.write.merge_from(write);
        }
        if self.read.is_empty() && self.write.is_empty() {
            return (TickOutcome::Idle, None);
        }
        if !self.window.try_consume() {
            return (TickOutcome::Halted, None);
        }
        let frame = BrokerToViewer::Data {
            read: self.read.drain(),
            write: self.write.drain(),
        };
        (TickOutcome::Sent, Some(frame))
    }
}
