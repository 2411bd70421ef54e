//! The single event loop. Socket pumps, admin handlers and site calls all
//! talk to it through [`HubHandle`]; it alone touches the [`Registry`].

use crate::admin::ConfigRequest;
use crate::agent_session::SessionSettings;
use crate::link::Link;
use crate::registry::{AgentSummary, Deferred, Registry};
use crate::site_comm::SiteComm;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

#[derive(Debug)]
pub enum HubEvent {
    AgentConnected {
        conn_id: String,
        link: Link,
        ip: String,
    },
    ViewerConnected {
        conn_id: String,
        link: Link,
    },
    Inbound {
        conn_id: String,
        raw: String,
    },
    Disconnected {
        conn_id: String,
    },
    ViewerTick {
        conn_id: String,
    },
    Configure {
        request: ConfigRequest,
        reply: oneshot::Sender<bool>,
    },
    ListAgents {
        reply: oneshot::Sender<Vec<AgentSummary>>,
    },
    SiteRegistered {
        conn_id: String,
        mac: String,
    },
    SiteDisconnected {
        mac: String,
    },
}

#[derive(Clone, Debug)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubEvent>,
    conn_counter: Arc<AtomicU64>,
}

impl HubHandle {
    pub fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("conn-{id}")
    }

    /// False once the loop has stopped.
    pub fn send(&self, event: HubEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// `None` when the loop is gone before answering.
    pub async fn configure(&self, request: ConfigRequest) -> Option<bool> {
        let (reply, rx) = oneshot::channel();
        if !self.send(HubEvent::Configure { request, reply }) {
            return None;
        }
        rx.await.ok()
    }

    pub async fn list_agents(&self) -> Vec<AgentSummary> {
        let (reply, rx) = oneshot::channel();
        if !self.send(HubEvent::ListAgents { reply }) {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

pub struct Hub {
    registry: Registry,
    rx: mpsc::UnboundedReceiver<HubEvent>,
    handle: HubHandle,
    site: Option<SiteComm>,
}

impl Hub {
    pub fn new(settings: SessionSettings, site: Option<SiteComm>) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = HubHandle {
            tx,
            conn_counter: Arc::new(AtomicU64::new(0)),
        };
        let hub = Self {
            registry: Registry::new(settings),
            rx,
            handle: handle.clone(),
            site,
        };
        (hub, handle)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(event = "hub_loop_start", site = self.site.is_some());
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = self.rx.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
            }
            self.flush_deferred();
        }
        info!(event = "hub_loop_stop");
    }

    fn dispatch(&mut self, event: HubEvent) {
        match event {
            HubEvent::AgentConnected { conn_id, link, ip } => {
                self.registry.open_agent(conn_id, link, ip)
            }
            HubEvent::ViewerConnected { conn_id, link } => self.registry.open_viewer(conn_id, link),
            HubEvent::Inbound { conn_id, raw } => self.registry.handle_message(&conn_id, &raw),
            HubEvent::Disconnected { conn_id } => self.registry.disconnect(&conn_id),
            HubEvent::ViewerTick { conn_id } => self.registry.viewer_tick(&conn_id),
            HubEvent::Configure { request, reply } => {
                let applied = self
                    .registry
                    .config_agent(&request.mac, &request.read, &request.write);
                let _ = reply.send(applied);
            }
            HubEvent::ListAgents { reply } => {
                let _ = reply.send(self.registry.agents_summary());
            }
            HubEvent::SiteRegistered { conn_id, mac } => {
                self.registry.site_registered(&conn_id, &mac)
            }
            HubEvent::SiteDisconnected { mac } => self.registry.site_disconnected(&mac),
        }
    }

    /// Viewer ticks go to the back of the queue so other connections get a
    /// turn in between. Site calls leave the loop entirely.
    fn flush_deferred(&mut self) {
        while let Some(job) = self.registry.take_deferred() {
            match job {
                Deferred::ViewerTick(conn_id) => {
                    self.handle.send(HubEvent::ViewerTick { conn_id });
                }
                Deferred::SiteRegister {
                    conn_id,
                    mac,
                    ip,
                    inter_face,
                } => {
                    let handle = self.handle.clone();
                    match self.site.clone() {
                        Some(site) => {
                            tokio::spawn(async move {
                                site.register(&mac, &ip, &inter_face).await;
                                handle.send(HubEvent::SiteRegistered { conn_id, mac });
                            });
                        }
                        None => {
                            debug!(event = "site_comm_disabled", mac = %mac);
                            handle.send(HubEvent::SiteRegistered { conn_id, mac });
                        }
                    }
                }
                Deferred::SiteDisconnect { mac } => {
                    let handle = self.handle.clone();
                    match self.site.clone() {
                        Some(site) => {
                            tokio::spawn(async move {
                                site.disconnect(&mac).await;
                                handle.send(HubEvent::SiteDisconnected { mac });
                            });
                        }
                        None => {
                            handle.send(HubEvent::SiteDisconnected { mac });
                        }
                    }
                }
            }
        }
    }
}
