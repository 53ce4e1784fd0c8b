//! Two engines wired together through the in-memory collaborators
#![allow(dead_code)]

use peercall_core::sim::{
    CaptureScript, MemoryHub, MemoryTransport, NetworkConditions, SimulatedCapture,
    SimulatedLinks, SimulatedPeerLink,
};
use peercall_core::{
    CallEngine, CallEngineConfig, CallEvent, MediaMode, PeerIdentityString, SignalingHandler,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

pub type Event = CallEvent<PeerIdentityString>;

/// Route engine logs through the test harness; `RUST_LOG` overrides the filter
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("peercall_core=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub struct Party {
    pub id: PeerIdentityString,
    pub remote: PeerIdentityString,
    pub engine: CallEngine<MemoryTransport>,
    pub transport: Arc<MemoryTransport>,
    pub capture: Arc<SimulatedCapture>,
    pub links: Arc<SimulatedLinks>,
    pub events: broadcast::Receiver<Event>,
}

impl Party {
    fn new(hub: &MemoryHub, id: &str, remote: &str, config: CallEngineConfig, script: CaptureScript) -> Self {
        let id = PeerIdentityString::new(id);
        let remote = PeerIdentityString::new(remote);
        let transport = Arc::new(hub.endpoint(id.clone()));
        let capture = Arc::new(SimulatedCapture::new(script));
        let links = Arc::new(SimulatedLinks::new());
        links.connect(&remote);
        let engine = CallEngine::builder(
            Arc::new(SignalingHandler::new(transport.clone())),
            capture.clone(),
            links.clone(),
        )
        .with_config(config)
        .build()
        .unwrap();
        let events = engine.subscribe_events();
        Self {
            id,
            remote,
            engine,
            transport,
            capture,
            links,
            events,
        }
    }

    /// This party's link to the other one
    pub fn link(&self) -> Arc<SimulatedPeerLink> {
        self.links.get(&self.remote).unwrap()
    }

    /// Handle every queued inbound message; returns how many there were
    pub async fn deliver(&self) -> usize {
        let mut handled = 0;
        while let Some((from, message)) = self.transport.try_next().await {
            self.engine.handle_message(from, message).await.unwrap();
            handled += 1;
        }
        handled
    }

    /// Events received since the last drain
    pub fn drain(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub struct Pair {
    pub hub: MemoryHub,
    pub alice: Party,
    pub bob: Party,
}

impl Pair {
    pub fn new() -> Self {
        Self::with(
            CallEngineConfig::default(),
            CallEngineConfig::default(),
            CaptureScript::default(),
            CaptureScript::default(),
        )
    }

    pub fn with(
        alice_config: CallEngineConfig,
        bob_config: CallEngineConfig,
        alice_script: CaptureScript,
        bob_script: CaptureScript,
    ) -> Self {
        init_tracing();
        let hub = MemoryHub::new();
        let alice = Party::new(&hub, "alice", "bob", alice_config, alice_script);
        let bob = Party::new(&hub, "bob", "alice", bob_config, bob_script);
        Self { hub, alice, bob }
    }

    /// Deliver messages back and forth until both inboxes are empty
    pub async fn pump(&self) -> usize {
        let mut total = 0;
        loop {
            let handled = self.alice.deliver().await + self.bob.deliver().await;
            if handled == 0 {
                return total;
            }
            total += handled;
        }
    }

    /// Alice calls bob, bob accepts, descriptions are exchanged
    pub async fn establish(&self, mode: MediaMode) {
        self.alice
            .engine
            .initiate_call(self.bob.id.clone(), mode)
            .await
            .unwrap();
        self.pump().await;
        self.bob.engine.accept_call().await.unwrap();
        self.pump().await;
    }

    pub fn count(&self, from: &Party, kind_name: &str) -> usize {
        self.hub.count(&from.id, kind_name)
    }
}

/// Config with both adaptive tracks switched off
pub fn static_quality() -> CallEngineConfig {
    let mut config = CallEngineConfig::default();
    config.adaptive.audio.enabled = false;
    config.adaptive.video.enabled = false;
    config
}

pub fn good_network() -> NetworkConditions {
    NetworkConditions {
        rtt_ms: 40.0,
        packet_loss: 0.0,
        jitter_ms: 4.0,
    }
}

pub fn bad_network() -> NetworkConditions {
    NetworkConditions {
        rtt_ms: 450.0,
        packet_loss: 0.06,
        jitter_ms: 80.0,
    }
}
