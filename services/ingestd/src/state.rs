//! Shared service state: the engine plus its collaborators, wired once at
//! startup and cloned into every handler.

use sb_core::attention::{self, AttentionHandle};
use sb_core::bus::MessageBus;
use sb_core::collab::{ColdStorage, TokenVerifier};
use sb_core::config::CoreConfig;
use sb_core::load::{self, LoadHandle, ProcSampler, SystemSampler};
use sb_core::registry::SensorRegistry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<CoreConfig>,
    pub bus: MessageBus,
    pub registry: SensorRegistry,
    pub attention: AttentionHandle,
    pub load: LoadHandle,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl AppState {
    /// Wire the engine with the `/proc`-backed load sampler.
    pub fn new(
        cfg: CoreConfig,
        verifier: Arc<dyn TokenVerifier>,
        sink: Arc<dyn ColdStorage>,
    ) -> Self {
        Self::with_sampler(cfg, verifier, sink, Box::new(ProcSampler::default()))
    }

    /// Wire the engine with an explicit load sampler (tests inject one).
    pub fn with_sampler(
        cfg: CoreConfig,
        verifier: Arc<dyn TokenVerifier>,
        sink: Arc<dyn ColdStorage>,
        sampler: Box<dyn SystemSampler>,
    ) -> Self {
        let cfg = Arc::new(cfg);
        let bus = MessageBus::new(cfg.mailbox_capacity);
        let registry = SensorRegistry::new(bus.clone(), Arc::clone(&cfg), sink);
        let attention = attention::spawn(bus.clone(), Arc::clone(&cfg));
        let load = load::spawn(
            bus.clone(),
            registry.clone(),
            Arc::clone(&cfg),
            sampler,
        );
        Self {
            cfg,
            bus,
            registry,
            attention,
            load,
            verifier,
        }
    }
}
