//! The pipeline as a whole: per-request lifecycle and a launcher that wires
//! every stage and dispatcher together in one process.

use crate::config::{DEFAULT_HOP_TIMEOUT_SECS, DEFAULT_MAX_PAYLOAD_SIZE, StageConfig, StageKind};
use crate::lb_state::{LBConfig, LBState};
use crate::server::{dispatcher_server, stage_server};
use crate::stage_link::StageLink;
use actix_web::dev::ServerHandle;
use std::collections::HashMap;
use std::net::TcpListener;
use tracing::info;

/// Lifecycle of one request inside one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Transformed,
    Forwarding,
    Succeeded,
    Failed,
    Responded,
}

impl RequestState {
    pub fn can_advance_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Received, Transformed)
                | (Received, Failed)
                | (Transformed, Forwarding)
                | (Transformed, Succeeded)
                | (Forwarding, Succeeded)
                | (Forwarding, Failed)
                | (Succeeded, Responded)
                | (Failed, Responded)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == RequestState::Responded
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestTrace {
    states: Vec<RequestState>,
}

impl Default for RequestTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTrace {
    pub fn new() -> Self {
        RequestTrace {
            states: vec![RequestState::Received],
        }
    }

    pub fn current(&self) -> RequestState {
        *self.states.last().unwrap_or(&RequestState::Received)
    }

    pub fn advance(&mut self, next: RequestState) {
        debug_assert!(
            self.current().can_advance_to(next),
            "invalid transition {:?} -> {:?}",
            self.current(),
            next
        );
        self.states.push(next);
    }

    pub fn states(&self) -> &[RequestState] {
        &self.states
    }
}

/// Topology of a full chain running on one host: every stage gets a
/// dispatcher plus `instances_per_stage` workers.
#[derive(Debug, Clone)]
pub struct PipelineChain {
    host: String,
    base_port: Option<u16>,
    instances_per_stage: usize,
    timeout: u64,
    fail_rates: HashMap<StageKind, f32>,
    workers: usize,
}

pub struct ChainHandle {
    pub ingress_url: String,
    dispatchers: Vec<(StageKind, String)>,
    handles: Vec<ServerHandle>,
}

impl ChainHandle {
    pub fn dispatcher_url(&self, kind: StageKind) -> Option<&str> {
        self.dispatchers
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, url)| url.as_str())
    }

    /// Stops every server without waiting on idle keep-alive connections.
    pub async fn stop(self) {
        futures::future::join_all(self.handles.iter().map(|h| h.stop(false))).await;
    }
}

impl PipelineChain {
    /// Loopback chain on ephemeral ports.
    pub fn local(instances_per_stage: usize) -> Self {
        PipelineChain {
            host: "127.0.0.1".to_string(),
            base_port: None,
            instances_per_stage,
            timeout: DEFAULT_HOP_TIMEOUT_SECS,
            fail_rates: HashMap::new(),
            workers: 2,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Stage `i` gets its dispatcher on `base + i * (n + 1)` and its workers
    /// on the following `n` ports.
    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = Some(base_port);
        self
    }

    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_fail_rate(mut self, kind: StageKind, fail_rate: f32) -> Self {
        self.fail_rates.insert(kind, fail_rate);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    fn bind(&self, offset: usize) -> std::io::Result<TcpListener> {
        let port = match self.base_port {
            Some(base) => u16::try_from(base as usize + offset).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "port out of range")
            })?,
            None => 0,
        };
        TcpListener::bind((self.host.as_str(), port))
    }

    /// Binds and starts every server. Must run inside an actix system.
    pub async fn spawn(&self) -> anyhow::Result<ChainHandle> {
        anyhow::ensure!(
            self.instances_per_stage > 0,
            "instances_per_stage must be at least 1"
        );
        let n = self.instances_per_stage;

        let mut bound = Vec::with_capacity(StageKind::ALL.len());
        for (i, kind) in StageKind::ALL.iter().enumerate() {
            let offset = i * (n + 1);
            let dispatcher = self.bind(offset)?;
            let workers = (0..n)
                .map(|j| self.bind(offset + 1 + j))
                .collect::<std::io::Result<Vec<_>>>()?;
            bound.push((*kind, dispatcher, workers));
        }

        let mut dispatchers = Vec::new();
        for (kind, listener, _) in &bound {
            dispatchers.push((*kind, format!("http://{}", listener.local_addr()?)));
        }
        let url_of = |kind: StageKind| -> Option<String> {
            dispatchers
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, url)| url.clone())
        };

        let mut handles = Vec::new();
        for (kind, dispatcher, workers) in bound {
            let mut instances = Vec::with_capacity(workers.len());
            for listener in workers {
                let addr = listener.local_addr()?;
                let config = StageConfig {
                    host: self.host.clone(),
                    port: addr.port(),
                    kind,
                    downstream_url: kind.next().and_then(url_of),
                    timeout: self.timeout,
                    fail_rate: self.fail_rates.get(&kind).copied().unwrap_or(0.0),
                    max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
                };
                let link = StageLink::new(&config)?;
                let server =
                    stage_server(listener, link, config.max_payload_size, self.workers)?;
                handles.push(server.handle());
                actix_web::rt::spawn(server);
                instances.push(addr.to_string());
            }

            let addr = dispatcher.local_addr()?;
            let lb_config = LBConfig {
                host: self.host.clone(),
                port: addr.port(),
                stage: kind,
                instances,
                timeout: self.timeout,
                max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            };
            let lb_state = LBState::new(lb_config.clone())?;
            let server =
                dispatcher_server(dispatcher, lb_state, lb_config.max_payload_size, self.workers)?;
            handles.push(server.handle());
            actix_web::rt::spawn(server);
            info!("Started {} dispatcher on {}", kind.name(), addr);
        }

        let ingress_url = url_of(StageKind::Ingress)
            .ok_or_else(|| anyhow::anyhow!("ingress dispatcher missing"))?;
        info!("Pipeline chain ready, ingress at {}", ingress_url);

        Ok(ChainHandle {
            ingress_url,
            dispatchers,
            handles,
        })
    }
}
