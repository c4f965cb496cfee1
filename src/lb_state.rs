use crate::config::{ConfigResult, ConfigValidator, StageKind};
use crate::error::{AttemptError, DispatchError};
use crate::io_struct::{DownstreamResult, ForwardEnvelope, LocalResult, ResultEnvelope, StatsSnapshot};
use crate::strategy_lb::{InstanceInfo, RoundRobin};
use crate::transport::{HttpTransport, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct LBConfig {
    pub host: String,
    pub port: u16,
    pub stage: StageKind,
    pub instances: Vec<String>,
    pub timeout: u64,
    pub max_payload_size: usize,
}

/// Dispatcher fronting the redundant instances of one stage.
#[derive(Debug, Clone)]
pub struct LBState {
    pub stage: StageKind,
    pub strategy_lb: Arc<RoundRobin>,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl LBState {
    pub fn new(lb_config: LBConfig) -> anyhow::Result<Self> {
        let transport = HttpTransport::new()?;
        Ok(Self::with_transport(lb_config, Arc::new(transport))?)
    }

    pub fn with_transport(
        lb_config: LBConfig,
        transport: Arc<dyn Transport>,
    ) -> ConfigResult<Self> {
        ConfigValidator::validate_lb(&lb_config)?;
        let instances = lb_config
            .instances
            .into_iter()
            .map(InstanceInfo::new)
            .collect();
        let strategy_lb = RoundRobin::new(instances)?;

        info!(
            "[{} dispatcher] Initialized with {} instances: {}",
            lb_config.stage.name(),
            strategy_lb.len(),
            strategy_lb
                .instances()
                .iter()
                .map(|i| i.address.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            stage: lb_config.stage,
            strategy_lb: Arc::new(strategy_lb),
            transport,
            timeout: Duration::from_secs(lb_config.timeout),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends the envelope to one instance after another, starting at the
    /// cursor, until one succeeds or every instance has been tried once.
    pub async fn route(
        &self,
        envelope: &ForwardEnvelope,
    ) -> Result<DownstreamResult, DispatchError> {
        let name = self.stage.name();
        let api_path = self.stage.api_path();
        let total = self.strategy_lb.len();

        info!(
            "[{} dispatcher] Routing request {} ({} {} bytes)",
            name,
            envelope.request_id,
            envelope.payload.kind(),
            envelope.payload.size_hint()
        );

        let start = self.strategy_lb.next_index();
        let mut attempts = 0;
        let mut last_error: Option<AttemptError> = None;

        while attempts < total {
            // The shared cursor moves on every attempt; the instance for this
            // attempt is derived from `start` so a call never repeats itself.
            if attempts > 0 {
                self.strategy_lb.next_index();
            }
            let instance = self.strategy_lb.instance(start + attempts);
            let address = instance.address.as_str();

            info!("[{} dispatcher] -> Sending to {}", name, address);
            self.strategy_lb.record_request(address);

            match self
                .transport
                .send(&instance.api_path(api_path), envelope, self.timeout)
                .await
            {
                Ok(result) => {
                    self.strategy_lb.record_outcome(address, true);
                    info!("[{} dispatcher] Success from {}", name, address);
                    return Ok(result);
                }
                Err(e) => {
                    self.strategy_lb.record_outcome(address, false);
                    warn!("[{} dispatcher] Error from {}: {}", name, address, e);
                    attempts += 1;
                    last_error = Some(e);
                }
            }
        }

        let err = DispatchError::AllInstancesUnavailable {
            stage: name.to_string(),
            attempts,
            last_error: last_error.unwrap_or(AttemptError::UpstreamConnectionError(
                "no instance attempted".to_string(),
            )),
        };
        error!("[{} dispatcher] {}", name, err);
        Err(err)
    }

    /// Routes the envelope and fills any field the stage left out.
    pub async fn dispatch(
        &self,
        envelope: &ForwardEnvelope,
    ) -> Result<ResultEnvelope, DispatchError> {
        let downstream = self.route(envelope).await?;
        Ok(ResultEnvelope::merge(
            downstream,
            LocalResult::message(self.stage.dispatcher_message()),
        ))
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.strategy_lb.snapshot()
    }
}
