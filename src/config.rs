use crate::lb_state::LBConfig;
use crate::transform::{Analyze, Clean, Passthrough, Report, StageTransform};
use clap::ValueEnum;
use std::collections::HashSet;
use std::sync::Arc;

pub const DEFAULT_HOP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_FANOUT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;
pub const DEFAULT_INGRESS_URL: &str = "http://service1-loadbalancer:8061";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Invalid value for field '{field}': {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required field: {field}")]
    MissingRequired { field: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// The four stages of the text pipeline, in forwarding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum StageKind {
    Ingress,
    Preprocess,
    Analysis,
    Report,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Ingress,
        StageKind::Preprocess,
        StageKind::Analysis,
        StageKind::Report,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Ingress => "ingress",
            StageKind::Preprocess => "preprocess",
            StageKind::Analysis => "analysis",
            StageKind::Report => "report",
        }
    }

    /// Path served by both the stage's workers and its dispatcher.
    pub fn api_path(self) -> &'static str {
        match self {
            StageKind::Ingress => "/process",
            StageKind::Preprocess => "/preprocess",
            StageKind::Analysis => "/analyze",
            StageKind::Report => "/report",
        }
    }

    pub fn next(self) -> Option<StageKind> {
        match self {
            StageKind::Ingress => Some(StageKind::Preprocess),
            StageKind::Preprocess => Some(StageKind::Analysis),
            StageKind::Analysis => Some(StageKind::Report),
            StageKind::Report => None,
        }
    }

    pub fn worker_port(self) -> u16 {
        match self {
            StageKind::Ingress => 8051,
            StageKind::Preprocess => 8052,
            StageKind::Analysis => 8053,
            StageKind::Report => 8054,
        }
    }

    pub fn dispatcher_port(self) -> u16 {
        match self {
            StageKind::Ingress => 8061,
            StageKind::Preprocess => 8062,
            StageKind::Analysis => 8063,
            StageKind::Report => 8064,
        }
    }

    pub fn default_instances(self) -> Vec<String> {
        let instances: [&str; 4] = match self {
            StageKind::Ingress => [
                "service1a:8051",
                "service1b:8055",
                "service1c:8057",
                "service1d:8059",
            ],
            StageKind::Preprocess => [
                "service2a:8052",
                "service2b:8056",
                "service2c:8058",
                "service2d:8060",
            ],
            StageKind::Analysis => [
                "service3a:8053",
                "service3b:8065",
                "service3c:8067",
                "service3d:8069",
            ],
            StageKind::Report => [
                "service4a:8054",
                "service4b:8066",
                "service4c:8068",
                "service4d:8070",
            ],
        };
        instances.iter().map(|s| s.to_string()).collect()
    }

    /// Base URL of the next stage's dispatcher.
    pub fn default_downstream_url(self) -> Option<String> {
        self.next().map(|next| {
            format!(
                "http://service{}-loadbalancer:{}",
                next.ordinal(),
                next.dispatcher_port()
            )
        })
    }

    /// Per-stage environment variable naming the next dispatcher, e.g.
    /// `SERVICE3_URL` for the preprocess stage.
    pub fn downstream_env_var(self) -> Option<String> {
        self.next().map(|next| format!("SERVICE{}_URL", next.ordinal()))
    }

    /// Picks the downstream base URL: an explicit value first, then the
    /// per-stage variable from `lookup`, then the default topology.
    pub fn resolve_downstream_url(
        self,
        explicit: Option<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Option<String> {
        explicit
            .or_else(|| self.downstream_env_var().and_then(|var| lookup(&var)))
            .or_else(|| self.default_downstream_url())
    }

    /// Message a dispatcher reports when the stage response omits one.
    pub fn dispatcher_message(self) -> &'static str {
        match self {
            StageKind::Ingress => "Pipeline completed",
            StageKind::Preprocess => "Preprocessing completed",
            StageKind::Analysis => "Analysis completed",
            StageKind::Report => "Report generated",
        }
    }

    pub fn transform(self) -> Arc<dyn StageTransform> {
        match self {
            StageKind::Ingress => Arc::new(Passthrough),
            StageKind::Preprocess => Arc::new(Clean),
            StageKind::Analysis => Arc::new(Analyze::default()),
            StageKind::Report => Arc::new(Report),
        }
    }

    fn ordinal(self) -> usize {
        match self {
            StageKind::Ingress => 1,
            StageKind::Preprocess => 2,
            StageKind::Analysis => 3,
            StageKind::Report => 4,
        }
    }
}

/// Settings for a single stage worker process.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub host: String,
    pub port: u16,
    pub kind: StageKind,
    /// Base URL of the next stage's dispatcher; `None` for the terminal stage.
    pub downstream_url: Option<String>,
    pub timeout: u64,
    pub fail_rate: f32,
    pub max_payload_size: usize,
}

impl StageConfig {
    pub fn with_defaults(kind: StageKind) -> Self {
        StageConfig {
            host: "0.0.0.0".to_string(),
            port: kind.worker_port(),
            kind,
            downstream_url: kind.default_downstream_url(),
            timeout: DEFAULT_HOP_TIMEOUT_SECS,
            fail_rate: 0.0,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate_lb(config: &LBConfig) -> ConfigResult<()> {
        if config.instances.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "instances".to_string(),
            });
        }
        let mut seen = HashSet::new();
        for instance in &config.instances {
            if instance.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "instances".to_string(),
                    value: instance.clone(),
                    reason: "empty instance address".to_string(),
                });
            }
            if !seen.insert(instance) {
                return Err(ConfigError::InvalidValue {
                    field: "instances".to_string(),
                    value: instance.clone(),
                    reason: "duplicate instance address".to_string(),
                });
            }
        }
        Self::validate_timeout(config.timeout)
    }

    pub fn validate_stage(config: &StageConfig) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&config.fail_rate) {
            return Err(ConfigError::InvalidValue {
                field: "fail_rate".to_string(),
                value: config.fail_rate.to_string(),
                reason: "must be between 0.0 and 1.0".to_string(),
            });
        }
        match (config.kind.next(), &config.downstream_url) {
            (Some(_), None) => {
                return Err(ConfigError::MissingRequired {
                    field: "downstream_url".to_string(),
                });
            }
            (None, Some(url)) => {
                return Err(ConfigError::ValidationFailed {
                    reason: format!(
                        "{} is the terminal stage and cannot forward to {}",
                        config.kind.name(),
                        url
                    ),
                });
            }
            _ => {}
        }
        Self::validate_timeout(config.timeout)
    }

    pub fn validate_parallelism(parallelism: usize) -> ConfigResult<()> {
        if parallelism == 0 {
            return Err(ConfigError::InvalidValue {
                field: "parallelism".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    fn validate_timeout(timeout: u64) -> ConfigResult<()> {
        if timeout == 0 {
            return Err(ConfigError::InvalidValue {
                field: "timeout".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}
