use crate::chain::{RequestState, RequestTrace};
use crate::config::{ConfigResult, ConfigValidator, StageConfig, StageKind};
use crate::error::{StageError, TransformError};
use crate::io_struct::{ForwardEnvelope, ResultEnvelope};
use crate::strategy_lb::InstanceInfo;
use crate::transform::StageTransform;
use crate::transport::{HttpTransport, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Where a stage sends its transformed payload: the next stage's dispatcher.
///
/// `timeout` bounds the whole hop, including every failover attempt the
/// dispatcher makes. With the same value on both sides, a hung instance
/// downstream makes this hop give up when that dispatcher's own attempt
/// times out, before it can try the next instance. Give stages a larger
/// timeout than their downstream dispatcher to let failover finish.
#[derive(Debug, Clone)]
pub struct Downstream {
    pub stage: StageKind,
    pub url: String,
    pub timeout: Duration,
}

impl Downstream {
    pub fn new(stage: StageKind, base_url: &str, timeout: Duration) -> Self {
        Downstream {
            stage,
            url: InstanceInfo::new(base_url).api_path(stage.api_path()),
            timeout,
        }
    }
}

/// One stage worker: transform locally, forward once, merge on the way back.
///
/// There is no retry here. Retrying belongs to the dispatcher in front of the
/// next stage.
#[derive(Debug, Clone)]
pub struct StageLink {
    kind: StageKind,
    transform: Arc<dyn StageTransform>,
    downstream: Option<Downstream>,
    transport: Arc<dyn Transport>,
    fail_rate: f32,
}

impl StageLink {
    pub fn new(config: &StageConfig) -> anyhow::Result<Self> {
        let transport = HttpTransport::new()?;
        Ok(Self::with_transport(config, Arc::new(transport))?)
    }

    pub fn with_transport(
        config: &StageConfig,
        transport: Arc<dyn Transport>,
    ) -> ConfigResult<Self> {
        ConfigValidator::validate_stage(config)?;
        let downstream = match (config.kind.next(), &config.downstream_url) {
            (Some(next), Some(url)) => Some(Downstream::new(
                next,
                url,
                Duration::from_secs(config.timeout),
            )),
            _ => None,
        };
        Ok(StageLink {
            kind: config.kind,
            transform: config.kind.transform(),
            downstream,
            transport,
            fail_rate: config.fail_rate,
        })
    }

    /// Replaces the stock transform for this stage.
    pub fn with_transform(mut self, transform: Arc<dyn StageTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn downstream(&self) -> Option<&Downstream> {
        self.downstream.as_ref()
    }

    pub async fn handle(&self, envelope: ForwardEnvelope) -> Result<ResultEnvelope, StageError> {
        self.handle_traced(envelope).await.0
    }

    pub async fn handle_traced(
        &self,
        envelope: ForwardEnvelope,
    ) -> (Result<ResultEnvelope, StageError>, RequestTrace) {
        let mut trace = RequestTrace::new();
        let result = self.process(envelope, &mut trace).await;
        trace.advance(if result.is_ok() {
            RequestState::Succeeded
        } else {
            RequestState::Failed
        });
        trace.advance(RequestState::Responded);
        debug!("[{}] request states: {:?}", self.kind.name(), trace.states());
        (result, trace)
    }

    async fn process(
        &self,
        envelope: ForwardEnvelope,
        trace: &mut RequestTrace,
    ) -> Result<ResultEnvelope, StageError> {
        let name = self.kind.name();
        let request_id = envelope.request_id;
        info!(
            "[{}] Received request {} ({} {} bytes)",
            name,
            request_id,
            envelope.payload.kind(),
            envelope.payload.size_hint()
        );

        if self.fail_rate > 0.0 && rand::random::<f32>() < self.fail_rate {
            error!("[{}] Injected failure for request {}", name, request_id);
            return Err(StageError::InjectedFailure {
                stage: name.to_string(),
            });
        }

        let transformed = self.transform.apply(envelope.payload).map_err(|e| {
            error!("[{}] Transform failed for {}: {}", name, request_id, e);
            match e {
                TransformError::WrongPayload { .. } => StageError::InvalidPayload {
                    stage: name.to_string(),
                    reason: e.to_string(),
                },
                TransformError::Failed(reason) => StageError::LocalProcessing {
                    stage: name.to_string(),
                    reason,
                },
            }
        })?;
        trace.advance(RequestState::Transformed);

        let Some(downstream) = &self.downstream else {
            info!("[{}] Request {} completed locally", name, request_id);
            return Ok(ResultEnvelope::terminal(transformed.local));
        };

        trace.advance(RequestState::Forwarding);
        info!(
            "[{}] Forwarding {} to {} at {}",
            name,
            request_id,
            downstream.stage.name(),
            downstream.url
        );
        let forward = ForwardEnvelope {
            payload: transformed.payload,
            request_id,
        };
        match self
            .transport
            .send(&downstream.url, &forward, downstream.timeout)
            .await
        {
            Ok(result) => {
                info!(
                    "[{}] Received response from {} for {}",
                    name,
                    downstream.stage.name(),
                    forward.request_id
                );
                Ok(ResultEnvelope::merge(result, transformed.local))
            }
            Err(e) => {
                error!(
                    "[{}] {} failed for {}: {}",
                    name,
                    downstream.stage.name(),
                    forward.request_id,
                    e
                );
                Err(StageError::Upstream {
                    stage: downstream.stage.name().to_string(),
                    detail: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AttemptError;
    use crate::io_struct::{DownstreamResult, Payload, Status};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct FixedTransport {
        reply: Result<DownstreamResult, AttemptError>,
        seen: Mutex<Vec<(String, ForwardEnvelope)>>,
    }

    impl FixedTransport {
        fn new(reply: Result<DownstreamResult, AttemptError>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for FixedTransport {
        async fn send(
            &self,
            url: &str,
            envelope: &ForwardEnvelope,
            _timeout: Duration,
        ) -> Result<DownstreamResult, AttemptError> {
            self.seen
                .lock()
                .unwrap()
                .push((url.to_string(), envelope.clone()));
            self.reply.clone()
        }
    }

    fn link(kind: StageKind, transport: Arc<FixedTransport>) -> StageLink {
        let mut config = StageConfig::with_defaults(kind);
        config.downstream_url = kind.next().map(|_| "next-dispatcher:9000".to_string());
        StageLink::with_transport(&config, transport).unwrap()
    }

    #[tokio::test]
    async fn test_preprocess_forwards_cleaned_text() {
        let transport = FixedTransport::new(Ok(DownstreamResult {
            word_count: Some(2),
            report: Some("report".to_string()),
            ..Default::default()
        }));
        let stage = link(StageKind::Preprocess, transport.clone());

        let (result, trace) = stage
            .handle_traced(ForwardEnvelope::text("Hello,  World!", "r-7"))
            .await;
        let result = result.unwrap();

        assert_eq!(result.message, "Preprocessing completed");
        assert_eq!(result.word_count, 2);
        assert_eq!(result.report, "report");
        assert_eq!(
            trace.states(),
            &[
                RequestState::Received,
                RequestState::Transformed,
                RequestState::Forwarding,
                RequestState::Succeeded,
                RequestState::Responded,
            ]
        );

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "http://next-dispatcher:9000/analyze");
        assert_eq!(seen[0].1, ForwardEnvelope::text("hello world", "r-7"));
    }

    #[test]
    fn test_downstream_uses_configured_hop_timeout() {
        let mut config = StageConfig::with_defaults(StageKind::Analysis);
        config.downstream_url = Some("http://lb4:8064".to_string());
        config.timeout = 240;
        let stage =
            StageLink::with_transport(&config, FixedTransport::new(Ok(Default::default()))).unwrap();

        let downstream = stage.downstream().unwrap();
        assert_eq!(downstream.stage, StageKind::Report);
        assert_eq!(downstream.url, "http://lb4:8064/report");
        assert_eq!(downstream.timeout, Duration::from_secs(240));
    }

    #[tokio::test]
    async fn test_analysis_defaults_to_local_counts() {
        let transport = FixedTransport::new(Ok(DownstreamResult::default()));
        let stage = link(StageKind::Analysis, transport.clone());

        let result = stage
            .handle(ForwardEnvelope::text("a b a", "r"))
            .await
            .unwrap();
        assert_eq!(result.word_count, 3);
        assert_eq!(result.top_words, vec![("a".to_string(), 2), ("b".to_string(), 1)]);

        let seen = transport.seen.lock().unwrap();
        assert!(matches!(seen[0].1.payload, Payload::Analysis(_)));
    }

    #[tokio::test]
    async fn test_terminal_stage_builds_result_locally() {
        let transport = FixedTransport::new(Err(AttemptError::UpstreamTimeout(
            Duration::from_secs(1),
        )));
        let stage = link(StageKind::Report, transport.clone());
        assert!(stage.downstream().is_none());

        let analysis = crate::transform::analyze_text("x y x", 10);
        let (result, trace) = stage
            .handle_traced(ForwardEnvelope {
                payload: Payload::Analysis(analysis),
                request_id: "r".to_string(),
            })
            .await;
        let result = result.unwrap();

        assert_eq!(result.status, Status::Success);
        assert_eq!(result.message, "Report generated successfully");
        assert!(result.report.contains("Total Words: 3"));
        assert_eq!(trace.states().len(), 4);
        assert!(transport.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_downstream_failure_is_wrapped() {
        let transport = FixedTransport::new(Err(AttemptError::UpstreamHTTPError {
            status: 503,
            detail: "All report instances failed after 4 attempts".to_string(),
        }));
        let stage = link(StageKind::Analysis, transport);

        let (result, trace) = stage.handle_traced(ForwardEnvelope::text("a", "r")).await;
        let err = result.unwrap_err();
        assert_eq!(
            err.to_string(),
            "report error: HTTP 503: All report instances failed after 4 attempts"
        );
        assert_eq!(trace.current(), RequestState::Responded);
        assert!(trace.states().contains(&RequestState::Failed));
    }

    #[tokio::test]
    async fn test_wrong_payload_is_not_forwarded() {
        let transport = FixedTransport::new(Ok(DownstreamResult::default()));
        let stage = link(StageKind::Ingress, transport.clone());

        let (result, trace) = stage
            .handle_traced(ForwardEnvelope {
                payload: Payload::Analysis(Default::default()),
                request_id: "r".to_string(),
            })
            .await;
        assert!(matches!(result, Err(StageError::InvalidPayload { .. })));
        assert_eq!(
            trace.states(),
            &[RequestState::Received, RequestState::Failed, RequestState::Responded]
        );
        assert!(transport.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transform_failure_is_local_processing_error() {
        #[derive(Debug)]
        struct Broken;
        impl StageTransform for Broken {
            fn apply(&self, _payload: Payload) -> Result<crate::transform::Transformed, TransformError> {
                Err(TransformError::Failed("boom".to_string()))
            }
        }

        let stage = link(StageKind::Preprocess, FixedTransport::new(Ok(Default::default())))
            .with_transform(Arc::new(Broken));
        let err = stage.handle(ForwardEnvelope::text("a", "r")).await.unwrap_err();
        assert_eq!(
            err,
            StageError::LocalProcessing {
                stage: "preprocess".to_string(),
                reason: "boom".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_full_fail_rate_always_fails() {
        let mut config = StageConfig::with_defaults(StageKind::Report);
        config.fail_rate = 1.0;
        let stage =
            StageLink::with_transport(&config, FixedTransport::new(Ok(Default::default()))).unwrap();
        let err = stage
            .handle(ForwardEnvelope {
                payload: Payload::Analysis(Default::default()),
                request_id: "r".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StageError::InjectedFailure {
                stage: "report".to_string()
            }
        );
    }
}
