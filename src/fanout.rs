//! Client-side fan-out: split one large input into chunks, run one pipeline
//! per chunk concurrently, and aggregate the outcomes.

use crate::config::{DEFAULT_FANOUT_TIMEOUT_SECS, StageKind};
use crate::error::{AttemptError, FanOutError};
use crate::io_struct::{ForwardEnvelope, LocalResult, ResultEnvelope, Status};
use crate::strategy_lb::InstanceInfo;
use crate::transport::{HttpTransport, Transport};
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Inputs longer than this many characters are split by raw offset.
pub const LARGE_INPUT_THRESHOLD: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkingMode {
    CharOffset,
    WordBoundary,
}

pub fn chunking_mode(char_len: usize) -> ChunkingMode {
    if char_len > LARGE_INPUT_THRESHOLD {
        ChunkingMode::CharOffset
    } else {
        ChunkingMode::WordBoundary
    }
}

/// Splits `text` into exactly `num_chunks` pieces; the last piece absorbs the remainder.
pub fn split_text_into_chunks(text: &str, num_chunks: usize) -> Vec<String> {
    split_counted(text, text.chars().count(), num_chunks)
}

fn split_counted(text: &str, char_len: usize, num_chunks: usize) -> Vec<String> {
    match chunking_mode(char_len) {
        ChunkingMode::CharOffset => split_by_char_offset(text, char_len, num_chunks),
        ChunkingMode::WordBoundary => split_by_words(text, num_chunks),
    }
}

/// Contiguous pieces of `char_len / num_chunks` characters. May cut words in half.
///
/// `char_len` must be `text.chars().count()`. Only the `num_chunks - 1` cut
/// offsets are kept while walking the text.
pub fn split_by_char_offset(text: &str, char_len: usize, num_chunks: usize) -> Vec<String> {
    if num_chunks == 0 {
        return Vec::new();
    }
    let chunk_size = char_len / num_chunks;

    let mut cuts = Vec::with_capacity(num_chunks + 1);
    cuts.push(0);
    if chunk_size == 0 {
        cuts.resize(num_chunks, 0);
    } else {
        let mut next_cut = chunk_size;
        for (char_idx, (byte_idx, _)) in text.char_indices().enumerate() {
            if cuts.len() == num_chunks {
                break;
            }
            if char_idx == next_cut {
                cuts.push(byte_idx);
                next_cut += chunk_size;
            }
        }
    }
    cuts.push(text.len());

    cuts.windows(2).map(|w| text[w[0]..w[1]].to_string()).collect()
}

/// Groups of `words / num_chunks` whitespace-separated words, rejoined with
/// single spaces.
pub fn split_by_words(text: &str, num_chunks: usize) -> Vec<String> {
    if num_chunks == 0 {
        return Vec::new();
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    let chunk_size = words.len() / num_chunks;

    (0..num_chunks)
        .map(|i| {
            let start = i * chunk_size;
            let end = if i == num_chunks - 1 {
                words.len()
            } else {
                (i + 1) * chunk_size
            };
            words[start..end].join(" ")
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOutcome {
    pub chunk_id: usize,
    pub success: bool,
    pub word_count: u64,
    pub processing_time: Duration,
    pub status: Option<Status>,
    pub message: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateResult {
    pub total_time: Duration,
    pub successful_count: usize,
    pub failed_count: usize,
    pub total_words: u64,
    pub avg_time: Duration,
    /// `None` when fewer than two chunks succeeded or no time elapsed.
    pub speedup: Option<f64>,
    pub chunks: Vec<ChunkOutcome>,
}

impl AggregateResult {
    pub fn from_outcomes(mut chunks: Vec<ChunkOutcome>, total_time: Duration) -> Self {
        chunks.sort_by_key(|c| c.chunk_id);
        let successful_count = chunks.iter().filter(|c| c.success).count();
        let failed_count = chunks.len() - successful_count;
        let total_words = chunks
            .iter()
            .filter(|c| c.success)
            .map(|c| c.word_count)
            .sum();
        let avg_time = if chunks.is_empty() {
            Duration::ZERO
        } else {
            chunks.iter().map(|c| c.processing_time).sum::<Duration>() / chunks.len() as u32
        };
        let speedup = if total_time > Duration::ZERO && successful_count > 1 {
            Some(avg_time.as_secs_f64() * chunks.len() as f64 / total_time.as_secs_f64())
        } else {
            None
        };

        AggregateResult {
            total_time,
            successful_count,
            failed_count,
            total_words,
            avg_time,
            speedup,
            chunks,
        }
    }
}

impl fmt::Display for AggregateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.chunks.len();
        writeln!(f, "{}", "=".repeat(80))?;
        writeln!(f, "PARALLEL PROCESSING RESULTS")?;
        writeln!(f, "{}", "=".repeat(80))?;
        writeln!(f, "Total processing time: {:.3}s", self.total_time.as_secs_f64())?;
        writeln!(f, "Successful pipelines: {}/{}", self.successful_count, total)?;
        writeln!(f, "Failed pipelines: {}/{}", self.failed_count, total)?;
        writeln!(f, "Total words processed: {}", self.total_words)?;
        writeln!(f, "Average pipeline time: {:.3}s", self.avg_time.as_secs_f64())?;
        match self.speedup {
            Some(speedup) => writeln!(f, "Parallel speedup: {:.2}x", speedup)?,
            None => writeln!(f, "Parallel speedup: unavailable")?,
        }

        writeln!(f, "\nPipeline Details:")?;
        for chunk in &self.chunks {
            let mark = if chunk.success { "ok" } else { "FAILED" };
            let words = if chunk.success {
                format!("{} words", chunk.word_count)
            } else {
                "N/A".to_string()
            };
            writeln!(
                f,
                "  Pipeline {}: {} {:.3}s, {}",
                chunk.chunk_id,
                mark,
                chunk.processing_time.as_secs_f64(),
                words
            )?;
        }

        let failures: Vec<_> = self.chunks.iter().filter(|c| !c.success).collect();
        if !failures.is_empty() {
            writeln!(f, "\nFailures:")?;
            for chunk in failures {
                writeln!(
                    f,
                    "  Pipeline {}: {}",
                    chunk.chunk_id,
                    chunk.error.as_deref().unwrap_or("unknown error")
                )?;
            }
        }
        Ok(())
    }
}

/// Short correlation token; uniqueness rests on the randomness of a v4 uuid.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[derive(Debug, Clone)]
pub struct FanOutClient {
    url: String,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl FanOutClient {
    /// `ingress_url` is the base URL of the first stage's dispatcher.
    pub fn new(ingress_url: &str) -> Result<Self, reqwest::Error> {
        Ok(Self::with_transport(ingress_url, Arc::new(HttpTransport::new()?)))
    }

    pub fn with_transport(ingress_url: &str, transport: Arc<dyn Transport>) -> Self {
        FanOutClient {
            url: InstanceInfo::new(ingress_url).api_path(StageKind::Ingress.api_path()),
            transport,
            timeout: Duration::from_secs(DEFAULT_FANOUT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends the whole text as a single pipeline run.
    pub async fn run_pipeline(&self, text: &str) -> Result<ResultEnvelope, AttemptError> {
        let request_id = new_request_id();
        info!(
            "Request {}: sending {} characters to {}",
            request_id,
            text.chars().count(),
            self.url
        );
        let envelope = ForwardEnvelope::text(text, request_id);
        let result = self.transport.send(&self.url, &envelope, self.timeout).await?;
        Ok(ResultEnvelope::merge(
            result,
            LocalResult::message(StageKind::Ingress.dispatcher_message()),
        ))
    }

    pub async fn process(
        &self,
        text: &str,
        parallelism: usize,
    ) -> Result<AggregateResult, FanOutError> {
        if parallelism == 0 {
            return Err(FanOutError::ZeroParallelism);
        }

        let char_len = text.chars().count();
        let chunks = split_counted(text, char_len, parallelism);
        info!(
            "Split {} characters into {} chunks ({:?})",
            char_len,
            chunks.len(),
            chunking_mode(char_len)
        );
        for (i, chunk) in chunks.iter().enumerate() {
            info!(
                "  Chunk {}: {} words, {} chars",
                i,
                chunk.split_whitespace().count(),
                chunk.len()
            );
        }

        let request_id_base = new_request_id();
        let overall_start = Instant::now();
        let tasks = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| self.process_chunk(chunk, i, &request_id_base));
        let outcomes = join_all(tasks).await;
        let total_time = overall_start.elapsed();

        Ok(AggregateResult::from_outcomes(outcomes, total_time))
    }

    async fn process_chunk(&self, chunk: String, chunk_id: usize, request_id_base: &str) -> ChunkOutcome {
        let request_id = format!("{}_chunk{}", request_id_base, chunk_id);
        let envelope = ForwardEnvelope::text(chunk, request_id);
        let start = Instant::now();

        let result = self.transport.send(&self.url, &envelope, self.timeout).await;
        let processing_time = start.elapsed();

        match result {
            Ok(result) => {
                let word_count = result.word_count.unwrap_or(0);
                info!(
                    "[Pipeline {}] Completed in {:.3}s - {} words",
                    chunk_id,
                    processing_time.as_secs_f64(),
                    word_count
                );
                ChunkOutcome {
                    chunk_id,
                    success: true,
                    word_count,
                    processing_time,
                    status: result.status,
                    message: result.message,
                    error: None,
                }
            }
            Err(e) => {
                warn!(
                    "[Pipeline {}] Failed in {:.3}s: {}",
                    chunk_id,
                    processing_time.as_secs_f64(),
                    e
                );
                ChunkOutcome {
                    chunk_id,
                    success: false,
                    word_count: 0,
                    processing_time,
                    status: None,
                    message: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_struct::{DownstreamResult, Payload};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[test]
    fn test_word_chunks() {
        assert_eq!(split_text_into_chunks("a b c d", 2), vec!["a b", "c d"]);
        assert_eq!(split_by_words("a  b\nc d e", 2), vec!["a b", "c d e"]);
        assert_eq!(split_by_words("a b", 3), vec!["", "", "a b"]);

        let text = "one two three four five six seven";
        let chunks = split_by_words(text, 3);
        assert_eq!(chunks.join(" "), text);
    }

    #[test]
    fn test_offset_chunks_reassemble() {
        let text = "héllo wörld, this is ünïcode text!";
        for k in 1..=7 {
            let len = text.chars().count();
            let chunks = split_by_char_offset(text, len, k);
            assert_eq!(chunks.len(), k);
            assert_eq!(chunks.concat(), text);

            let last = chunks.last().unwrap().chars().count();
            assert_eq!(last, len - (k - 1) * (len / k));
        }
    }

    #[test]
    fn test_large_input_uses_offsets() {
        let text = "ab ".repeat(LARGE_INPUT_THRESHOLD / 3 + 1);
        assert_eq!(chunking_mode(text.chars().count()), ChunkingMode::CharOffset);
        let chunks = split_text_into_chunks(&text, 4);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks.concat(), text);
        // 1747627 "ab " groups = 5242881 chars; 1310720 chars per chunk
        assert_eq!(chunks[0].chars().count(), 1_310_720);
        assert_eq!(chunks[3].chars().count(), 1_310_721);
        assert_eq!(chunking_mode(5), ChunkingMode::WordBoundary);
    }

    #[test]
    fn test_offset_cuts_land_on_char_boundaries() {
        assert_eq!(
            split_by_char_offset("abcdefghij", 10, 3),
            vec!["abc", "def", "ghij"]
        );
        assert_eq!(split_by_char_offset("éàü", 3, 2), vec!["é", "àü"]);
        assert_eq!(split_by_char_offset("ab", 2, 4), vec!["", "", "", "ab"]);
        assert_eq!(split_by_char_offset("", 0, 2), vec!["", ""]);
    }

    fn outcome(chunk_id: usize, success: bool, words: u64, millis: u64) -> ChunkOutcome {
        ChunkOutcome {
            chunk_id,
            success,
            word_count: words,
            processing_time: Duration::from_millis(millis),
            status: success.then_some(Status::Success),
            message: None,
            error: (!success).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn test_aggregate() {
        let agg = AggregateResult::from_outcomes(
            vec![outcome(1, true, 10, 300), outcome(0, true, 5, 100), outcome(2, false, 99, 200)],
            Duration::from_millis(300),
        );
        assert_eq!(agg.successful_count, 2);
        assert_eq!(agg.failed_count, 1);
        assert_eq!(agg.total_words, 15);
        assert_eq!(agg.avg_time, Duration::from_millis(200));
        let speedup = agg.speedup.unwrap();
        assert!((speedup - 2.0).abs() < 1e-9);
        assert_eq!(agg.chunks[0].chunk_id, 0);
    }

    #[test]
    fn test_speedup_unavailable() {
        let single = AggregateResult::from_outcomes(
            vec![outcome(0, true, 3, 100)],
            Duration::from_millis(100),
        );
        assert_eq!(single.speedup, None);

        let instant = AggregateResult::from_outcomes(
            vec![outcome(0, true, 3, 0), outcome(1, true, 3, 0)],
            Duration::ZERO,
        );
        assert_eq!(instant.speedup, None);

        let one_success = AggregateResult::from_outcomes(
            vec![outcome(0, true, 3, 10), outcome(1, false, 0, 10)],
            Duration::from_millis(10),
        );
        assert_eq!(one_success.speedup, None);
        assert!(one_success.to_string().contains("Parallel speedup: unavailable"));
    }

    /// Counts words itself and fails any chunk containing "poison".
    #[derive(Debug, Default)]
    struct CountingTransport {
        request_ids: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(
            &self,
            _url: &str,
            envelope: &ForwardEnvelope,
            _timeout: Duration,
        ) -> Result<DownstreamResult, AttemptError> {
            self.request_ids
                .lock()
                .unwrap()
                .push(envelope.request_id.clone());
            let Payload::Text(text) = &envelope.payload else {
                return Err(AttemptError::MalformedBody("not text".to_string()));
            };
            if text.contains("poison") {
                return Err(AttemptError::UpstreamHTTPError {
                    status: 503,
                    detail: "All ingress instances failed after 4 attempts".to_string(),
                });
            }
            Ok(DownstreamResult {
                word_count: Some(text.split_whitespace().count() as u64),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_failed_chunk_does_not_cancel_others() {
        let transport = Arc::new(CountingTransport::default());
        let client = FanOutClient::with_transport("http://lb:8061", transport.clone());
        assert_eq!(client.url(), "http://lb:8061/process");

        let agg = client
            .process("a b c d poison f g h", 4)
            .await
            .unwrap();
        assert_eq!(agg.chunks.len(), 4);
        assert_eq!(agg.successful_count, 3);
        assert_eq!(agg.total_words, 6);
        assert!(agg.chunks[2].error.as_deref().unwrap().contains("503"));

        let ids = transport.request_ids.lock().unwrap();
        assert_eq!(ids.len(), 4);
        assert!(ids.iter().all(|id| id.len() == 8 + "_chunkN".len()));
        assert!(ids.iter().any(|id| id.ends_with("_chunk3")));
    }

    #[tokio::test]
    async fn test_zero_parallelism_rejected() {
        let client = FanOutClient::with_transport("lb:1", Arc::new(CountingTransport::default()));
        assert_eq!(
            client.process("x", 0).await.unwrap_err(),
            FanOutError::ZeroParallelism
        );
    }

    #[tokio::test]
    async fn test_run_pipeline_defaults_message() {
        let client = FanOutClient::with_transport("lb:1", Arc::new(CountingTransport::default()));
        let result = client.run_pipeline("x y z").await.unwrap();
        assert_eq!(result.word_count, 3);
        assert_eq!(result.message, "Pipeline completed");
    }
}
