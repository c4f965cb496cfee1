//! Compares end-to-end time of 1, 2 and 4 parallel pipelines over the same input.

use crate::error::FanOutError;
use crate::fanout::FanOutClient;
use std::fmt;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub pipelines: Vec<usize>,
    pub runs: usize,
    pub pause: Duration,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            pipelines: vec![1, 2, 4],
            runs: 10,
            pause: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunResult {
    pub total_time: Duration,
    pub successful_count: usize,
    pub total_words: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSummary {
    pub pipelines: usize,
    pub times: Vec<Duration>,
    pub avg_time: Duration,
    pub best_time: Duration,
    pub worst_time: Duration,
    pub success_rate: f64,
}

impl ConfigSummary {
    pub fn from_runs(pipelines: usize, runs: &[RunResult]) -> Self {
        let times: Vec<Duration> = runs.iter().map(|r| r.total_time).collect();
        let avg_time = if times.is_empty() {
            Duration::ZERO
        } else {
            times.iter().sum::<Duration>() / times.len() as u32
        };
        let successes: usize = runs.iter().map(|r| r.successful_count).sum();
        let attempted = pipelines * runs.len();
        let success_rate = if attempted == 0 {
            0.0
        } else {
            successes as f64 / attempted as f64 * 100.0
        };

        ConfigSummary {
            pipelines,
            best_time: times.iter().min().copied().unwrap_or_default(),
            worst_time: times.iter().max().copied().unwrap_or_default(),
            avg_time,
            times,
            success_rate,
        }
    }

    /// How many times faster than `baseline` on average.
    pub fn speedup_over(&self, baseline: &ConfigSummary) -> Option<f64> {
        if self.avg_time.is_zero() {
            return None;
        }
        Some(baseline.avg_time.as_secs_f64() / self.avg_time.as_secs_f64())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchReport {
    pub summaries: Vec<ConfigSummary>,
}

impl BenchReport {
    pub fn baseline(&self) -> Option<&ConfigSummary> {
        self.summaries.first()
    }
}

fn fmt_speedup(speedup: Option<f64>) -> String {
    match speedup {
        Some(s) => format!("{:5.2}x", s),
        None => "  n/a ".to_string(),
    }
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "| Pipelines |  Avg Time | Best Time | Worst Time | Success % | Speedup |"
        )?;
        writeln!(
            f,
            "|-----------|-----------|-----------|------------|-----------|---------|"
        )?;
        for summary in &self.summaries {
            let speedup = self.baseline().and_then(|b| summary.speedup_over(b));
            writeln!(
                f,
                "| {:>9} | {:>8.3}s | {:>8.3}s | {:>9.3}s | {:>8.1}% | {:>7} |",
                summary.pipelines,
                summary.avg_time.as_secs_f64(),
                summary.best_time.as_secs_f64(),
                summary.worst_time.as_secs_f64(),
                summary.success_rate,
                fmt_speedup(speedup)
            )?;
        }
        Ok(())
    }
}

pub async fn run_benchmark(
    client: &FanOutClient,
    text: &str,
    config: &BenchConfig,
) -> Result<BenchReport, FanOutError> {
    let mut summaries = Vec::with_capacity(config.pipelines.len());

    for &pipelines in &config.pipelines {
        info!("Testing {} parallel pipeline(s)", pipelines);
        let mut runs = Vec::with_capacity(config.runs);
        for run in 0..config.runs {
            let agg = client.process(text, pipelines).await?;
            info!(
                "  Run {}/{}: {:.3}s, {}/{} succeeded, {} words",
                run + 1,
                config.runs,
                agg.total_time.as_secs_f64(),
                agg.successful_count,
                pipelines,
                agg.total_words
            );
            runs.push(RunResult {
                total_time: agg.total_time,
                successful_count: agg.successful_count,
                total_words: agg.total_words,
            });
            if run + 1 < config.runs && !config.pause.is_zero() {
                tokio::time::sleep(config.pause).await;
            }
        }
        summaries.push(ConfigSummary::from_runs(pipelines, &runs));
    }

    Ok(BenchReport { summaries })
}
