use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use stagechain::bench::{BenchConfig, run_benchmark};
use stagechain::config::{
    ConfigValidator, DEFAULT_FANOUT_TIMEOUT_SECS, DEFAULT_HOP_TIMEOUT_SECS,
    DEFAULT_INGRESS_URL, DEFAULT_MAX_PAYLOAD_SIZE, StageConfig, StageKind,
};
use stagechain::dataset::{Dataset, load_dataset, read_text_files};
use stagechain::fanout::FanOutClient;
use stagechain::lb_state::LBConfig;
use stagechain::logging::{self, LoggingConfig};
use stagechain::server::{startup_dispatcher, startup_stage};
use stagechain::PipelineChain;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "stagechain")]
#[command(about = "Chained text-processing stages behind round-robin dispatchers")]
#[command(long_about = r#"
Chained text-processing stages behind round-robin dispatchers

Every stage (ingress -> preprocess -> analysis -> report) runs as several
redundant workers behind one dispatcher. Workers call the next stage's
dispatcher synchronously and the result bubbles back up the chain.

Examples:
  # A dispatcher for the preprocess stage
  stagechain dispatcher --stage preprocess --instances 10.0.0.1:8052,10.0.0.2:8056

  # A preprocess worker forwarding to the analysis dispatcher
  stagechain stage --stage preprocess --downstream-url http://10.0.0.9:8063

  # The whole chain on this machine, 4 workers per stage
  stagechain serve-all --base-port 9000 --instances 4

  # Split every dataset over 1, 2 and 4 parallel pipelines
  stagechain fanout --url http://127.0.0.1:9000
"#)]
struct Cli {
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true,
          value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: String,

    /// Directory to store log files
    #[arg(long, env = "LOG_DIR", global = true)]
    log_dir: Option<String>,

    #[arg(long, default_value_t = false, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the round-robin dispatcher for one stage
    Dispatcher(DispatcherArgs),
    /// Run one worker of a stage
    Stage(StageArgs),
    /// Run every dispatcher and worker in this process
    ServeAll(ServeAllArgs),
    /// Send one dataset through the pipeline
    Run(RunArgs),
    /// Split datasets across parallel pipelines
    Fanout(FanoutArgs),
    /// Compare 1, 2 and 4 parallel pipelines
    Bench(BenchArgs),
}

#[derive(Args, Debug)]
struct DispatcherArgs {
    #[arg(long, value_enum)]
    stage: StageKind,

    #[arg(long, env = "SERVICE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Defaults to the stage's standard dispatcher port
    #[arg(long, env = "SERVICE_PORT")]
    port: Option<u16>,

    /// Comma-separated host:port list; defaults to the stage's standard instances
    #[arg(long, env = "INSTANCES", value_delimiter = ',', num_args = 1..)]
    instances: Vec<String>,

    /// Per-attempt timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = DEFAULT_HOP_TIMEOUT_SECS)]
    timeout: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD_SIZE)]
    max_payload_size: usize,
}

#[derive(Args, Debug)]
struct StageArgs {
    #[arg(long, value_enum)]
    stage: StageKind,

    #[arg(long, env = "SERVICE_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "SERVICE_PORT")]
    port: Option<u16>,

    /// Base URL of the next stage's dispatcher. Falls back to SERVICE2_URL,
    /// SERVICE3_URL or SERVICE4_URL (the next stage's number), then to the
    /// stage's standard dispatcher address
    #[arg(long, env = "DOWNSTREAM_URL")]
    downstream_url: Option<String>,

    /// Timeout in seconds for the whole call to the next dispatcher, failover
    /// included; keep it above that dispatcher's per-attempt timeout
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = DEFAULT_HOP_TIMEOUT_SECS)]
    timeout: u64,

    /// Probability (0.0-1.0) of answering a request with an injected 500
    #[arg(long, env = "FAIL_RATE", default_value_t = 0.0)]
    fail_rate: f32,

    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD_SIZE)]
    max_payload_size: usize,
}

#[derive(Args, Debug)]
struct ServeAllArgs {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// First port of the chain; the ingress dispatcher listens here
    #[arg(long, default_value_t = 9000)]
    base_port: u16,

    /// Workers per stage
    #[arg(long, default_value_t = 4)]
    instances: usize,

    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = DEFAULT_HOP_TIMEOUT_SECS)]
    timeout: u64,

    /// Fault injection per stage, e.g. `--fail report:0.5`
    #[arg(long, value_parser = parse_fail_rate)]
    fail: Vec<(StageKind, f32)>,
}

#[derive(Args, Debug, Clone)]
struct ClientArgs {
    /// Base URL of the ingress dispatcher
    #[arg(long, env = "SERVICE1_URL", default_value = DEFAULT_INGRESS_URL)]
    url: String,

    #[arg(long, env = "DATASETS_DIR", default_value = "datasets")]
    datasets_dir: PathBuf,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_FANOUT_TIMEOUT_SECS)]
    timeout: u64,

    /// Seconds to wait for the services before the first request
    #[arg(long, default_value_t = 0)]
    wait_secs: u64,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(default_value = "big.txt")]
    file: String,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
struct FanoutArgs {
    /// Dataset files; every .txt in the datasets dir when omitted
    files: Vec<String>,

    #[arg(long, value_delimiter = ',', default_values_t = [1, 2, 4])]
    parallelism: Vec<usize>,

    /// Seconds between parallelism levels
    #[arg(long, default_value_t = 3)]
    pause_secs: u64,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
struct BenchArgs {
    #[arg(long, default_value_t = 10)]
    runs: usize,

    #[arg(long, value_delimiter = ',', default_values_t = [1, 2, 4])]
    pipelines: Vec<usize>,

    /// Seconds between runs
    #[arg(long, default_value_t = 2)]
    pause_secs: u64,

    #[command(flatten)]
    client: ClientArgs,
}

fn parse_fail_rate(s: &str) -> Result<(StageKind, f32), String> {
    let (stage, rate) = s
        .split_once(':')
        .ok_or_else(|| format!("expected <stage>:<rate>, got '{}'", s))?;
    let stage = <StageKind as clap::ValueEnum>::from_str(stage, true)?;
    let rate = rate
        .parse::<f32>()
        .map_err(|e| format!("invalid rate '{}': {}", rate, e))?;
    Ok((stage, rate))
}

impl ClientArgs {
    async fn client(&self) -> anyhow::Result<FanOutClient> {
        if self.wait_secs > 0 {
            info!("Waiting {}s for services to be ready...", self.wait_secs);
            tokio::time::sleep(Duration::from_secs(self.wait_secs)).await;
        }
        Ok(FanOutClient::new(&self.url)?.with_timeout(Duration::from_secs(self.timeout)))
    }
}

async fn serve_all(args: ServeAllArgs) -> anyhow::Result<()> {
    let mut chain = PipelineChain::local(args.instances)
        .with_host(args.host)
        .with_base_port(args.base_port)
        .with_timeout(args.timeout);
    for (stage, rate) in args.fail {
        chain = chain.with_fail_rate(stage, rate);
    }
    let handle = chain.spawn().await?;
    info!("Ingress dispatcher: {}", handle.ingress_url);
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    handle.stop().await;
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let dataset = load_dataset(&args.client.datasets_dir, &args.file)?;
    let client = args.client.client().await?;
    info!("Connecting to {}", client.url());

    let result = client
        .run_pipeline(&dataset.content)
        .await
        .context("Pipeline execution failed")?;
    info!("Status: {:?}", result.status);
    info!("Message: {}", result.message);
    info!("Word Count: {}", result.word_count);
    if !result.report.is_empty() {
        println!("{}", result.report);
    }
    Ok(())
}

fn datasets_for(files: &[String], client: &ClientArgs) -> anyhow::Result<Vec<Dataset>> {
    if files.is_empty() {
        return Ok(read_text_files(&client.datasets_dir));
    }
    files
        .iter()
        .map(|f| load_dataset(&client.datasets_dir, f).map_err(Into::into))
        .collect()
}

async fn fanout(args: FanoutArgs) -> anyhow::Result<()> {
    for &parallelism in &args.parallelism {
        ConfigValidator::validate_parallelism(parallelism)?;
    }
    let datasets = datasets_for(&args.files, &args.client)?;
    if datasets.is_empty() {
        warn!("No text files found!");
        return Ok(());
    }
    let client = args.client.client().await?;

    for dataset in &datasets {
        info!(
            "Processing {} ({} bytes)",
            dataset.filename, dataset.file_size
        );
        for (i, &parallelism) in args.parallelism.iter().enumerate() {
            info!("Testing with {} parallel pipelines", parallelism);
            let aggregate = client.process(&dataset.content, parallelism).await?;
            println!("{}", aggregate);
            if i + 1 < args.parallelism.len() && args.pause_secs > 0 {
                tokio::time::sleep(Duration::from_secs(args.pause_secs)).await;
            }
        }
    }
    Ok(())
}

async fn bench(args: BenchArgs) -> anyhow::Result<()> {
    for &pipelines in &args.pipelines {
        ConfigValidator::validate_parallelism(pipelines)?;
    }
    let (filename, text) = match read_text_files(&args.client.datasets_dir).into_iter().next() {
        Some(dataset) => (dataset.filename, dataset.content),
        None => {
            warn!("No dataset files found, using fallback text");
            (
                "fallback.txt".to_string(),
                "Docker is a platform for developing, shipping, and running applications in containers. "
                    .repeat(500),
            )
        }
    };
    info!(
        "Benchmarking {} ({} chars), {} runs per configuration",
        filename,
        text.chars().count(),
        args.runs
    );

    let client = args.client.client().await?;
    let config = BenchConfig {
        pipelines: args.pipelines,
        runs: args.runs,
        pause: Duration::from_secs(args.pause_secs),
    };
    let report = run_benchmark(&client, &text, &config).await?;
    println!("{}", report);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let _log_guard = logging::init_logging(LoggingConfig {
        level: logging::parse_level(&cli.log_level),
        json_format: cli.log_json,
        log_dir: cli.log_dir.clone(),
        ..Default::default()
    });

    let result: anyhow::Result<()> = actix_web::rt::System::new().block_on(async move {
        match cli.command {
            Command::Dispatcher(args) => {
                let instances = if args.instances.is_empty() {
                    args.stage.default_instances()
                } else {
                    args.instances
                };
                startup_dispatcher(LBConfig {
                    host: args.host,
                    port: args.port.unwrap_or(args.stage.dispatcher_port()),
                    stage: args.stage,
                    instances,
                    timeout: args.timeout,
                    max_payload_size: args.max_payload_size,
                })
                .await
            }
            Command::Stage(args) => {
                let downstream_url = args
                    .stage
                    .resolve_downstream_url(args.downstream_url, |var| std::env::var(var).ok());
                startup_stage(StageConfig {
                    host: args.host,
                    port: args.port.unwrap_or(args.stage.worker_port()),
                    kind: args.stage,
                    downstream_url,
                    timeout: args.timeout,
                    fail_rate: args.fail_rate,
                    max_payload_size: args.max_payload_size,
                })
                .await
            }
            Command::ServeAll(args) => serve_all(args).await,
            Command::Run(args) => run(args).await,
            Command::Fanout(args) => fanout(args).await,
            Command::Bench(args) => bench(args).await,
        }
    });

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}
