use crate::config::StageConfig;
use crate::error::{DispatchError, StageError, detail_response};
use crate::io_struct::{ForwardEnvelope, HealthResponse};
use crate::lb_state::{LBConfig, LBState};
use crate::stage_link::StageLink;
use actix_web::dev::Server;
use actix_web::http::StatusCode;
use actix_web::{App, Error, HttpRequest, HttpResponse, HttpServer, error, get, web};
use std::net::TcpListener;
use tracing::{error, info};

/// Name reported by `/health`.
#[derive(Debug, Clone)]
pub struct ServiceName(pub String);

// Custom error handler for JSON payload errors.
fn json_error_handler(err: error::JsonPayloadError, _req: &HttpRequest) -> Error {
    error!("JSON payload error: {:?}", err);
    let (status, detail) = match &err {
        error::JsonPayloadError::OverflowKnownLength { length, limit } => (
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "Payload too large: {} bytes exceeds limit of {} bytes",
                length, limit
            ),
        ),
        error::JsonPayloadError::Overflow { limit } => (
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("Payload exceeds limit of {} bytes", limit),
        ),
        _ => (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Invalid JSON payload: {}", err),
        ),
    };
    error::InternalError::from_response(err, detail_response(status, detail)).into()
}

#[get("/health")]
pub async fn health(name: web::Data<ServiceName>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse::healthy(&name.0))
}

#[get("/stats")]
pub async fn stats(lb_state: web::Data<LBState>) -> HttpResponse {
    HttpResponse::Ok().json(lb_state.stats_snapshot())
}

pub async fn dispatch(
    req: web::Json<ForwardEnvelope>,
    lb_state: web::Data<LBState>,
) -> Result<HttpResponse, DispatchError> {
    let envelope = req.into_inner();
    info!(
        "[{} dispatcher] Received request {}",
        lb_state.stage.name(),
        envelope.request_id
    );
    let result = lb_state.dispatch(&envelope).await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn process(
    req: web::Json<ForwardEnvelope>,
    link: web::Data<StageLink>,
) -> Result<HttpResponse, StageError> {
    let result = link.handle(req.into_inner()).await?;
    Ok(HttpResponse::Ok().json(result))
}

pub fn dispatcher_server(
    listener: TcpListener,
    lb_state: LBState,
    max_payload_size: usize,
    workers: usize,
) -> std::io::Result<Server> {
    let api_path = lb_state.stage.api_path();
    let name = web::Data::new(ServiceName(format!(
        "{}-dispatcher",
        lb_state.stage.name()
    )));
    let app_state = web::Data::new(lb_state);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(app_state.clone())
            .app_data(name.clone())
            .app_data(
                web::JsonConfig::default()
                    .limit(max_payload_size)
                    .error_handler(json_error_handler),
            )
            .service(health)
            .service(stats)
            .route(api_path, web::post().to(dispatch))
    })
    .workers(workers)
    .disable_signals()
    .listen(listener)?
    .run();
    Ok(server)
}

pub fn stage_server(
    listener: TcpListener,
    link: StageLink,
    max_payload_size: usize,
    workers: usize,
) -> std::io::Result<Server> {
    let api_path = link.kind().api_path();
    let name = web::Data::new(ServiceName(link.kind().name().to_string()));
    let app_state = web::Data::new(link);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(app_state.clone())
            .app_data(name.clone())
            .app_data(
                web::JsonConfig::default()
                    .limit(max_payload_size)
                    .error_handler(json_error_handler),
            )
            .service(health)
            .route(api_path, web::post().to(process))
    })
    .workers(workers)
    .disable_signals()
    .listen(listener)?
    .run();
    Ok(server)
}

pub async fn startup_dispatcher(lb_config: LBConfig) -> anyhow::Result<()> {
    info!(
        "Starting {} dispatcher at {}:{}",
        lb_config.stage.name(),
        lb_config.host,
        lb_config.port
    );
    let listener = TcpListener::bind((lb_config.host.as_str(), lb_config.port))?;
    let max_payload_size = lb_config.max_payload_size;
    let lb_state = LBState::new(lb_config)?;
    let server = dispatcher_server(listener, lb_state, max_payload_size, num_workers())?;
    serve_until_ctrl_c(server).await
}

pub async fn startup_stage(config: StageConfig) -> anyhow::Result<()> {
    info!(
        "Starting {} stage at {}:{} (downstream: {})",
        config.kind.name(),
        config.host,
        config.port,
        config.downstream_url.as_deref().unwrap_or("none")
    );
    let listener = TcpListener::bind((config.host.as_str(), config.port))?;
    let link = StageLink::new(&config)?;
    let server = stage_server(listener, link, config.max_payload_size, num_workers())?;
    serve_until_ctrl_c(server).await
}

pub async fn serve_until_ctrl_c(server: Server) -> anyhow::Result<()> {
    let handle = server.handle();
    tokio::select! {
        res = server => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            handle.stop(true).await;
        }
    }
    Ok(())
}

fn num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
