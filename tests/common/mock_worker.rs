use actix_web::dev::ServerHandle;
use actix_web::{App, HttpResponse, HttpServer, web};
use serde_json::{Value, json};
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Configuration for mock worker behavior
#[derive(Clone, Debug)]
pub struct MockWorkerConfig {
    pub api_path: &'static str,
    pub response_delay_ms: u64,
    pub fail_rate: f32,
    /// Answer 200 with a body that is not a result envelope.
    pub malformed_body: bool,
}

impl MockWorkerConfig {
    pub fn healthy(api_path: &'static str) -> Self {
        MockWorkerConfig {
            api_path,
            response_delay_ms: 0,
            fail_rate: 0.0,
            malformed_body: false,
        }
    }

    pub fn failing(api_path: &'static str) -> Self {
        MockWorkerConfig {
            fail_rate: 1.0,
            ..Self::healthy(api_path)
        }
    }

    pub fn malformed(api_path: &'static str) -> Self {
        MockWorkerConfig {
            malformed_body: true,
            ..Self::healthy(api_path)
        }
    }

    pub fn slow(api_path: &'static str, response_delay_ms: u64) -> Self {
        MockWorkerConfig {
            response_delay_ms,
            ..Self::healthy(api_path)
        }
    }
}

struct MockState {
    config: MockWorkerConfig,
    address: String,
    hits: Arc<AtomicUsize>,
}

/// Stage stand-in answering on an ephemeral loopback port.
pub struct MockWorker {
    pub address: String,
    hits: Arc<AtomicUsize>,
    handle: ServerHandle,
}

impl MockWorker {
    /// Must be called inside an actix system.
    pub fn start(config: MockWorkerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let address = listener.local_addr()?.to_string();
        let hits = Arc::new(AtomicUsize::new(0));
        let state = web::Data::new(MockState {
            config: config.clone(),
            address: address.clone(),
            hits: hits.clone(),
        });

        let server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .route(config.api_path, web::post().to(handle_request))
        })
        .workers(1)
        .disable_signals()
        .listen(listener)?
        .run();
        let handle = server.handle();
        actix_web::rt::spawn(server);

        Ok(MockWorker {
            address,
            hits,
            handle,
        })
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub async fn stop(&self) {
        self.handle.stop(false).await;
    }
}

async fn handle_request(body: web::Json<Value>, state: web::Data<MockState>) -> HttpResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);

    if state.config.response_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(state.config.response_delay_ms)).await;
    }

    if state.config.fail_rate > 0.0 && rand::random::<f32>() < state.config.fail_rate {
        return HttpResponse::InternalServerError()
            .json(json!({"detail": format!("mock failure at {}", state.address)}));
    }

    if state.config.malformed_body {
        return HttpResponse::Ok()
            .content_type("text/html")
            .body("<html>oops");
    }

    let words = body
        .get("text")
        .and_then(Value::as_str)
        .map(|t| t.split_whitespace().count())
        .unwrap_or(0);

    HttpResponse::Ok().json(json!({
        "status": "success",
        "message": format!("handled by {}", state.address),
        "word_count": words,
    }))
}
