// Not every test binary uses every helper
#![allow(dead_code)]

pub mod mock_worker;

use stagechain::config::{DEFAULT_MAX_PAYLOAD_SIZE, StageKind};
use stagechain::lb_state::{LBConfig, LBState};
use stagechain::server::dispatcher_server;
use std::net::TcpListener;

pub const SAMPLE_TEXT: &str = "the cat sat on the mat the cat ran";

pub fn lb_config(stage: StageKind, instances: Vec<String>, timeout: u64) -> LBConfig {
    LBConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        stage,
        instances,
        timeout,
        max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
    }
}

/// Starts a dispatcher on an ephemeral port and returns its base URL and state.
pub fn spawn_dispatcher(config: LBConfig) -> (String, LBState) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind dispatcher");
    let url = format!("http://{}", listener.local_addr().expect("local addr"));
    let lb_state = LBState::new(config).expect("create dispatcher state");
    let server = dispatcher_server(listener, lb_state.clone(), DEFAULT_MAX_PAYLOAD_SIZE, 1)
        .expect("start dispatcher");
    actix_web::rt::spawn(server);
    (url, lb_state)
}
