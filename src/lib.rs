pub mod bench;
pub mod chain;
pub mod config;
pub mod dataset;
pub mod error;
pub mod fanout;
pub mod io_struct;
pub mod lb_state;
pub mod logging;
pub mod server;
pub mod stage_link;
pub mod strategy_lb;
pub mod transform;
pub mod transport;

pub use chain::{ChainHandle, PipelineChain, RequestState};
pub use config::StageKind;
pub use fanout::{AggregateResult, FanOutClient};
pub use lb_state::{LBConfig, LBState};
pub use stage_link::StageLink;
pub use transform::StageTransform;
