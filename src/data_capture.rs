pub mod flow_recorder;
pub mod traffic_log;
pub mod types;

pub use flow_recorder::FlowRecorder;
pub use traffic_log::{traffic_log, TrafficLogReader, TrafficLogWriter};
pub use types::{CapturedFlow, Direction};
