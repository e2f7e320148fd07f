//! Per-session traffic log.
//!
//! One [`TrafficLogWriter`] (owned by the proxy's collector task) commits
//! completed flows; any number of [`TrafficLogReader`]s take snapshots or follow
//! new flows live. The log is kept sorted by flow timestamp, so a flow that
//! started earlier but finished later is inserted before its successors.

use std::sync::Arc;

use log::debug;
use tokio::sync::{broadcast, RwLock};

use super::types::CapturedFlow;

const LIVE_BUFFER: usize = 256;

#[derive(Debug)]
struct TrafficLog {
    flows: RwLock<Vec<CapturedFlow>>,
    live: broadcast::Sender<CapturedFlow>,
}

/// Creates an empty log and returns its single writer and a reader.
pub fn traffic_log() -> (TrafficLogWriter, TrafficLogReader) {
    let (live, _) = broadcast::channel(LIVE_BUFFER);
    let log = Arc::new(TrafficLog {
        flows: RwLock::new(Vec::new()),
        live,
    });
    (
        TrafficLogWriter {
            log: Arc::clone(&log),
        },
        TrafficLogReader { log },
    )
}

/// Not `Clone`: there is exactly one writer per log.
#[derive(Debug)]
pub struct TrafficLogWriter {
    log: Arc<TrafficLog>,
}

impl TrafficLogWriter {
    pub async fn commit(&self, flow: CapturedFlow) {
        {
            let mut flows = self.log.flows.write().await;
            let at = flows.partition_point(|f| f.timestamp <= flow.timestamp);
            flows.insert(at, flow.clone());
        }
        debug!(
            "[{}] committed flow {} {} {}:{} ({} bytes{})",
            flow.session_id,
            flow.id,
            flow.operation,
            flow.host,
            flow.port,
            flow.total_bytes(),
            if flow.truncated { ", truncated" } else { "" }
        );
        // No subscribers is fine.
        let _ = self.log.live.send(flow);
    }
}

#[derive(Debug, Clone)]
pub struct TrafficLogReader {
    log: Arc<TrafficLog>,
}

impl TrafficLogReader {
    pub async fn snapshot(&self) -> Vec<CapturedFlow> {
        self.log.flows.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.log.flows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.log.flows.read().await.is_empty()
    }

    /// Receives every flow committed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CapturedFlow> {
        self.log.live.subscribe()
    }
}
