//! In-memory engine and host doubles for exercising the coordinator without
//! a real scripting engine.

mod engine;
mod host;

use std::time::Duration;

pub use engine::{
    BASE_PROCESS_ID, FakeCall, FakeDebugger, FakePipeline, FakeRunspace, InvocationRecord,
};
pub use host::{HostEvent, HostLog, RecordingHost, RecordingPromptContext};

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };

    if tokio::time::timeout(Duration::from_secs(5), poll).await.is_err() {
        panic!("timed out waiting for {what}");
    }
}
