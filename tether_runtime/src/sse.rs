//! Server-Sent-Events framing for run events.

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tether_core::RunEvent;
use tracing::warn;

/// Frame sent for the terminal sentinel.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Frame one event as `data: {json}\n\n`. The sentinel frames as [`DONE_FRAME`].
pub fn sse_frame(event: &RunEvent) -> Result<String, serde_json::Error> {
    if event.is_sentinel() {
        return Ok(DONE_FRAME.to_string());
    }
    let json = serde_json::to_string(event)?;
    Ok(format!("data: {json}\n\n"))
}

/// Frame a whole event stream. Events that fail to serialize are logged and skipped.
pub fn sse_stream<S>(events: S) -> BoxStream<'static, String>
where
    S: Stream<Item = RunEvent> + Send + 'static,
{
    events
        .filter_map(|event| async move {
            match sse_frame(&event) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    warn!("Failed to serialize {} event: {}", event.kind(), e);
                    None
                }
            }
        })
        .boxed()
}
