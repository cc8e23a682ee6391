// One-call scan driver on top of Session.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::ClientConfig;
pub use crate::engine::events::DeliveredImage;
use crate::engine::events::SessionEvent;
use crate::engine::session::Session;
use crate::error::ScanError;
use crate::source::http_source::HttpTransport;
use crate::source::traits::ScannerTransport;

/// Scan with `task` against the scanner at `base_url` and return every delivered file.
pub async fn run_scan(base_url: &str, task: Value, config: ClientConfig) -> Result<Vec<DeliveredImage>> {
    config.validate()?;
    let transport = Arc::new(HttpTransport::new(base_url).context("building scanner transport")?);
    scan_with(transport, task, config).await
}

/// Same as [`run_scan`] over any transport.
///
/// Errors that stop event polling end the scan; other pipeline errors are
/// logged and the scan keeps going.
pub async fn scan_with(
    transport: Arc<dyn ScannerTransport>,
    task: Value,
    config: ClientConfig,
) -> Result<Vec<DeliveredImage>> {
    let session = Session::new(transport, config).context("creating session")?;
    let mut events = session.subscribe();

    session.open().await.context("opening session")?;
    session.send_task(task).await.context("sending task")?;
    session.start_capturing().await.context("starting capture")?;

    loop {
        match events.recv().await {
            Ok(SessionEvent::ImageReceived { path, .. }) => info!("received {}", path.display()),
            Ok(SessionEvent::CaptureFinished) => break,
            Ok(SessionEvent::Error(e)) => {
                if ends_polling(&e) {
                    session.shutdown();
                    bail!("scan aborted: {}", e);
                }
                warn!("scan error ({}): {}", e.kind(), e);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                // Images are collected from the session, only notifications were lost.
                warn!("missed {} session events", n);
                let snapshot = session.snapshot();
                if snapshot.capture_finished {
                    break;
                }
                if !snapshot.polling && !snapshot.stopping {
                    session.shutdown();
                    bail!("scan aborted: event polling stopped");
                }
            }
            Err(RecvError::Closed) => bail!("session event channel closed"),
        }
    }

    let images = session.delivered_images();
    session.shutdown();
    info!("scan finished with {} images", images.len());
    Ok(images)
}

fn ends_polling(err: &ScanError) -> bool {
    matches!(
        err,
        ScanError::PollingAbandoned { .. }
            | ScanError::CommandFailed {
                method: "waitForEvents",
                ..
            }
    )
}
