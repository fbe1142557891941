//! Minimal transport session: connect, watch events, send a chat line.
//!
//! Run against a local server:
//! ```sh
//! RUST_LOG=debug cargo run --example connect -- 127.0.0.1:9664
//! ```

use std::time::Duration;

use duplex_transport::{ConnectionManager, Event, SendOptions};
use futures::StreamExt as _;
use serde_json::json;
use tokio::time::timeout;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9664".to_owned());

    let transport = ConnectionManager::connect()
        .endpoints(vec![endpoint])
        .path("/socket/v5")
        .version(0)
        .call()?;

    transport.send_with(
        "talk",
        Some(json!({"text": "hello from duplex-transport"})),
        SendOptions::builder().ackable(true).build(),
    )?;

    let mut events = Box::pin(transport.event_stream());
    while let Ok(Some(event)) = timeout(Duration::from_secs(30), events.next()).await {
        let event = event?;
        info!(topic = %event.topic(), ?event, "bus event");
        if matches!(event, Event::Reload { .. }) {
            break;
        }
    }

    info!(
        lag_ms = transport.average_lag_ms(),
        version = ?transport.version(),
        "session done"
    );
    transport.destroy();
    Ok(())
}
