use std::time::Duration;

use db::events::RelayFrame;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::services::apply::ApplyService;
use crate::services::config::Config;
use crate::services::shutdown::wait_for_shutdown;

/// Fixed pause between reconnect attempts to the hub.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Outbound frames the client will buffer before senders see back-pressure.
const OUTBOUND_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay outbound channel is full")]
    ChannelFull,
    #[error("relay client is not running")]
    ChannelClosed,
}

/// Cloneable enqueue side of the relay tunnel. `try_send` fails fast when
/// the buffer is full; the destination row stays queued and retries later.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayFrame>,
}

impl RelayHandle {
    pub fn new(tx: mpsc::Sender<RelayFrame>) -> Self {
        Self { tx }
    }

    pub fn try_send(&self, frame: RelayFrame) -> Result<(), RelayError> {
        self.tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RelayError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => RelayError::ChannelClosed,
        })
    }
}

#[derive(Debug, Error)]
enum ConnectionError {
    #[error("invalid hub url: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("hub closed the connection")]
    Closed,
}

/// Persistent connection to the relay hub. Outbound frames come from the
/// sender through the bounded channel; inbound `sync` frames go through the
/// same apply path as HTTP deliveries.
pub struct RelayClient {
    node_id: String,
    hub_url: String,
    token: String,
    apply: ApplyService,
    outbound: mpsc::Receiver<RelayFrame>,
    shutdown: watch::Receiver<bool>,
}

impl RelayClient {
    pub fn new(
        config: &Config,
        apply: ApplyService,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, RelayHandle) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let client = Self {
            node_id: config.node_id.clone(),
            hub_url: config.relay.hub_url.clone().unwrap_or_default(),
            token: config.relay.token.clone().unwrap_or_default(),
            apply,
            outbound: rx,
            shutdown,
        };
        (client, RelayHandle::new(tx))
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        loop {
            match self.connect_and_pump().await {
                Ok(()) => {
                    tracing::info!("relay client stopping");
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        delay_secs = RECONNECT_DELAY.as_secs(),
                        "relay connection lost, reconnecting"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    tracing::info!("relay client stopping");
                    return;
                }
            }
        }
    }

    /// One connection lifetime: drain outbound frames onto the socket and
    /// feed inbound frames to the apply path until either side fails.
    /// Frames already pulled from the channel when the write fails are lost;
    /// their destination rows are still pending and will be re-sent.
    async fn connect_and_pump(&mut self) -> Result<(), ConnectionError> {
        let mut url = Url::parse(&self.hub_url)?;
        url.query_pairs_mut()
            .append_pair("node_id", &self.node_id)
            .append_pair("token", &self.token);

        tracing::info!(hub = %self.hub_url, "connecting to relay hub");
        let (socket, _) = connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();
        tracing::info!("relay hub connected");

        loop {
            tokio::select! {
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else {
                        return Err(ConnectionError::Closed);
                    };
                    match serde_json::to_string(&frame) {
                        Ok(raw) => sink.send(Message::Text(raw)).await?,
                        Err(err) => {
                            tracing::error!(error = %err, "dropping unserializable frame");
                        }
                    }
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            handle_frame_text(&self.apply, &text).await;
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) | None => return Err(ConnectionError::Closed),
                        Some(Err(err)) => return Err(err.into()),
                    }
                }
                _ = wait_for_shutdown(&mut self.shutdown) => return Ok(()),
            }
        }
    }
}

/// Decodes one inbound frame and applies `sync` payloads. Shared with tests;
/// relay deliveries have no TCP peer address, so no URL is inferred.
pub(crate) async fn handle_frame_text(apply: &ApplyService, text: &str) {
    let frame: RelayFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(error = %err, "undecodable relay frame");
            return;
        }
    };

    match frame.decode_sync() {
        Some(Ok(envelope)) => {
            if let Err(err) = apply.process_envelope(&envelope, None).await {
                tracing::error!(
                    event_id = %envelope.event_id,
                    error = %err,
                    "relay-delivered event failed to apply"
                );
            }
        }
        Some(Err(err)) => tracing::warn!(error = %err, "undecodable sync payload"),
        None => tracing::debug!(source = %frame.source, "ignoring non-sync frame"),
    }
}
