//! WebSocket control channel connector

use super::{ControlChannel, ControlConnector, ControlEvent, OutgoingFrame};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens control channels over WebSocket
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }

    /// Sender task: writes queued frames to the socket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<OutgoingFrame>,
    ) {
        while let Some(frame) = rx.recv().await {
            let result = match frame {
                OutgoingFrame::Text(text) => write.send(Message::Text(text)).await,
                OutgoingFrame::Close => {
                    let _ = write.close().await;
                    break;
                }
            };
            if let Err(e) = result {
                error!("Failed to send control message: {}", e);
                break;
            }
        }

        debug!("Control sender task terminated");
    }

    /// Receiver task: publishes inbound frames on the channel
    async fn receiver_task(mut read: futures::stream::SplitStream<WsStream>, channel: ControlChannel) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => channel.deliver(ControlEvent::Text(text)),
                Ok(Message::Binary(data)) => channel.deliver(ControlEvent::Binary(Bytes::from(data))),
                Ok(Message::Close(_)) => {
                    info!(url = channel.url(), "Control channel closed by server");
                    break;
                }
                Err(e) => {
                    if !channel.is_closed() {
                        error!("Control channel error: {}", e);
                    }
                    break;
                }
                _ => {}
            }
        }

        channel.deliver(ControlEvent::Closed);
        debug!("Control receiver task terminated");
    }
}

#[async_trait]
impl ControlConnector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<ControlChannel> {
        info!("Connecting control channel: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::ControlChannel(format!("Failed to connect: {}", e)))?;

        debug!("Control channel connected");

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = ControlChannel::new(url.as_str(), tx);

        tokio::spawn(Self::sender_task(write, rx));
        tokio::spawn(Self::receiver_task(read, channel.clone()));

        Ok(channel)
    }
}
