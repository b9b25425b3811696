//! WebSocket signaling channel

use super::{ChannelEvent, SignalingChannel};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Signaling channel over a WebSocket relay.
///
/// A sender task drains outgoing text into the socket and a receiver task
/// turns socket frames into [`ChannelEvent`]s.
#[derive(Default)]
pub struct WsSignalingChannel {
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    incoming: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsSignalingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender_task(
        mut write: SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
        debug!("Signaling sender task terminated");
    }

    async fn receiver_task(
        mut read: SplitStream<WsStream>,
        tx: mpsc::UnboundedSender<ChannelEvent>,
    ) {
        while let Some(frame) = read.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                // Some relays forward everything as binary
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Dropping non UTF-8 binary signaling frame");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => {
                    info!("Signaling WebSocket closed by relay");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    error!("Signaling WebSocket error: {}", e);
                    break;
                }
            };

            if tx.send(ChannelEvent::Message(text)).is_err() {
                break;
            }
        }

        let _ = tx.send(ChannelEvent::Closed);
        debug!("Signaling receiver task terminated");
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn connect(&mut self, url: &str) -> Result<()> {
        info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::ChannelConnect(e.to_string()))?;

        info!("Connected to signaling server");

        let (write, read) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        self.tasks.push(tokio::spawn(Self::sender_task(write, out_rx)));
        self.tasks.push(tokio::spawn(Self::receiver_task(read, in_tx)));
        self.outgoing = Some(out_tx);
        self.incoming = Some(in_rx);
        Ok(())
    }

    async fn send(&mut self, text: String) -> Result<()> {
        let tx = self.outgoing.as_ref().ok_or(Error::SignalingClosed)?;
        debug!("Sending signaling message ({} bytes)", text.len());
        tx.send(Message::Text(text)).map_err(|_| Error::SignalingClosed)
    }

    async fn recv(&mut self) -> ChannelEvent {
        match self.incoming.as_mut() {
            Some(rx) => rx.recv().await.unwrap_or(ChannelEvent::Closed),
            None => ChannelEvent::Closed,
        }
    }

    async fn close(&mut self) {
        if let Some(tx) = self.outgoing.take() {
            let _ = tx.send(Message::Close(None));
        }
        self.incoming = None;
        for mut task in self.tasks.drain(..) {
            // the sender exits on its own after flushing the close frame
            if tokio::time::timeout(std::time::Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                debug!("Signaling task did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
