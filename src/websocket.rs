use crate::prelude::*;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Messages waiting for one client before it is considered stalled.
const CLIENT_QUEUE_DEPTH: usize = 32;
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum ChannelData {
    Message(String),
    Shutdown,
}

pub type Sender = mpsc::UnboundedSender<ChannelData>;
pub type Receiver = mpsc::UnboundedReceiver<ChannelData>;

type Outgoing = SplitSink<WebSocketStream<TcpStream>, Message>;
type Connections = Arc<Mutex<HashMap<u64, Client>>>;

/// A connected client. Its writer task owns the socket; the map only ever
/// holds the queue into it, so nothing awaits the network under the lock.
struct Client {
    queue: mpsc::Sender<Message>,
    writer: JoinHandle<()>,
}

/// Pushes every snapshot, as JSON, to every connected websocket client.
pub struct Websocket {
    config: config::Websocket,
    sender: Sender,
    receiver: Mutex<Option<Receiver>>,
    listener: Mutex<Option<TcpListener>>,
    connections: Connections,
    next_id: Arc<AtomicU64>,
    running: AtomicBool,
}

impl Websocket {
    pub fn new(config: config::Websocket) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            config,
            sender,
            receiver: Mutex::new(Some(receiver)),
            listener: Mutex::new(None),
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            running: AtomicBool::new(false),
        }
    }

    /// Binds the listening socket ahead of `start`, returning the bound
    /// address.
    pub async fn bind(&self) -> Result<SocketAddr> {
        let address = format!("{}:{}", self.config.host(), self.config.port());
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| anyhow!("websocket.rs:failed to bind {}: {}", address, e))?;
        let local = listener.local_addr()?;

        *self
            .listener
            .lock()
            .map_err(|_| anyhow!("websocket listener lock poisoned"))? = Some(listener);

        info!("websocket listening on {}", local);
        Ok(local)
    }

    pub async fn start(&self) -> Result<()> {
        let receiver = self
            .receiver
            .lock()
            .map_err(|_| anyhow!("websocket receiver lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("websocket already started"))?;

        let bound = self
            .listener
            .lock()
            .map_err(|_| anyhow!("websocket listener lock poisoned"))?
            .take();
        let listener = match bound {
            Some(listener) => listener,
            None => {
                self.bind().await?;
                self.listener
                    .lock()
                    .map_err(|_| anyhow!("websocket listener lock poisoned"))?
                    .take()
                    .ok_or_else(|| anyhow!("websocket listener missing after bind"))?
            }
        };

        self.running.store(true, Ordering::SeqCst);

        let result = tokio::select! {
            r = self.acceptor(listener) => r,
            r = self.broadcaster(receiver) => r,
        };

        info!("websocket loop exiting");
        result
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.sender.send(ChannelData::Shutdown);

        let clients: Vec<(u64, Client)> = match self.connections.lock() {
            Ok(mut connections) => connections.drain().collect(),
            Err(_) => {
                error!("websocket connections lock poisoned");
                Vec::new()
            }
        };

        for (id, client) in clients {
            // closing the queue lets the writer flush and close the socket
            drop(client.queue);
            let mut writer = client.writer;
            if tokio::time::timeout(SEND_TIMEOUT, &mut writer).await.is_err() {
                debug!("websocket client {}: writer did not finish, aborting", id);
                writer.abort();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    async fn acceptor(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            tokio::spawn(Self::handle_client(
                stream,
                peer,
                self.connections.clone(),
                self.next_id.clone(),
            ));
        }
    }

    async fn handle_client(stream: TcpStream, peer: SocketAddr, connections: Connections, next_id: Arc<AtomicU64>) {
        let socket = match tokio_tungstenite::accept_async(stream).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("websocket handshake with {} failed: {}", peer, e);
                return;
            }
        };

        let id = next_id.fetch_add(1, Ordering::SeqCst);
        let (outgoing, mut incoming) = socket.split();
        let (queue, pending) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let writer = tokio::spawn(Self::writer(id, outgoing, pending));

        match connections.lock() {
            Ok(mut connections) => {
                connections.insert(id, Client { queue, writer });
            }
            Err(_) => {
                error!("websocket connections lock poisoned");
                return;
            }
        }
        info!("websocket client {} connected from {}", id, peer);

        // clients only ever listen; read until they go away
        while let Some(message) = incoming.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("websocket client {}: {}", id, e);
                    break;
                }
            }
        }

        if let Ok(mut connections) = connections.lock() {
            connections.remove(&id);
        }
        info!("websocket client {} disconnected", id);
    }

    async fn writer(id: u64, mut outgoing: Outgoing, mut pending: mpsc::Receiver<Message>) {
        while let Some(message) = pending.recv().await {
            match tokio::time::timeout(SEND_TIMEOUT, outgoing.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("websocket client {}: send failed: {}", id, e);
                    break;
                }
                Err(_) => {
                    warn!("websocket client {}: send timed out", id);
                    break;
                }
            }
        }

        if let Ok(Err(e)) = tokio::time::timeout(SEND_TIMEOUT, outgoing.close()).await {
            debug!("websocket client {}: error on close: {}", id, e);
        }
    }

    async fn broadcaster(&self, mut receiver: Receiver) -> Result<()> {
        while let Some(message) = receiver.recv().await {
            let text = match message {
                ChannelData::Shutdown => break,
                ChannelData::Message(text) => text,
            };

            self.fan_out(&text)?;
        }

        Ok(())
    }

    /// Queues `text` for every client, dropping any whose queue is full or
    /// whose writer has gone.
    fn fan_out(&self, text: &str) -> Result<()> {
        let mut connections = self
            .connections
            .lock()
            .map_err(|_| anyhow!("websocket connections lock poisoned"))?;

        connections.retain(|id, client| match client.queue.try_send(Message::Text(text.to_string())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("websocket client {} is not keeping up, dropped", id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                info!("websocket client {} dropped", id);
                false
            }
        });

        Ok(())
    }
}

#[derive(Serialize)]
struct Update<'a> {
    device_info: &'a DeviceInfo,
    device_state: &'a Snapshot,
}

#[async_trait]
impl Observer for Websocket {
    async fn update(&self, device: &DeviceInfo, snapshot: &Snapshot) {
        let message = Update {
            device_info: device,
            device_state: snapshot,
        };

        match serde_json::to_string(&message) {
            Ok(text) => {
                if self.sender.send(ChannelData::Message(text)).is_err() {
                    warn!("{}: websocket has stopped, dropping update", device.id);
                }
            }
            Err(e) => error!("{}: failed to serialise update: {}", device.id, e),
        }
    }
}
