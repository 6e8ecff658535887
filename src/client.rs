//! Asynchronous INDI client
//!
//! Owns the TCP connection, the writer task, and the listener task. The
//! listener is the only registry mutator; every other thread observes
//! through the shared-state accessors or the broadcast event channel.
//! Disconnection is cooperative: the listener is signalled over a oneshot
//! channel and joined, never aborted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::dispatch::dispatch;
use crate::error::{DispatchError, IndiError, IndiResult};
use crate::protocol::PROTOCOL_VERSION;
use crate::registry::{ElementValue, Property};
use crate::state::{ChangeSet, PropertyChange, ServerMessage, Shared};
use crate::wire;
use crate::xml::ElementReader;
use crate::{BlobPolicy, ClientConfig, DisconnectReason, PropertyState};

/// Events broadcast to subscribers as the registry changes.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    DeviceDefined(String),
    PropertyDefined { device: String, property: String },
    PropertyUpdated { device: String, property: String },
    PropertyDeleted { device: String, property: String },
    DeviceDeleted(String),
    Message(ServerMessage),
    BlobReceived {
        device: String,
        property: String,
        element: String,
        path: PathBuf,
    },
    ConnectionStateChanged(bool),
}

/// INDI protocol client.
///
/// ```no_run
/// # use indi_client::{ClientConfig, IndiClient};
/// # async fn demo() -> indi_client::IndiResult<()> {
/// let mut client = IndiClient::new(ClientConfig::default());
/// client.watch_device("CCD Simulator");
/// client.connect_server().await?;
/// client.send_new_switch("CCD Simulator", "CONNECTION", "CONNECT").await?;
/// # Ok(())
/// # }
/// ```
pub struct IndiClient {
    config: ClientConfig,
    watched: Vec<String>,
    connected: Arc<AtomicBool>,
    shared: Arc<Mutex<Shared>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    listener: Option<JoinHandle<()>>,
    event_tx: broadcast::Sender<ClientEvent>,
}

impl Default for IndiClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl IndiClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            config,
            watched: Vec::new(),
            connected: Arc::new(AtomicBool::new(false)),
            shared: Arc::new(Mutex::new(Shared::default())),
            shutdown_tx: None,
            listener: None,
            event_tx,
        }
    }

    /// Change the target server. Takes effect on the next connect.
    pub fn set_server(&mut self, host: &str, port: u16) {
        self.config.host = host.to_string();
        self.config.port = port;
    }

    /// Restrict `getProperties` to the named device. May be called multiple
    /// times; with no watched devices, all devices are requested.
    pub fn watch_device(&mut self, device: &str) {
        if !self.watched.iter().any(|d| d == device) {
            self.watched.push(device.to_string());
        }
    }

    pub fn verbosity(&self) -> u8 {
        self.config.verbosity
    }

    pub fn set_verbosity(&mut self, verbosity: u8) {
        self.config.verbosity = verbosity;
    }

    /// Subscribe to registry change events. Slow subscribers miss events
    /// rather than backpressuring the listener.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connect, start the writer and listener tasks, and request property
    /// definitions. Returns once the transport is up; definitions stream in
    /// asynchronously. A no-op when already connected.
    pub async fn connect_server(&mut self) -> IndiResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let stream = match timeout(self.config.connect_timeout(), TcpStream::connect(&addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(IndiError::ConnectionFailed(err.to_string())),
            Err(_) => {
                return Err(IndiError::ConnectionTimeout {
                    host: self.config.host.clone(),
                    port: self.config.port,
                    duration: self.config.connect_timeout(),
                })
            }
        };
        info!(%addr, "connected to INDI server");
        let (reader, mut writer) = stream.into_split();

        let verbosity = self.config.verbosity;
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<String>(100);
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if verbosity >= 2 {
                    trace!(%cmd, "sending");
                }
                if let Err(err) = writer.write_all(cmd.as_bytes()).await {
                    if verbosity >= 1 {
                        warn!(%err, "write failed, stopping writer");
                    }
                    break;
                }
            }
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);
        self.connected.store(true, Ordering::SeqCst);
        {
            let mut shared = self.shared.lock().await;
            shared.disconnect_reason = None;
            shared.cmd_tx = Some(cmd_tx.clone());
        }
        let _ = self.event_tx.send(ClientEvent::ConnectionStateChanged(true));

        if self.watched.is_empty() {
            self.send_command(wire::get_properties(PROTOCOL_VERSION, None))
                .await?;
        } else {
            for device in &self.watched {
                let cmd = wire::get_properties(PROTOCOL_VERSION, Some(device));
                cmd_tx
                    .send(cmd)
                    .await
                    .map_err(|err| IndiError::SendFailure(err.to_string()))?;
            }
        }
        // Apply the configured BLOB policy to watched devices up front; the
        // server default is Never.
        if self.config.blob_policy != BlobPolicy::Never {
            for device in &self.watched {
                let cmd = wire::enable_blob(device, None, self.config.blob_policy);
                cmd_tx
                    .send(cmd)
                    .await
                    .map_err(|err| IndiError::SendFailure(err.to_string()))?;
            }
        }

        let shared = Arc::clone(&self.shared);
        let connected = Arc::clone(&self.connected);
        let events = self.event_tx.clone();
        let download_dir = self
            .config
            .download_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        self.listener = Some(tokio::spawn(async move {
            let result = listen(
                reader,
                shutdown_rx,
                &shared,
                &events,
                &download_dir,
                verbosity,
            )
            .await;
            let reason = match result {
                Ok(()) => DisconnectReason::Clean,
                Err(err) => {
                    if verbosity >= 1 {
                        warn!(%err, "listener exited with error");
                    }
                    DisconnectReason::Error(err.to_string())
                }
            };
            connected.store(false, Ordering::SeqCst);
            shared.lock().await.reset_on_disconnect(reason);
            let _ = events.send(ClientEvent::ConnectionStateChanged(false));
        }));
        Ok(())
    }

    /// Signal the listener and wait for it to finish. Idempotent; safe to
    /// call while disconnected.
    pub async fn disconnect_server(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.listener.take() {
            if let Err(err) = handle.await {
                warn!(%err, "listener task panicked");
            }
        }
    }

    /// Queue a raw command for the writer task.
    pub async fn send_command(&self, command: String) -> IndiResult<()> {
        if !self.is_connected() {
            return Err(IndiError::NotConnected);
        }
        let tx = self
            .shared
            .lock()
            .await
            .cmd_tx
            .clone()
            .ok_or(IndiError::NotConnected)?;
        tx.send(command)
            .await
            .map_err(|err| IndiError::SendFailure(err.to_string()))
    }

    /// Update text elements: the property goes Busy locally and a
    /// `newTextVector` carrying every element is sent. Unknown targets are
    /// logged and ignored.
    pub async fn send_new_text(
        &self,
        device: &str,
        property: &str,
        elements: &[(&str, &str)],
    ) -> IndiResult<()> {
        let command = self
            .shared
            .lock()
            .await
            .apply_new_text(device, property, elements);
        match command {
            Some(command) => self.send_command(command).await,
            None => {
                debug!(device, property, "text update for unknown property, dropped");
                Ok(())
            }
        }
    }

    /// Update number elements; same contract as [`Self::send_new_text`].
    pub async fn send_new_number(
        &self,
        device: &str,
        property: &str,
        elements: &[(&str, f64)],
    ) -> IndiResult<()> {
        let command = self
            .shared
            .lock()
            .await
            .apply_new_number(device, property, elements);
        match command {
            Some(command) => self.send_command(command).await,
            None => {
                debug!(device, property, "number update for unknown property, dropped");
                Ok(())
            }
        }
    }

    /// Turn one switch element on. Under an exclusive rule the siblings are
    /// reset locally, and the outbound vector carries every element.
    pub async fn send_new_switch(
        &self,
        device: &str,
        property: &str,
        element: &str,
    ) -> IndiResult<()> {
        let command = self
            .shared
            .lock()
            .await
            .apply_new_switch(device, property, element, true);
        match command {
            Some(command) => self.send_command(command).await,
            None => {
                debug!(
                    device,
                    property, element, "switch update for unknown target, dropped"
                );
                Ok(())
            }
        }
    }

    /// Upload a BLOB vector: `(element, format, payload)` triples, payloads
    /// already encoded (conventionally base64). The property goes Busy
    /// locally when it is known.
    pub async fn send_blob(
        &self,
        device: &str,
        property: &str,
        timestamp: &str,
        elements: &[(&str, &str, &[u8])],
    ) -> IndiResult<()> {
        let mut command = wire::start_blob(device, property, timestamp);
        for (element, format, payload) in elements {
            command.push_str(&wire::one_blob(element, format, payload));
        }
        command.push_str(&wire::finish_blob());
        {
            let mut shared = self.shared.lock().await;
            if let Some(prop) = shared.registry.property_mut(device, property) {
                prop.state = PropertyState::Busy;
            }
        }
        self.send_command(command).await
    }

    /// Set the BLOB delivery policy for a device, or one property of it.
    pub async fn set_blob_mode(
        &self,
        device: &str,
        property: Option<&str>,
        policy: BlobPolicy,
    ) -> IndiResult<()> {
        self.send_command(wire::enable_blob(device, property, policy))
            .await
    }

    /// Names of all known devices, in definition order.
    pub async fn device_list(&self) -> Vec<String> {
        let shared = self.shared.lock().await;
        shared
            .registry
            .devices()
            .iter()
            .map(|d| d.name.clone())
            .collect()
    }

    /// Snapshot of every element of every property of a device, in
    /// definition order, values formatted for display.
    pub async fn property_list(&self, device: &str) -> Vec<PropertyChange> {
        let shared = self.shared.lock().await;
        let Some(device) = shared.registry.device(device) else {
            return Vec::new();
        };
        device
            .properties
            .iter()
            .flat_map(|p| {
                p.elements.iter().map(|e| PropertyChange {
                    device: p.device.clone(),
                    property: p.name.clone(),
                    element: e.name.clone(),
                    value: e.value.display(),
                    state: p.state,
                })
            })
            .collect()
    }

    /// Atomically drain the create/remove/update buffers.
    pub async fn drain_changes(&self) -> ChangeSet {
        self.shared.lock().await.drain_changes()
    }

    pub async fn last_server_message(&self) -> Option<ServerMessage> {
        self.shared.lock().await.last_message.clone()
    }

    pub async fn clear_server_message(&self) {
        self.shared.lock().await.last_message = None;
    }

    /// Whether a BLOB arrived since the flag was last cleared.
    pub async fn has_pending_image_download(&self) -> bool {
        self.shared.lock().await.image_downloaded
    }

    pub async fn clear_pending_image_download(&self) {
        self.shared.lock().await.image_downloaded = false;
    }

    /// Path the most recent BLOB payload was saved under.
    pub async fn last_download_path(&self) -> Option<PathBuf> {
        self.shared.lock().await.last_download_path.clone()
    }

    /// Clone of one property vector, when defined.
    pub async fn property(&self, device: &str, name: &str) -> Option<Property> {
        self.shared.lock().await.registry.property(device, name).cloned()
    }

    /// Whether a switch element is currently on. `None` when the element is
    /// not a defined switch.
    pub async fn switch_is_on(
        &self,
        device: &str,
        property: &str,
        element: &str,
    ) -> Option<bool> {
        let shared = self.shared.lock().await;
        match shared.registry.property(device, property)?.element(element)?.value {
            ElementValue::Switch(on) => Some(on),
            _ => None,
        }
    }

    /// Current value of a number element.
    pub async fn number_value(
        &self,
        device: &str,
        property: &str,
        element: &str,
    ) -> Option<f64> {
        let shared = self.shared.lock().await;
        match shared.registry.property(device, property)?.element(element)?.value {
            ElementValue::Number { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Why the last connection ended. `None` while connected or before the
    /// first connection.
    pub async fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.shared.lock().await.disconnect_reason.clone()
    }
}

/// Listener loop: reads the socket, frames elements, dispatches them under
/// the shared lock, and saves BLOB payloads to disk outside it. Returns
/// `Ok(())` only on a shutdown signal; every other exit is an error the
/// caller turns into the disconnect reason.
async fn listen(
    mut reader: OwnedReadHalf,
    mut shutdown_rx: oneshot::Receiver<()>,
    shared: &Arc<Mutex<Shared>>,
    events: &broadcast::Sender<ClientEvent>,
    download_dir: &std::path::Path,
    verbosity: u8,
) -> IndiResult<()> {
    let mut decoder = ElementReader::new();
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("listener shutting down");
                return Ok(());
            }
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        return Err(IndiError::ConnectionClosed(
                            "server closed the connection".to_string(),
                        ))
                    }
                    Ok(n) => n,
                    Err(err)
                        if err.kind() == std::io::ErrorKind::Interrupted
                            || err.kind() == std::io::ErrorKind::WouldBlock =>
                    {
                        continue
                    }
                    Err(err) => return Err(IndiError::ConnectionClosed(err.to_string())),
                };
                for &byte in &buf[..n] {
                    let Some(root) = decoder.feed(byte)? else {
                        continue;
                    };
                    let artifacts = {
                        let mut guard = shared.lock().await;
                        match dispatch(&mut guard, &root, events, verbosity) {
                            Ok(()) => {}
                            Err(DispatchError::PropertyDuplicated { device, property }) => {
                                if verbosity >= 2 {
                                    trace!(device, property, "property redefinition ignored");
                                }
                            }
                            Err(err) => {
                                if verbosity >= 1 {
                                    warn!(tag = %root.tag, %err, "message dropped");
                                }
                            }
                        }
                        guard.take_pending_blobs()
                    };
                    for artifact in artifacts {
                        let path = download_dir.join(artifact.file_name());
                        match tokio::fs::write(&path, &artifact.data).await {
                            Ok(()) => {
                                shared.lock().await.last_download_path = Some(path.clone());
                                let _ = events.send(ClientEvent::BlobReceived {
                                    device: artifact.device,
                                    property: artifact.property,
                                    element: artifact.element,
                                    path,
                                });
                            }
                            Err(err) => {
                                if verbosity >= 1 {
                                    warn!(path = %path.display(), %err, "BLOB save failed");
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
