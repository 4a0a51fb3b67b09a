//! Public entry point: [`Client`].

use std::sync::Arc;

use crate::connection::{self, Connection};
use crate::subscribe::{self, Shared, SubscriberSetup, SubscriberTask};
use crate::types::{ClientConfig, Error, ErrorHandler, MessageHandler, Role, SubscriberState};

/// Publisher and subscriber over two dedicated backend connections.
///
/// The publish-path connection carries `PUBLISH`/`GET`/`SET` from the calling
/// task. The receive-path connection belongs to the subscriber loop while it
/// runs, and is handed back to the client when the loop is stopped.
///
/// Channels and handler are configured before [`start`](Client::start);
/// changing them while the subscriber runs is rejected with
/// [`Error::SubscriberRunning`].
pub struct Client {
    config: ClientConfig,
    pub(crate) publisher: Option<Connection>,
    receiver: Option<Connection>,
    channels: Vec<String>,
    handler: Option<MessageHandler>,
    on_error: Option<ErrorHandler>,
    shared: Arc<Shared>,
    task: Option<SubscriberTask>,
}

impl Client {
    /// Open both connections to `config.host:config.port`.
    ///
    /// Fails with [`Error::Connection`] if either connection cannot be opened
    /// or does not answer the `PING` handshake; nothing stays open on failure.
    pub async fn connect(config: ClientConfig) -> Result<Self, Error> {
        let (publisher, receiver) = connection::connect(&config)
            .await
            .inspect_err(|e| tracing::error!("{e}"))?;
        tracing::info!(addr = %config.addr(), "Connected");

        Ok(Self {
            config,
            publisher: Some(publisher),
            receiver: Some(receiver),
            channels: Vec::new(),
            handler: None,
            on_error: None,
            shared: Arc::new(Shared::new()),
            task: None,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether the publish-path connection is live.
    pub fn is_connected(&self) -> bool {
        self.publisher.is_some()
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Replace the channel set. Subscribe order follows iteration order.
    pub fn set_channels<I, S>(&mut self, channels: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_stopped()?;
        self.channels = channels.into_iter().map(Into::into).collect();
        Ok(())
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Replace the message handler.
    pub fn set_handler<F>(&mut self, handler: F) -> Result<(), Error>
    where
        F: Fn(Vec<String>) + Send + Sync + 'static,
    {
        self.ensure_stopped()?;
        self.handler = Some(Arc::new(handler));
        Ok(())
    }

    /// Replace the callback notified when the subscriber loop fails.
    pub fn set_error_handler<F>(&mut self, handler: F) -> Result<(), Error>
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.ensure_stopped()?;
        self.on_error = Some(Arc::new(handler));
        Ok(())
    }

    fn ensure_stopped(&self) -> Result<(), Error> {
        if self.is_running() {
            return Err(Error::SubscriberRunning);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn subscriber_state(&self) -> SubscriberState {
        self.shared.state()
    }

    /// Take the error that stopped the subscriber loop, if any.
    pub fn take_last_error(&self) -> Option<Error> {
        self.shared.take_error()
    }

    /// Launch the subscriber loop on its own task. No-op if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.is_running() {
            return Ok(());
        }
        // A loop that stopped on its own has already released its connection.
        self.task = None;

        let handler = self
            .handler
            .clone()
            .ok_or(Error::NotConfigured("message handler"))?;
        if self.channels.is_empty() {
            return Err(Error::NotConfigured("channel set"));
        }
        let conn = self
            .receiver
            .take()
            .ok_or(Error::Disconnected(Role::Receive))?;

        let setup = SubscriberSetup {
            channels: self.channels.clone().into(),
            handler,
            on_error: self.on_error.clone(),
            timing: self.config.timing.clone(),
        };
        self.shared.set_running(true);
        self.task = Some(subscribe::spawn(conn, setup, self.shared.clone()));
        Ok(())
    }

    /// Stop the subscriber loop and wait for it to exit. No-op if not running.
    ///
    /// A blocked receive is interrupted, so this returns within roughly
    /// `shutdown_timeout`.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.shared.set_running(false);
        task.shutdown.cancel();

        match task.handle.await {
            Ok(Some(conn)) => self.receiver = Some(conn),
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Subscriber task aborted: {e}");
                self.shared.set_state(SubscriberState::Stopped);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connection management
    // -----------------------------------------------------------------------

    /// Stop the subscriber and close both connections. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        self.stop().await;
        for mut conn in [self.publisher.take(), self.receiver.take()]
            .into_iter()
            .flatten()
        {
            tracing::debug!(role = %conn.role(), "Closing connection");
            conn.shutdown().await;
        }
    }

    /// Replace both connections with fresh ones.
    ///
    /// Rejected while the subscriber runs. Needed after a fatal receive error
    /// or a lost publish-path connection, since neither reconnects on its own.
    pub async fn reconnect(&mut self) -> Result<(), Error> {
        self.ensure_stopped()?;
        self.task = None;
        self.publisher = None;
        self.receiver = None;

        let (publisher, receiver) = connection::connect(&self.config)
            .await
            .inspect_err(|e| tracing::error!("Reconnect failed: {e}"))?;
        self.publisher = Some(publisher);
        self.receiver = Some(receiver);
        self.shared.set_state(SubscriberState::Idle);
        tracing::info!(addr = %self.config.addr(), "Reconnected");
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.shared.set_running(false);
            task.shutdown.cancel();
        }
    }
}
