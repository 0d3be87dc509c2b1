use crate::Handle;
use celery_sync::{Conduit, Gate, Retriever};
use celery_util::Backoff;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use lapin::{Channel, Connection, ConnectionProperties, Error as LapinError};
use secure_string::SecureString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::select;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Runs in the background, maintains no more than one active connection to a
/// RabbitMQ cluster (referred to herein as **current connection**) identified
/// by the given [`Handle`]. Exposes a cheaply clone-able [`Gateway`], which
/// any number of asynchronous tasks can use to retrieve a fresh [`Channel`]
/// created in the current connection.
///
/// Fully encapsulates reconnection and clean-up logic. Reconnection is
/// triggered whenever a channel is requested and this connector is unable to
/// produce it (likely, because there is no connectivity to the RabbitMQ
/// cluster). Reconnections are performed with an exponential backoff strategy.
/// All connections are properly closed in the background before discarding.
///
/// The clients should keep their copy of [`Gateway`] and re-use it to request
/// a new [`Channel`] whenever the previous channel seems to be no longer
/// working (e.g., the underlying connection was lost). The clients should
/// expect that the gateway may take a long or even indefinite time, depending
/// on the RabbitMQ cluster availability.
///
/// Shutdown of this connector is instance-scoped: dropping the [`Gateway`]
/// handle releases the associated [`Gate`], which signals the background
/// serving loop to close the connection and return.
pub struct Connector {
    name: Arc<str>,
    identifier: Arc<str>,
    dsn: SecureString,
    connection: AsyncMutex<Option<Connection>>,
    discarded_connections: AsyncMutex<FuturesUnordered<JoinHandle<()>>>,
    discarded_count: AtomicUsize,
    backoff: Backoff,
    conduit: Conduit<Channel>,
    gate: Gate,
}

/// An asynchronous gateway to creating and retrieving fresh [`Channel`]s on an
/// internally maintained [`Connection`].
///
/// A gateway is created by [starting](Connector::start) a [`Connector`].
#[derive(Clone)]
pub struct Gateway {
    retriever: Retriever<Channel>,
}

impl Connector {
    /// Creates a new [`Connector`] for the given [`Handle`] and sends it into
    /// the background to lazily serve [`Channel`] requests via the returned
    /// [`Gateway`], which can be cheaply cloned and shared across asynchronous
    /// tasks. Serving stops once `shutdown` is released.
    pub fn start(handle: impl AsRef<Handle>, shutdown: Gate) -> Gateway {
        let handle = handle.as_ref();
        let name = Self::compose_name(handle);
        let identifier = Arc::from(handle.identifier());
        let dsn = handle.dsn().clone();
        let connection = AsyncMutex::new(None);
        let discarded_connections = AsyncMutex::new(FuturesUnordered::new());
        let discarded_count = AtomicUsize::new(0);
        let backoff = Backoff::new(handle.backoff());
        let conduit = Conduit::new();
        let retriever = conduit.retriever();

        let connector = Self {
            name,
            identifier,
            dsn,
            connection,
            discarded_connections,
            discarded_count,
            backoff,
            conduit,
            gate: shutdown,
        };

        tokio::spawn(connector.serve());

        Gateway { retriever }
    }

    /// Composes a human-readable name for this connector.
    fn compose_name(handle: &Handle) -> Arc<str> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        Arc::from(format!(
            "amqp:connector:{}:{}",
            handle.name(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
        ))
    }
}

impl Connector {
    /// Main, long-running serving function that serves incoming [`Channel`]
    /// requests until the shutdown gate opens. After that it falls into the
    /// spindown phase, where it cleans up before returning.
    async fn serve(self) {
        loop {
            let state = select! {
                biased;
                _ = self.gate.opened() => ServingState::Interrupted,
                request = self.conduit.requested() => {
                    select! {
                        biased;
                        _ = self.gate.opened() => ServingState::Interrupted,
                        state = self.receive_request(request) => state,
                    }
                }
            };

            match state {
                ServingState::Ongoing => continue,
                ServingState::Interrupted => break,
            }
        }

        info!(
            name = self.name.as_ref(),
            identifier = self.identifier.as_ref(),
            "closing the RabbitMQ connection",
        );

        self.disconnect().await;
        self.drain_discarded_connections().await;
    }
}

impl Gateway {
    /// Asynchronously requests the linked [`Connector`] to create a fresh
    /// [`Channel`] on its internally maintained [`Connection`] and return said
    /// channel when ready.
    ///
    /// Depending on the connectivity to RabbitMQ this method may take
    /// arbitrarily long to return. Use
    /// [`channel_with_timeout`](Gateway::channel_with_timeout) to limit the
    /// waiting time.
    pub async fn channel(&self) -> Channel {
        self.retriever.anticipate().await
    }

    /// Same as [`channel`](Gateway::channel), but returns [`None`] if waiting
    /// for the [`Channel`] exceeds the given `timeout`.
    pub async fn channel_with_timeout(&self, timeout: Duration) -> Option<Channel> {
        self.retriever.request_with_timeout(timeout).await
    }
}

/// Internal marker that indicates the state of this connector.
enum ServingState {
    Ongoing,
    Interrupted,
}

impl Connector {
    async fn receive_request(&self, request: oneshot::Sender<Channel>) -> ServingState {
        let channel = self.anticipate_channel().await;

        if request.send(channel).is_err() {
            warn!(
                name = self.name.as_ref(),
                identifier = self.identifier.as_ref(),
                "too late to send the requested RabbitMQ channel",
            );
        }

        ServingState::Ongoing
    }

    async fn disconnect(&self) {
        let mut connection_guard = self.connection.lock().await;
        let optional_connection = connection_guard.take();

        if let Some(connection) = optional_connection {
            self.discard_connection(connection).await;
        }
    }

    /// Sequentially waits for and pops off all futures that are busy closing
    /// discarded connections in the background. Returns when the collection of
    /// futures is empty.
    async fn drain_discarded_connections(&self) {
        let mut discarded_connections = self.discarded_connections.lock().await;

        while discarded_connections.next().await.is_some() {}
    }
}

impl Connector {
    /// Repeatedly attempts to create a channel out of an active connection,
    /// infinitely re-connecting if necessary (with a backoff strategy),
    /// returning a channel upon first success.
    async fn anticipate_channel(&self) -> Channel {
        let mut connection_guard = self.connection.lock().await;
        let mut optional_connection = connection_guard.take();

        loop {
            match self.try_create_channel(optional_connection).await {
                Ok(CreatedChannel {
                    connection,
                    channel,
                }) => {
                    *connection_guard = Some(connection);
                    return channel;
                }

                Err(_) => {
                    optional_connection = self.establish_connection().await;
                }
            };
        }
    }

    async fn try_create_channel(
        &self,
        optional_connection: Option<Connection>,
    ) -> Result<CreatedChannel, ConnectorError> {
        let connection = match optional_connection {
            Some(connection) => connection,
            None => return Err(ConnectorError::NoConnection),
        };

        let channel_result = connection.create_channel().await;

        match channel_result {
            Err(error) => {
                warn!(
                    name = self.name.as_ref(),
                    identifier = self.identifier.as_ref(),
                    ?error,
                    error_message = %error,
                    "failed to create a RabbitMQ channel",
                );

                self.discard_connection(connection).await;
                self.backoff.sleep_next().await;

                Err(ConnectorError::ChannelCreationError)
            }

            Ok(channel) => {
                self.backoff.reset();

                Ok(CreatedChannel {
                    channel,
                    connection,
                })
            }
        }
    }

    async fn establish_connection(&self) -> Option<Connection> {
        let connection_properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection_result =
            Connection::connect(self.dsn.unsecure(), connection_properties).await;

        match connection_result {
            Ok(connection) => Some(connection),

            Err(error) => {
                warn!(
                    name = self.name.as_ref(),
                    identifier = self.identifier.as_ref(),
                    ?error,
                    error_message = %error,
                    "failed to establish a RabbitMQ connection",
                );

                self.backoff.sleep_next().await;

                None
            }
        }
    }

    /// Initiates discarding of the given connection. Every once in a while,
    /// this method will also drain discarded connections, so they don't
    /// accumulate indefinitely.
    async fn discard_connection(&self, connection: Connection) {
        let future =
            Self::close_connection(self.name.clone(), self.identifier.clone(), connection);
        let handle = tokio::spawn(future);

        self.discarded_connections.lock().await.push(handle);

        const DISCARDED_COUNT_BETWEEN_CLEANUPS: usize = 10;
        let discarded_count = self.discarded_count.fetch_add(1, Ordering::Relaxed);
        if discarded_count % DISCARDED_COUNT_BETWEEN_CLEANUPS == 0 {
            self.drain_discarded_connections().await;
        }
    }

    async fn close_connection(name: Arc<str>, identifier: Arc<str>, connection: Connection) {
        let result = connection.close(0, "discarded connection").await;

        match result {
            Ok(_) => info!(
                name = name.as_ref(),
                identifier = identifier.as_ref(),
                "closed a discarded RabbitMQ connection",
            ),
            Err(LapinError::InvalidConnectionState(_)) => info!(
                name = name.as_ref(),
                identifier = identifier.as_ref(),
                "discarded a previously lost RabbitMQ connection",
            ),
            Err(LapinError::InvalidChannelState(state)) => info!(
                name = name.as_ref(),
                identifier = identifier.as_ref(),
                "ignored a channel in the invalid state '{:?}' within a discarded RabbitMQ connection",
                state,
            ),
            Err(error) => warn!(
                name = name.as_ref(),
                identifier = identifier.as_ref(),
                ?error,
                error_message = %error,
                "failed to cleanly close a discarded RabbitMQ connection",
            ),
        }
    }
}

struct CreatedChannel {
    connection: Connection,
    channel: Channel,
}

/// Internal error representing the reasons why creating a channel may fail.
#[derive(Error, Debug)]
enum ConnectorError {
    #[error("failed to create a channel: no connection provided")]
    NoConnection,
    #[error("failed to create a channel on the given connection")]
    ChannelCreationError,
}
