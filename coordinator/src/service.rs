use std::{borrow::Cow, io, num::NonZeroUsize, time::Duration};

use comms::{
    AggregationError, CommError, FrameReceiver, FrameSender,
    msg::{Command, Msg},
    specs::Contribution,
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{CoordinatorConfig, RoundTable, SnapshotStore, rounds::Outcome};

/// The aggregation server, it owns the round table and the canonical model snapshot and
/// serves every worker connection.
#[derive(Clone)]
pub struct Coordinator {
    table: RoundTable,
    snapshots: SnapshotStore,
}

impl Coordinator {
    /// Creates a new `Coordinator`.
    ///
    /// # Arguments
    /// * `total_clients` - The amount of workers taking part in every round.
    /// * `round_timeout` - How long a round or a snapshot fetch may wait.
    ///
    /// # Returns
    /// A new `Coordinator` instance.
    pub fn new(total_clients: NonZeroUsize, round_timeout: Duration) -> Self {
        Self {
            table: RoundTable::new(total_clients, round_timeout),
            snapshots: SnapshotStore::new(),
        }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self::new(config.total_clients, config.round_timeout())
    }

    pub fn table(&self) -> &RoundTable {
        &self.table
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Accepts worker connections until `shutdown` is cancelled.
    ///
    /// Each connection gets its own task, the in flight ones are drained before returning.
    ///
    /// # Arguments
    /// * `listener` - The bound listener to accept workers from.
    /// * `shutdown` - Stops the server once cancelled.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> io::Result<()> {
        let mut tasks = JoinSet::new();
        info!("coordinator listening at {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    info!("accepted connection from {peer}");

                    let (rx, tx) = stream.into_split();
                    let (rx, tx) = comms::channel(rx, tx);
                    let this = self.clone();
                    let shutdown = shutdown.child_token();

                    tasks.spawn(async move {
                        let res = this.handle(rx, tx, shutdown).await;
                        info!("connection from {peer} closed");
                        res
                    });
                }
                Some(res) = tasks.join_next(), if !tasks.is_empty() => log_connection(res),
            }
        }

        info!("shutting down, draining {} connections", tasks.len());
        while let Some(res) = tasks.join_next().await {
            log_connection(res);
        }

        Ok(())
    }

    /// Serves a single worker connection until it disconnects.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    /// * `shutdown` - Stops serving once cancelled, a request in progress is finished first.
    pub async fn handle<R, W>(
        &self,
        mut rx: FrameReceiver<R>,
        mut tx: FrameSender<W>,
        shutdown: CancellationToken,
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut peer: Option<u32> = None;

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv::<Msg>() => received,
            };

            let msg = match received {
                Ok(msg) => msg,
                Err(CommError::Aggregation(e)) => {
                    warn!("rejected a malformed message: {e}");
                    tx.send(&Msg::Err(e)).await?;
                    continue;
                }
                Err(CommError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };

            let reply = match (msg, peer) {
                (Msg::Control(Command::Connect { worker_id }), _) => {
                    self.identify(worker_id, &mut peer)
                }
                (Msg::Control(Command::Disconnect), _) => {
                    tx.send(&Msg::Control(Command::Disconnect)).await?;
                    break;
                }
                (msg, None) => {
                    warn!("{} message before the worker identified itself", msg.kind());
                    Err(AggregationError::unauthorized(
                        "the connection must identify itself with a connect first",
                    ))
                }
                (Msg::Control(Command::Fetch { min_version }), Some(_)) => {
                    let reply = self
                        .snapshots
                        .fetch(min_version, self.table.round_timeout())
                        .await;

                    match reply {
                        Ok((version, params)) => {
                            let msg = Msg::Snapshot {
                                version,
                                params: Cow::Borrowed(&*params),
                            };
                            tx.send(&msg).await?;
                            continue;
                        }
                        Err(e) => Err(e),
                    }
                }
                (Msg::Snapshot { version, params }, Some(worker_id)) => {
                    if worker_id != 0 {
                        warn!(worker_id = worker_id; "rejected a snapshot publish");
                        Err(AggregationError::unauthorized(format!(
                            "only worker 0 publishes the canonical model, not worker {worker_id}"
                        )))
                    } else {
                        self.snapshots
                            .publish(version, params.into_owned())
                            .map(|()| Msg::Control(Command::Ack))
                    }
                }
                (Msg::Contribution(contribution), Some(worker_id)) => {
                    match self.aggregate(contribution.into_owned(), worker_id).await {
                        Ok(result) => {
                            tx.send(&Msg::Aggregated(Cow::Borrowed(&*result))).await?;
                            continue;
                        }
                        Err(e) => Err(e),
                    }
                }
                (other, Some(worker_id)) => {
                    warn!(worker_id = worker_id; "unexpected {} message", other.kind());
                    Err(AggregationError::corrupt(format!(
                        "the coordinator doesn't accept {} messages",
                        other.kind()
                    )))
                }
            };

            match reply {
                Ok(msg) => tx.send(&msg).await?,
                Err(e) => tx.send(&Msg::Err(e)).await?,
            }
        }

        Ok(())
    }

    /// Binds the connection to `worker_id`.
    ///
    /// # Returns
    /// The `Ack` reply, or an error if the id is outside the quorum or the connection
    /// already identified as another worker.
    fn identify(
        &self,
        worker_id: u32,
        peer: &mut Option<u32>,
    ) -> Result<Msg<'static>, AggregationError> {
        let total_clients = self.table.total_clients().get();
        if worker_id as usize >= total_clients {
            warn!(worker_id = worker_id; "unknown worker tried to connect");
            return Err(AggregationError::UnknownContributor {
                worker_id,
                total_clients,
            });
        }

        if let Some(current) = peer.filter(|&current| current != worker_id) {
            warn!(worker_id = worker_id; "connection of worker {current} changed its identity");
            return Err(AggregationError::unauthorized(format!(
                "the connection is already identified as worker {current}"
            )));
        }

        debug!(worker_id = worker_id; "worker identified");
        *peer = Some(worker_id);
        Ok(Msg::Control(Command::Ack))
    }

    /// Submits a contribution made through the connection of `peer` and waits for its
    /// round to be released.
    async fn aggregate(&self, contribution: Contribution, peer: u32) -> Outcome {
        let worker_id = contribution.header.worker_id;
        if worker_id != peer {
            warn!(worker_id = worker_id; "contribution on behalf of another worker by {peer}");
            return Err(AggregationError::unauthorized(format!(
                "worker {peer} can't contribute as worker {worker_id}"
            )));
        }

        self.table.submit(contribution)?.wait().await
    }
}

fn log_connection(res: Result<io::Result<()>, tokio::task::JoinError>) {
    match res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("connection failed: {e}"),
        Err(e) => warn!("connection task panicked: {e}"),
    }
}
