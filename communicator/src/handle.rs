use std::{borrow::Cow, io, time::Duration};

use comms::{
    AggregationError, CommError, FrameReceiver, FrameSender, ParameterSet, Tensor,
    msg::{Command, Msg},
    specs::{AggregatedResult, Contribution, ContributionHeader, PayloadKind, Reduction, RoundKey},
};
use log::{debug, info, warn};
use reduction::ops;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};

use crate::{Communicator, CommunicatorConfig, Role, Weighting};

/// Extra time a call waits on top of the round timeout before giving up on the coordinator.
pub const CLIENT_GRACE: Duration = Duration::from_secs(5);

/// The key of the sample count exchanged by weighted aggregations.
const SAMPLES_KEY: &str = "samples";

/// A worker's connection to the coordinator.
pub struct CommunicatorHandle<R = OwnedReadHalf, W = OwnedWriteHalf>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    config: CommunicatorConfig,
    rx: FrameReceiver<R>,
    tx: FrameSender<W>,
    /// Set while a request waits for its reply. A request that never finished leaves its
    /// reply in the stream, so the handle refuses any further request.
    in_flight: bool,
}

impl CommunicatorHandle {
    /// Connects to the coordinator at `config.coordinator_addr`.
    ///
    /// # Arguments
    /// * `config` - This process's identity.
    ///
    /// # Returns
    /// A connected handle or an error if the coordinator couldn't be reached.
    pub async fn connect(config: CommunicatorConfig) -> Result<Self, CommError> {
        let connecting = TcpStream::connect(&config.coordinator_addr);
        let stream = time::timeout(config.round_timeout(), connecting)
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("couldn't reach the coordinator at {}", config.coordinator_addr),
                )
            })??;

        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);
        Self::handshake(config, rx, tx).await
    }
}

impl<R, W> CommunicatorHandle<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Identifies this worker over an already established channel.
    ///
    /// # Arguments
    /// * `config` - This process's identity.
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    pub async fn handshake(
        config: CommunicatorConfig,
        rx: FrameReceiver<R>,
        tx: FrameSender<W>,
    ) -> Result<Self, CommError> {
        let mut handle = Self {
            config,
            rx,
            tx,
            in_flight: false,
        };
        let worker_id = handle.config.worker_id;

        match handle.request(&Msg::Control(Command::Connect { worker_id }), None).await? {
            Msg::Control(Command::Ack) => {}
            other => return Err(unexpected("ack", other)),
        }

        info!(
            worker_id = worker_id,
            total_clients = handle.config.total_clients.get();
            "connected to the coordinator as {:?}", handle.role()
        );

        Ok(handle)
    }

    pub fn config(&self) -> &CommunicatorConfig {
        &self.config
    }

    pub fn worker_id(&self) -> u32 {
        self.config.worker_id
    }

    pub fn role(&self) -> Role {
        Role::of(self.config.worker_id)
    }

    /// Closes the connection gracefully.
    pub async fn disconnect(mut self) -> Result<(), CommError> {
        match self.request(&Msg::Control(Command::Disconnect), None).await? {
            Msg::Control(Command::Disconnect) => Ok(()),
            other => Err(unexpected("disconnect", other)),
        }
    }

    /// Sends `msg` and waits for its reply.
    ///
    /// A request that times out, is cancelled or fails on the transport leaves the stream
    /// out of step with the coordinator, every later request then fails with `NotConnected`
    /// and the caller must reconnect.
    ///
    /// # Arguments
    /// * `msg` - The request.
    /// * `round` - The round reported in the `RoundTimeout` if the coordinator doesn't answer,
    ///   `None` reports an io timeout instead.
    async fn request(
        &mut self,
        msg: &Msg<'_>,
        round: Option<RoundKey>,
    ) -> Result<Msg<'static>, CommError> {
        if self.in_flight {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "an earlier request was abandoned, the connection must be reopened",
            )
            .into());
        }

        let deadline = self.config.round_timeout() + CLIENT_GRACE;
        let (rx, tx) = (&mut self.rx, &mut self.tx);
        self.in_flight = true;

        let exchange = async {
            tx.send(msg).await?;
            rx.recv::<Msg<'static>>().await
        };

        let reply = match time::timeout(deadline, exchange).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!("no reply to a {} request after {deadline:?}", msg.kind());
                return Err(match round {
                    Some(round) => AggregationError::RoundTimeout { round }.into(),
                    None => {
                        io::Error::new(io::ErrorKind::TimedOut, "the coordinator didn't reply")
                            .into()
                    }
                });
            }
        };

        // A malformed reply was consumed whole, the stream is still in step.
        if !matches!(reply, Err(CommError::Io(_))) {
            self.in_flight = false;
        }

        reply
    }

    /// Marks the connection as out of step after a reply that answers another request.
    fn out_of_step(&mut self, detail: String) -> CommError {
        warn!(worker_id = self.config.worker_id; "{detail}");
        self.in_flight = true;
        AggregationError::corrupt(detail).into()
    }

    /// Sends a single contribution and waits for its round to be released.
    async fn submit(
        &mut self,
        round: RoundKey,
        params: ParameterSet,
        kind: PayloadKind,
        reduction: Reduction,
        sample_count: u64,
    ) -> Result<AggregatedResult, CommError> {
        let worker_id = self.config.worker_id;
        debug!(
            worker_id = worker_id,
            sample_count = sample_count;
            "aggregating round {round}: {}", params.summary()
        );

        let contribution = Contribution {
            header: ContributionHeader {
                round,
                worker_id,
                sample_count,
                kind,
                reduction,
            },
            params,
        };

        match self.request(&Msg::Contribution(Cow::Owned(contribution)), Some(round)).await? {
            Msg::Aggregated(result) if result.round != round => Err(self.out_of_step(format!(
                "the reply to round {round} answers round {}",
                result.round
            ))),
            Msg::Aggregated(result) => Ok(result.into_owned()),
            other => Err(unexpected("aggregated", other)),
        }
    }
}

impl<R, W> Communicator for CommunicatorHandle<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn worker_id(&self) -> u32 {
        self.config.worker_id
    }

    async fn broadcast(
        &mut self,
        model: &ParameterSet,
        version: u64,
    ) -> Result<ParameterSet, CommError> {
        let round = Some(RoundKey::payload(version));

        match self.role() {
            Role::Coordinator => {
                let msg = Msg::Snapshot {
                    version,
                    params: Cow::Borrowed(model),
                };

                match self.request(&msg, round).await? {
                    Msg::Control(Command::Ack) => Ok(model.clone()),
                    other => Err(unexpected("ack", other)),
                }
            }
            Role::Worker => {
                let msg = Msg::Control(Command::Fetch {
                    min_version: version,
                });

                match self.request(&msg, round).await? {
                    Msg::Snapshot { version: got, .. } if got < version => {
                        Err(self.out_of_step(format!(
                            "fetched version {got} while asking for version {version} or newer"
                        )))
                    }
                    Msg::Snapshot { version, params } => {
                        model.check_schema(&params)?;
                        debug!(version = version; "fetched the canonical model");
                        Ok(params.into_owned())
                    }
                    other => Err(unexpected("snapshot", other)),
                }
            }
        }
    }

    async fn aggregate(
        &mut self,
        payload: &ParameterSet,
        kind: PayloadKind,
        round: u64,
        reduction: Reduction,
        weighting: Weighting,
    ) -> Result<AggregatedResult, CommError> {
        let samples = match weighting {
            Weighting::None => {
                let key = RoundKey::payload(round);
                return self.submit(key, payload.clone(), kind, reduction, 0).await;
            }
            Weighting::BySamples(samples) => samples,
        };

        // Fail before the sample count phase, the other workers would stall otherwise.
        ops::ensure_float(payload)?;

        let counts: ParameterSet = [(SAMPLES_KEY, Tensor::vector(&[samples as f64]))]
            .into_iter()
            .collect();

        let counted = RoundKey::samples(round);
        let global = self
            .submit(counted, counts, PayloadKind::Parameters, Reduction::Sum, samples)
            .await?;

        let total = global
            .params
            .get(SAMPLES_KEY)
            .and_then(|t| t.to_vec::<f64>())
            .and_then(|v| v.first().copied())
            .ok_or_else(|| AggregationError::schema(SAMPLES_KEY, "missing from the round result"))?;

        let weight = if total > 0.0 {
            samples as f64 / total
        } else {
            warn!(
                worker_id = self.config.worker_id;
                "round {round} has no samples, zeroing the payload"
            );
            0.0
        };

        let mut scaled = payload.clone();
        ops::scale(&mut scaled, weight)?;

        self.submit(RoundKey::payload(round), scaled, kind, Reduction::WeightedSum, samples)
            .await
    }
}

/// Turns an unexpected reply into an error, forwarding the coordinator's own errors.
fn unexpected(expected: &'static str, got: Msg<'_>) -> CommError {
    match got {
        Msg::Err(e) => e.into(),
        other => CommError::UnexpectedMessage {
            expected,
            got: other.kind(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use coordinator::Coordinator;
    use tokio::io::{self as tio, DuplexStream, ReadHalf, WriteHalf};
    use tokio_util::sync::CancellationToken;

    use super::*;

    type Duplex = CommunicatorHandle<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn config(worker_id: u32, total: usize) -> CommunicatorConfig {
        CommunicatorConfig::new(worker_id, NonZeroUsize::new(total).unwrap(), "in-memory")
            .with_round_timeout_secs(5)
    }

    /// Serves a single in memory connection with `coordinator`.
    async fn attach(coordinator: &Coordinator, worker_id: u32, total: usize) -> Duplex {
        let (client, server) = tio::duplex(1 << 16);

        let (rx, tx) = tio::split(server);
        let (rx, tx) = comms::channel(rx, tx);
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.handle(rx, tx, CancellationToken::new()).await });

        let (rx, tx) = tio::split(client);
        let (rx, tx) = comms::channel(rx, tx);
        CommunicatorHandle::handshake(config(worker_id, total), rx, tx)
            .await
            .unwrap()
    }

    fn coordinator(total: usize) -> Coordinator {
        Coordinator::new(NonZeroUsize::new(total).unwrap(), Duration::from_secs(5))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn weighted_aggregation_by_samples() {
        let coordinator = coordinator(2);
        let mut a = attach(&coordinator, 0, 2).await;
        let mut b = attach(&coordinator, 1, 2).await;

        let (kind, sum) = (PayloadKind::Parameters, Reduction::Sum);
        let (pa, pb) = (ParameterSet::flat(&[1.0]), ParameterSet::flat(&[3.0]));
        let (ra, rb) = tokio::join!(
            a.aggregate(&pa, kind, 1, sum, Weighting::BySamples(10)),
            b.aggregate(&pb, kind, 1, sum, Weighting::BySamples(30)),
        );

        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra, rb);
        assert_eq!(ra.round, RoundKey::payload(1));
        assert_eq!(ra.total_samples, 40);
        assert_eq!(ra.params, ParameterSet::flat(&[2.5]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zero_samples_zero_the_payload() {
        let coordinator = coordinator(1);
        let mut a = attach(&coordinator, 0, 1).await;

        let result = a
            .aggregate(
                &ParameterSet::flat(&[7.0]),
                PayloadKind::Delta,
                1,
                Reduction::Sum,
                Weighting::BySamples(0),
            )
            .await
            .unwrap();

        assert_eq!(result.params, ParameterSet::flat(&[0.0]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn integer_payloads_cannot_be_weighted() {
        let coordinator = coordinator(2);
        let mut a = attach(&coordinator, 0, 2).await;

        let ints: ParameterSet = [("n", Tensor::vector(&[1i32]))].into_iter().collect();
        let err = a
            .aggregate(&ints, PayloadKind::Parameters, 1, Reduction::Sum, Weighting::BySamples(1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CommError::Aggregation(AggregationError::UnsupportedDtype { .. })
        ));
        assert_eq!(coordinator.table().active_rounds(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn broadcast_checks_the_schema() {
        let coordinator = coordinator(2);
        let mut root = attach(&coordinator, 0, 2).await;
        let mut worker = attach(&coordinator, 1, 2).await;

        let model = ParameterSet::flat(&[1.0, 2.0]);
        let published = root.broadcast(&model, 0).await.unwrap();
        assert_eq!(published, model);

        let fetched = worker.broadcast(&ParameterSet::flat(&[0.0, 0.0]), 0).await.unwrap();
        assert_eq!(fetched, model);

        let err = worker
            .broadcast(&ParameterSet::flat(&[0.0]), 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CommError::Aggregation(AggregationError::SchemaMismatch { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restarting_versions_cannot_replace_the_model() {
        let coordinator = coordinator(2);
        let mut root = attach(&coordinator, 0, 2).await;

        root.broadcast(&ParameterSet::flat(&[3.0]), 3).await.unwrap();
        let err = root.broadcast(&ParameterSet::flat(&[0.0]), 0).await.unwrap_err();

        assert!(matches!(
            err,
            CommError::Aggregation(AggregationError::StaleRound { watermark, .. })
                if watermark == RoundKey::payload(3)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_coordinator_times_out() {
        let (client, server) = tio::duplex(1 << 16);
        let (rx, tx) = tio::split(client);
        let (rx, tx) = comms::channel(rx, tx);

        // Acknowledges the handshake and then stops answering.
        let (srx, stx) = tio::split(server);
        let (mut srx, mut stx) = comms::channel(srx, stx);
        let server = tokio::spawn(async move {
            let _: Msg = srx.recv().await.unwrap();
            stx.send(&Msg::Control(Command::Ack)).await.unwrap();
            let _: Msg = srx.recv().await.unwrap();
            (srx, stx)
        });

        let mut handle = CommunicatorHandle::handshake(config(0, 2), rx, tx).await.unwrap();
        let err = handle
            .aggregate(
                &ParameterSet::flat(&[1.0]),
                PayloadKind::Parameters,
                3,
                Reduction::Mean,
                Weighting::None,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CommError::Aggregation(AggregationError::RoundTimeout { round })
                if round == RoundKey::payload(3)
        ));
        drop(server.await.unwrap());
    }

    /// Acknowledges the handshake, then answers the next request with `reply` after `delay`.
    fn scripted(
        server: DuplexStream,
        delay: Duration,
        reply: AggregatedResult,
    ) -> tokio::task::JoinHandle<()> {
        let (srx, stx) = tio::split(server);
        let (mut srx, mut stx) = comms::channel(srx, stx);

        tokio::spawn(async move {
            let _: Msg = srx.recv().await.unwrap();
            stx.send(&Msg::Control(Command::Ack)).await.unwrap();
            let _: Msg = srx.recv().await.unwrap();

            time::sleep(delay).await;
            stx.send(&Msg::Aggregated(Cow::Owned(reply))).await.unwrap();
        })
    }

    fn result_of(round: u64, value: f32) -> AggregatedResult {
        AggregatedResult {
            round: RoundKey::payload(round),
            contributors: 2,
            total_samples: 0,
            params: ParameterSet::flat(&[value]),
        }
    }

    async fn mean_of(handle: &mut Duplex, round: u64) -> Result<AggregatedResult, CommError> {
        let payload = ParameterSet::flat(&[1.0]);
        handle
            .aggregate(&payload, PayloadKind::Parameters, round, Reduction::Mean, Weighting::None)
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_is_never_taken_for_the_next_round() {
        let (client, server) = tio::duplex(1 << 16);
        let server = scripted(server, Duration::from_secs(20), result_of(3, 99.0));

        let (rx, tx) = tio::split(client);
        let (rx, tx) = comms::channel(rx, tx);
        let mut handle = CommunicatorHandle::handshake(config(0, 2), rx, tx).await.unwrap();

        let err = mean_of(&mut handle, 3).await.unwrap_err();
        assert!(matches!(
            err,
            CommError::Aggregation(AggregationError::RoundTimeout { .. })
        ));

        let err = mean_of(&mut handle, 4).await.unwrap_err();
        assert!(matches!(err, CommError::Io(e) if e.kind() == io::ErrorKind::NotConnected));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn reply_for_another_round_is_rejected() {
        let (client, server) = tio::duplex(1 << 16);
        let server = scripted(server, Duration::ZERO, result_of(3, 99.0));

        let (rx, tx) = tio::split(client);
        let (rx, tx) = comms::channel(rx, tx);
        let mut handle = CommunicatorHandle::handshake(config(0, 2), rx, tx).await.unwrap();

        let err = mean_of(&mut handle, 4).await.unwrap_err();
        assert!(matches!(
            err,
            CommError::Aggregation(AggregationError::CorruptPayload { .. })
        ));
        server.await.unwrap();

        let err = mean_of(&mut handle, 5).await.unwrap_err();
        assert!(matches!(err, CommError::Io(e) if e.kind() == io::ErrorKind::NotConnected));
    }
}
