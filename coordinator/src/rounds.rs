//! The quorum barrier of the coordinator.
//!
//! Every round key owns an `AggregationRound` from its first contribution until its outcome
//! is published. All the callers of a round wait on the same `watch` channel, which is
//! written exactly once while the table lock is held.

use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    sync::{Arc, Weak},
    time::Duration,
};

use comms::{
    AggregationError, ParameterSet,
    specs::{AggregatedResult, Contribution, RoundKey},
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use reduction::Reducer;
use tokio::{sync::watch, task::AbortHandle, time};

/// What every caller of a round eventually receives.
pub type Outcome = Result<Arc<AggregatedResult>, AggregationError>;

type Release = watch::Sender<Option<Outcome>>;

/// The state of one round that hasn't reached quorum yet.
struct AggregationRound {
    key: RoundKey,
    contributions: BTreeMap<u32, Contribution>,
    release: Release,
    deadline: AbortHandle,
}

impl AggregationRound {
    fn new(key: RoundKey, deadline: AbortHandle) -> Self {
        let (release, _) = watch::channel(None);

        Self {
            key,
            contributions: BTreeMap::new(),
            release,
            deadline,
        }
    }

    /// Checks `contribution` against the first one of the round.
    fn check_compatible(&self, contribution: &Contribution) -> Result<(), AggregationError> {
        let Some(first) = self.contributions.values().next() else {
            return Ok(());
        };

        let (expected, got) = (&first.header, &contribution.header);
        if expected.reduction != got.reduction {
            return Err(AggregationError::schema(
                "<reduction>",
                format!("round uses {:?}, got {:?}", expected.reduction, got.reduction),
            ));
        }

        if expected.kind != got.kind {
            return Err(AggregationError::schema(
                "<payload kind>",
                format!("round carries {:?}, got {:?}", expected.kind, got.kind),
            ));
        }

        first.params.check_schema(&contribution.params)
    }

    /// Reduces the contributions in worker id order.
    fn reduce(&self) -> Outcome {
        let Some(first) = self.contributions.values().next() else {
            return Err(AggregationError::EmptyRound);
        };

        let inputs: Vec<&ParameterSet> = self.contributions.values().map(|c| &c.params).collect();
        let params = first.header.reduction.reduce(&inputs)?;

        let total_samples = self
            .contributions
            .values()
            .fold(0u64, |acc, c| acc.saturating_add(c.header.sample_count));

        Ok(Arc::new(AggregatedResult {
            round: self.key,
            contributors: self.contributions.len() as u32,
            total_samples,
            params,
        }))
    }

    /// Publishes the outcome to every waiter and tears the round down.
    fn release(self, outcome: Outcome) {
        self.deadline.abort();
        self.release.send_replace(Some(outcome));
    }
}

#[derive(Default)]
struct TableState {
    rounds: BTreeMap<RoundKey, AggregationRound>,
    watermark: Option<RoundKey>,
}

impl TableState {
    fn is_stale(&self, key: RoundKey) -> Option<RoundKey> {
        self.watermark.filter(|&watermark| key <= watermark)
    }

    /// Raises the watermark to `key` and fails the rounds it supersedes.
    fn finish(&mut self, key: RoundKey) {
        if self.watermark.is_none_or(|watermark| key > watermark) {
            self.watermark = Some(key);
        }

        let alive = self.rounds.split_off(&key);
        let superseded = std::mem::replace(&mut self.rounds, alive);

        for (round, state) in superseded {
            warn!(
                contributors = state.contributions.len();
                "round {round} superseded by {key}"
            );

            state.release(Err(AggregationError::StaleRound {
                round,
                watermark: key,
            }));
        }
    }
}

/// The table of in flight rounds, shared by every connection of the coordinator.
#[derive(Clone)]
pub struct RoundTable {
    state: Arc<Mutex<TableState>>,
    total_clients: NonZeroUsize,
    round_timeout: Duration,
}

impl RoundTable {
    /// Creates a new `RoundTable`.
    ///
    /// # Arguments
    /// * `total_clients` - The amount of contributions that completes a round.
    /// * `round_timeout` - How long a round may collect, measured from its first contribution.
    ///
    /// # Returns
    /// A new `RoundTable` instance.
    pub fn new(total_clients: NonZeroUsize, round_timeout: Duration) -> Self {
        Self {
            state: Arc::default(),
            total_clients,
            round_timeout,
        }
    }

    pub fn total_clients(&self) -> NonZeroUsize {
        self.total_clients
    }

    pub fn round_timeout(&self) -> Duration {
        self.round_timeout
    }

    /// The highest round key that already finished.
    pub fn watermark(&self) -> Option<RoundKey> {
        self.state.lock().watermark
    }

    /// The amount of rounds still collecting contributions.
    pub fn active_rounds(&self) -> usize {
        self.state.lock().rounds.len()
    }

    /// Records a contribution toward its round.
    ///
    /// Must be called within a tokio runtime, the first contribution of a round starts its
    /// deadline timer.
    ///
    /// # Arguments
    /// * `contribution` - A worker's payload and header.
    ///
    /// # Returns
    /// A `Pending` that resolves once the round is released, or an error if the contribution
    /// was rejected. A rejected duplicate, unknown or stale contribution leaves every round
    /// untouched, while a schema mismatch fails the whole round.
    pub fn submit(&self, contribution: Contribution) -> Result<Pending, AggregationError> {
        let key = contribution.header.round;
        let worker_id = contribution.header.worker_id;
        let total = self.total_clients.get();

        if worker_id as usize >= total {
            warn!(worker_id = worker_id, total_clients = total; "unknown contributor");
            return Err(AggregationError::UnknownContributor {
                worker_id,
                total_clients: total,
            });
        }

        let mut state = self.state.lock();

        if let Some(watermark) = state.is_stale(key) {
            warn!(worker_id = worker_id; "rejected contribution to stale round {key}");
            return Err(AggregationError::StaleRound {
                round: key,
                watermark,
            });
        }

        let round = state.rounds.entry(key).or_insert_with(|| {
            info!(total_clients = total; "round {key} created");
            AggregationRound::new(key, self.spawn_deadline(key))
        });

        if round.contributions.contains_key(&worker_id) {
            warn!(worker_id = worker_id; "duplicate contribution to round {key}");
            return Err(AggregationError::DuplicateContributor {
                worker_id,
                round: key,
            });
        }

        if let Err(e) = round.check_compatible(&contribution) {
            warn!(worker_id = worker_id; "round {key} failed: {e}");

            if let Some(round) = state.rounds.remove(&key) {
                round.release(Err(e.clone()));
            }

            state.finish(key);
            return Err(e);
        }

        let rx = round.release.subscribe();
        round.contributions.insert(worker_id, contribution);

        let received = round.contributions.len();
        debug!(worker_id = worker_id, received = received; "contribution to round {key}");

        if received == total {
            if let Some(round) = state.rounds.remove(&key) {
                let outcome = round.reduce();
                match &outcome {
                    Ok(result) => info!(
                        contributors = result.contributors,
                        total_samples = result.total_samples;
                        "round {key} completed"
                    ),
                    Err(e) => warn!("round {key} failed to reduce: {e}"),
                }

                round.release(outcome);
            }

            state.finish(key);
        }

        Ok(Pending { key, rx })
    }

    /// Starts the timer that fails the round at `key` once its deadline elapses.
    fn spawn_deadline(&self, key: RoundKey) -> AbortHandle {
        let state = Arc::downgrade(&self.state);
        let timeout = self.round_timeout;

        tokio::spawn(async move {
            time::sleep(timeout).await;
            expire(&state, key);
        })
        .abort_handle()
    }
}

fn expire(state: &Weak<Mutex<TableState>>, key: RoundKey) {
    let Some(state) = state.upgrade() else {
        return;
    };

    let mut state = state.lock();
    let Some(round) = state.rounds.remove(&key) else {
        return;
    };

    warn!(
        contributors = round.contributions.len();
        "round {key} timed out before reaching quorum"
    );

    round.release(Err(AggregationError::RoundTimeout { round: key }));
    state.finish(key);
}

/// A submitted contribution waiting for its round to be released.
#[derive(Debug)]
pub struct Pending {
    key: RoundKey,
    rx: watch::Receiver<Option<Outcome>>,
}

impl Pending {
    pub fn key(&self) -> RoundKey {
        self.key
    }

    /// Waits until the round is released.
    ///
    /// # Returns
    /// The same outcome every other caller of the round receives.
    pub async fn wait(mut self) -> Outcome {
        let timeout = AggregationError::RoundTimeout { round: self.key };

        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(timeout)),
            // The round was dropped without an outcome.
            Err(_) => Err(timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use comms::{
        Tensor,
        specs::{ContributionHeader, PayloadKind, Reduction},
    };
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    fn table(total: usize) -> RoundTable {
        RoundTable::new(NonZeroUsize::new(total).unwrap(), Duration::from_secs(60))
    }

    fn contribution(round: u64, worker_id: u32, value: f32) -> Contribution {
        contribution_with(round, worker_id, Tensor::vector(&[value]))
    }

    fn contribution_with(round: u64, worker_id: u32, tensor: Tensor) -> Contribution {
        Contribution {
            header: ContributionHeader {
                round: RoundKey::payload(round),
                worker_id,
                sample_count: 1,
                kind: PayloadKind::Parameters,
                reduction: Reduction::Mean,
            },
            params: [("w1", tensor)].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn nobody_is_released_before_quorum() {
        let table = table(3);

        let mut first = task::spawn(table.submit(contribution(1, 0, 2.0)).unwrap().wait());
        let mut second = task::spawn(table.submit(contribution(1, 1, 4.0)).unwrap().wait());
        assert_pending!(first.poll());
        assert_pending!(second.poll());
        assert_eq!(table.active_rounds(), 1);

        let third = table.submit(contribution(1, 2, 6.0)).unwrap().wait().await.unwrap();
        assert!(first.is_woken());
        assert!(second.is_woken());

        let first = assert_ready!(first.poll()).unwrap();
        let second = assert_ready!(second.poll()).unwrap();
        assert!(Arc::ptr_eq(&first, &third));
        assert!(Arc::ptr_eq(&second, &third));

        assert_eq!(third.contributors, 3);
        assert_eq!(third.total_samples, 3);
        assert_eq!(third.params.get("w1").unwrap().to_vec::<f32>().unwrap(), [4.0]);
        assert_eq!(table.active_rounds(), 0);
        assert_eq!(table.watermark(), Some(RoundKey::payload(1)));
    }

    #[tokio::test]
    async fn duplicate_leaves_round_intact() {
        let table = table(2);

        let pending = table.submit(contribution(1, 0, 1.0)).unwrap();
        let err = table.submit(contribution(1, 0, 1.0)).unwrap_err();
        assert_eq!(
            err,
            AggregationError::DuplicateContributor {
                worker_id: 0,
                round: RoundKey::payload(1),
            }
        );

        table.submit(contribution(1, 1, 3.0)).unwrap();
        let result = pending.wait().await.unwrap();
        assert_eq!(result.params.get("w1").unwrap().to_vec::<f32>().unwrap(), [2.0]);
    }

    #[tokio::test]
    async fn unknown_contributor_is_rejected() {
        let table = table(3);

        let err = table.submit(contribution(1, 3, 1.0)).unwrap_err();
        assert_eq!(
            err,
            AggregationError::UnknownContributor {
                worker_id: 3,
                total_clients: 3,
            }
        );
        assert_eq!(table.active_rounds(), 0);
    }

    #[tokio::test]
    async fn schema_mismatch_fails_every_waiter() {
        let table = table(3);

        let pending = table
            .submit(contribution_with(1, 0, Tensor::vector(&[0.0f32; 4])))
            .unwrap();
        let err = table
            .submit(contribution_with(1, 1, Tensor::vector(&[0.0f32; 5])))
            .unwrap_err();

        assert!(matches!(&err, AggregationError::SchemaMismatch { key, .. } if key == "w1"));
        assert_eq!(pending.wait().await.unwrap_err(), err);
        assert_eq!(table.active_rounds(), 0);
    }

    #[tokio::test]
    async fn mixed_reductions_fail_the_round() {
        let table = table(2);

        let pending = table.submit(contribution(1, 0, 1.0)).unwrap();
        let mut summed = contribution(1, 1, 1.0);
        summed.header.reduction = Reduction::Sum;

        let err = table.submit(summed).unwrap_err();
        assert!(matches!(err, AggregationError::SchemaMismatch { .. }));
        assert_eq!(pending.wait().await.unwrap_err(), err);
    }

    #[tokio::test]
    async fn older_round_after_newer_one_is_stale() {
        let table = table(2);

        let pending = table.submit(contribution(6, 0, 1.0)).unwrap();
        table.submit(contribution(6, 1, 3.0)).unwrap();
        let result = pending.wait().await.unwrap();

        let err = table.submit(contribution(5, 0, 100.0)).unwrap_err();
        assert_eq!(
            err,
            AggregationError::StaleRound {
                round: RoundKey::payload(5),
                watermark: RoundKey::payload(6),
            }
        );

        assert_eq!(result.params.get("w1").unwrap().to_vec::<f32>().unwrap(), [2.0]);
        assert_eq!(table.active_rounds(), 0);
    }

    #[tokio::test]
    async fn finishing_a_round_supersedes_older_ones() {
        let table = table(2);

        let old = table.submit(contribution(5, 0, 1.0)).unwrap();
        table.submit(contribution(6, 0, 1.0)).unwrap();
        table.submit(contribution(6, 1, 1.0)).unwrap();

        assert!(matches!(
            old.wait().await.unwrap_err(),
            AggregationError::StaleRound { .. }
        ));
        assert_eq!(table.active_rounds(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_round_releases_waiters() {
        let table = RoundTable::new(NonZeroUsize::new(3).unwrap(), Duration::from_secs(5));

        let first = table.submit(contribution(1, 0, 1.0)).unwrap();
        let second = table.submit(contribution(1, 1, 1.0)).unwrap();

        let timeout = AggregationError::RoundTimeout {
            round: RoundKey::payload(1),
        };
        assert_eq!(first.wait().await.unwrap_err(), timeout);
        assert_eq!(second.wait().await.unwrap_err(), timeout);
        assert_eq!(table.watermark(), Some(RoundKey::payload(1)));

        let err = table.submit(contribution(1, 2, 1.0)).unwrap_err();
        assert!(matches!(err, AggregationError::StaleRound { .. }));

        let pending: Vec<_> = (0..3)
            .map(|id| table.submit(contribution(2, id, 1.0)).unwrap())
            .collect();
        for pending in pending {
            assert_eq!(pending.wait().await.unwrap().contributors, 3);
        }
    }

    #[tokio::test]
    async fn bool_payloads_fail_at_reduction() {
        let table = table(1);
        let mask = Tensor::from_bools(&[1], &[true]).unwrap();

        let err = table
            .submit(contribution_with(1, 0, mask))
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, AggregationError::UnsupportedDtype { .. }));
    }
}
