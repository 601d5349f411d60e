use std::{sync::Arc, time::Duration};

use comms::{AggregationError, ParameterSet, specs::RoundKey};
use log::{debug, warn};
use tokio::{sync::watch, time};

/// A model snapshot and its version.
pub type Snapshot = (u64, Arc<ParameterSet>);

/// The canonical model published by the coordinator role.
///
/// Fetches wait until a version at least as new as the requested one is published.
#[derive(Clone)]
pub struct SnapshotStore {
    tx: Arc<watch::Sender<Option<Snapshot>>>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// The newest published version, if any.
    pub fn version(&self) -> Option<u64> {
        self.tx.borrow().as_ref().map(|(version, _)| *version)
    }

    /// Replaces the canonical model.
    ///
    /// Publishing the current version again is accepted only with identical parameters,
    /// workers may have fetched it already.
    ///
    /// # Arguments
    /// * `version` - The version of `params`.
    /// * `params` - The new canonical model.
    ///
    /// # Returns
    /// A `StaleRound` error naming the current version if `version` is older, or equal with
    /// different parameters.
    pub fn publish(&self, version: u64, params: ParameterSet) -> Result<(), AggregationError> {
        let summary = params.summary();
        let params = Arc::new(params);

        // Ok(replaced) or Err(newest) when rejected.
        let mut outcome = Ok(true);
        self.tx.send_if_modified(|current| {
            if let Some((newest, published)) = current.as_ref() {
                outcome = if *newest > version {
                    Err(*newest)
                } else if *newest < version {
                    Ok(true)
                } else if **published == *params {
                    Ok(false)
                } else {
                    Err(*newest)
                };

                if outcome != Ok(true) {
                    return false;
                }
            }

            *current = Some((version, params));
            true
        });

        match outcome {
            Ok(true) => {
                debug!(version = version; "published snapshot {summary}");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(newest) => {
                warn!(version = version; "rejected a snapshot, version {newest} is published");
                Err(AggregationError::StaleRound {
                    round: RoundKey::payload(version),
                    watermark: RoundKey::payload(newest),
                })
            }
        }
    }

    /// Waits for a snapshot at `min_version` or newer.
    ///
    /// # Arguments
    /// * `min_version` - The oldest acceptable version.
    /// * `timeout` - How long to wait for it to be published.
    ///
    /// # Returns
    /// The snapshot or `RoundTimeout` if none was published in time.
    pub async fn fetch(
        &self,
        min_version: u64,
        timeout: Duration,
    ) -> Result<Snapshot, AggregationError> {
        let mut rx = self.tx.subscribe();
        let newer = |snapshot: &Option<Snapshot>| {
            snapshot
                .as_ref()
                .is_some_and(|(version, _)| *version >= min_version)
        };

        let snapshot = match time::timeout(timeout, rx.wait_for(newer)).await {
            Ok(Ok(snapshot)) => snapshot.clone(),
            _ => None,
        };

        snapshot.ok_or(AggregationError::RoundTimeout {
            round: RoundKey::payload(min_version),
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    #[tokio::test]
    async fn fetch_waits_for_a_recent_enough_version() {
        let store = SnapshotStore::new();
        store.publish(1, ParameterSet::flat(&[1.0])).unwrap();

        let mut fetch = task::spawn(store.fetch(2, Duration::from_secs(60)));
        assert_pending!(fetch.poll());

        store.publish(2, ParameterSet::flat(&[2.0])).unwrap();
        assert!(fetch.is_woken());

        let (version, params) = assert_ready!(fetch.poll()).unwrap();
        assert_eq!(version, 2);
        assert_eq!(*params, ParameterSet::flat(&[2.0]));
    }

    #[tokio::test]
    async fn older_publish_is_rejected() {
        let store = SnapshotStore::new();
        store.publish(3, ParameterSet::flat(&[3.0])).unwrap();

        let err = store.publish(0, ParameterSet::flat(&[0.0])).unwrap_err();
        assert_eq!(
            err,
            AggregationError::StaleRound {
                round: RoundKey::payload(0),
                watermark: RoundKey::payload(3),
            }
        );

        let (version, params) = store.fetch(0, Duration::from_secs(1)).await.unwrap();
        assert_eq!(version, 3);
        assert_eq!(*params, ParameterSet::flat(&[3.0]));
    }

    #[tokio::test]
    async fn same_version_needs_the_same_model() {
        let store = SnapshotStore::new();
        store.publish(1, ParameterSet::flat(&[1.0])).unwrap();

        store.publish(1, ParameterSet::flat(&[1.0])).unwrap();
        assert!(store.publish(1, ParameterSet::flat(&[5.0])).is_err());
        store.publish(2, ParameterSet::flat(&[5.0])).unwrap();
        assert_eq!(store.version(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_times_out_without_a_publisher() {
        let store = SnapshotStore::new();

        let err = store.fetch(0, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, AggregationError::RoundTimeout { .. }));
    }
}
