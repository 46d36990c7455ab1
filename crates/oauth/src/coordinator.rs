//! Single-flight refresh coordination.
//!
//! At most one refresh epoch runs per [`CredentialKey`]. The first caller to
//! [`RefreshCoordinator::acquire`] a key becomes the leader; everyone else
//! follows and receives the leader's published [`RefreshOutcome`].

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    dashmap::{DashMap, mapref::entry::Entry},
    tokio::{
        sync::{Mutex, OwnedMutexGuard, watch},
        task::AbortHandle,
    },
    tracing::{debug, warn},
};

use crate::{
    error::TokenError,
    types::{CredentialKey, RefreshOutcome},
};

type OutcomeSlot = Option<RefreshOutcome>;

struct Flight {
    epoch: u64,
    tx: watch::Sender<OutcomeSlot>,
    watchdog: Option<AbortHandle>,
}

#[derive(Debug)]
struct KeyState {
    generation: u64,
}

struct Shared {
    flights: DashMap<CredentialKey, Flight>,
    locks: DashMap<CredentialKey, Arc<Mutex<KeyState>>>,
    watchdog: Duration,
    wait_bound: Duration,
    next_epoch: AtomicU64,
    /// Generations are unique across keys, so a lock entry recreated after
    /// pruning never repeats one an epoch captured earlier.
    next_generation: AtomicU64,
}

impl Shared {
    /// Publish `outcome` for `epoch` and clear the in-flight marker.
    /// Returns false if that epoch was already settled.
    fn settle(&self, key: &CredentialKey, epoch: u64, outcome: RefreshOutcome) -> bool {
        let Entry::Occupied(entry) = self.flights.entry(key.clone()) else {
            return false;
        };
        if entry.get().epoch != epoch {
            return false;
        }
        entry.get().tx.send_replace(Some(outcome));
        let flight = entry.remove();
        if let Some(watchdog) = flight.watchdog {
            watchdog.abort();
        }
        true
    }
}

/// Coordinates refresh epochs. Cheap to clone.
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

/// Result of [`RefreshCoordinator::acquire`].
pub enum Ticket {
    /// Perform the refresh, then [`RefreshCoordinator::publish`].
    Leader(LeaderTicket),
    /// Someone else is refreshing; [`RefreshCoordinator::wait`] for them.
    Follower(FollowerTicket),
}

/// Held by the one caller performing a refresh epoch.
///
/// Dropping it without publishing settles the epoch as a transient failure.
pub struct LeaderTicket {
    key: CredentialKey,
    epoch: u64,
    rx: watch::Receiver<OutcomeSlot>,
    shared: Arc<Shared>,
    published: bool,
}

impl LeaderTicket {
    pub fn key(&self) -> &CredentialKey {
        &self.key
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// A follower ticket on this epoch, for a caller that hands the leader
    /// ticket to a background task.
    pub fn subscribe(&self) -> FollowerTicket {
        FollowerTicket {
            key: self.key.clone(),
            epoch: self.epoch,
            rx: self.rx.clone(),
        }
    }
}

impl Drop for LeaderTicket {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        let settled = self.shared.settle(&self.key, self.epoch, RefreshOutcome::TransientFailure {
            reason: "refresh leader went away before publishing".into(),
            retry_after: None,
        });
        if settled {
            warn!(key = %self.key, epoch = self.epoch, "refresh leader dropped without publishing");
        }
    }
}

/// Waits on another caller's refresh epoch.
pub struct FollowerTicket {
    key: CredentialKey,
    epoch: u64,
    rx: watch::Receiver<OutcomeSlot>,
}

impl FollowerTicket {
    pub fn key(&self) -> &CredentialKey {
        &self.key
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Exclusive hold on a key's generation counter.
///
/// Dropping the last guard for an idle key removes its lock entry.
pub struct KeyGuard {
    key: CredentialKey,
    state: OwnedMutexGuard<KeyState>,
    shared: Arc<Shared>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // The map and this guard hold the only references. Nobody can clone
        // the mutex while `remove_if` holds the shard.
        let flights = &self.shared.flights;
        self.shared.locks.remove_if(&self.key, |key, mutex| {
            Arc::strong_count(mutex) == 2 && !flights.contains_key(key)
        });
    }
}

impl KeyGuard {
    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    /// Invalidate every epoch that started under the current generation.
    pub fn bump(&mut self) -> u64 {
        self.state.generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        self.state.generation
    }
}

impl RefreshCoordinator {
    /// `watchdog` bounds a leader's epoch; `wait_bound` bounds a follower's wait.
    pub fn new(watchdog: Duration, wait_bound: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                flights: DashMap::new(),
                locks: DashMap::new(),
                watchdog,
                wait_bound,
                next_epoch: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn acquire(&self, key: &CredentialKey) -> Ticket {
        let epoch = match self.shared.flights.entry(key.clone()) {
            Entry::Occupied(flight) => {
                let flight = flight.get();
                debug!(%key, epoch = flight.epoch, "joining in-flight refresh");
                return Ticket::Follower(FollowerTicket {
                    key: key.clone(),
                    epoch: flight.epoch,
                    rx: flight.tx.subscribe(),
                });
            },
            Entry::Vacant(slot) => {
                let epoch = self.shared.next_epoch.fetch_add(1, Ordering::Relaxed);
                let (tx, _) = watch::channel(None);
                slot.insert(Flight {
                    epoch,
                    tx,
                    watchdog: None,
                });
                epoch
            },
        };

        let rx = match self.shared.flights.get_mut(key) {
            Some(mut flight) if flight.epoch == epoch => {
                flight.watchdog = self.arm_watchdog(key.clone(), epoch);
                flight.tx.subscribe()
            },
            // Settled already (zero watchdog); hand back a closed epoch.
            _ => watch::channel(None).1,
        };

        debug!(%key, epoch, "leading refresh");
        Ticket::Leader(LeaderTicket {
            key: key.clone(),
            epoch,
            rx,
            shared: self.shared.clone(),
            published: false,
        })
    }

    fn arm_watchdog(&self, key: CredentialKey, epoch: u64) -> Option<AbortHandle> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let bound = self.shared.watchdog;
        let task = runtime.spawn(async move {
            tokio::time::sleep(bound).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let settled = shared.settle(&key, epoch, RefreshOutcome::TransientFailure {
                reason: format!("refresh did not complete within {bound:?}"),
                retry_after: None,
            });
            if settled {
                warn!(%key, epoch, "refresh watchdog fired");
            }
        });
        Some(task.abort_handle())
    }

    /// Publish the epoch's outcome and wake every follower.
    ///
    /// Returns the outcome for the leader's own use. A publish for an epoch
    /// the watchdog already settled is ignored.
    pub fn publish(&self, mut leader: LeaderTicket, outcome: RefreshOutcome) -> RefreshOutcome {
        leader.published = true;
        if !self.shared.settle(&leader.key, leader.epoch, outcome.clone()) {
            warn!(key = %leader.key, epoch = leader.epoch, outcome = outcome.label(), "late publish ignored");
        }
        outcome
    }

    /// Wait for the leader of the follower's epoch to publish.
    pub async fn wait(&self, follower: FollowerTicket) -> Result<RefreshOutcome, TokenError> {
        let FollowerTicket { key, epoch, mut rx } = follower;
        let bound = self.shared.wait_bound;
        let waited = tokio::time::timeout(bound, rx.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(slot)) => Ok((*slot).clone().unwrap_or(RefreshOutcome::TransientFailure {
                reason: "refresh epoch ended without an outcome".into(),
                retry_after: None,
            })),
            Ok(Err(_)) => Ok(RefreshOutcome::TransientFailure {
                reason: "refresh epoch ended without an outcome".into(),
                retry_after: None,
            }),
            Err(_) => {
                warn!(%key, epoch, ?bound, "gave up waiting for refresh");
                Err(TokenError::CoordinatorTimeout { key, waited: bound })
            },
        }
    }

    /// Per-key exclusion guarding the generation counter.
    pub async fn lock(&self, key: &CredentialKey) -> KeyGuard {
        let mutex = self
            .shared
            .locks
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(KeyState {
                    generation: self.shared.next_generation.fetch_add(1, Ordering::Relaxed),
                }))
            })
            .clone();
        KeyGuard {
            key: key.clone(),
            state: mutex.lock_owned().await,
            shared: self.shared.clone(),
        }
    }

    pub fn in_flight(&self, key: &CredentialKey) -> bool {
        self.shared.flights.contains_key(key)
    }

    /// Keys with a live lock entry.
    pub fn tracked_keys(&self) -> usize {
        self.shared.locks.len()
    }
}
