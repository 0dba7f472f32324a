//! In-cluster grain directory for one silo.
//!
//! Every silo owns the partition of the key space that the consistent-hash
//! ring assigns it. [`LocalGrainDirectory`] serves requests for grains it
//! owns from its [`DirectoryPartition`] and forwards the rest to their owner
//! through a [`DirectoryTransport`], counting hops so a request cannot bounce
//! forever between silos that disagree on membership.
//!
//! Membership snapshots are applied with [`LocalGrainDirectory::apply_membership`]
//! or streamed in through [`LocalGrainDirectory::spawn_membership_watch`]; each
//! change is handed to the [`HandoffManager`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DirectoryConfig;
use crate::error::DirectoryError;
use crate::handoff::HandoffManager;
use crate::membership::{DirectoryMembership, MembershipSnapshot, MembershipView};
use crate::model::{ActivationAddress, AddressAndTag, AddressesAndTag, GrainId, SiloAddress};
use crate::partition::DirectoryPartition;

/// Cross-silo calls made by the in-cluster directory.
///
/// `hops` counts how many times the request has already been forwarded.
#[async_trait]
pub trait DirectoryTransport: fmt::Debug + Send + Sync {
    /// Register an activation on `target`.
    async fn register(
        &self,
        target: &SiloAddress,
        address: ActivationAddress,
        single_activation: bool,
        hops: u8,
    ) -> Result<AddressAndTag, DirectoryError>;

    /// Unregister activations on `target`.
    async fn unregister(
        &self,
        target: &SiloAddress,
        addresses: Vec<ActivationAddress>,
        hops: u8,
    ) -> Result<(), DirectoryError>;

    /// Look up a grain on `target`.
    async fn lookup(
        &self,
        target: &SiloAddress,
        grain: GrainId,
        hops: u8,
    ) -> Result<Option<AddressesAndTag>, DirectoryError>;

    /// Hand registrations over to their new owner `target`.
    async fn accept_existing_registrations(
        &self,
        target: &SiloAddress,
        single: Vec<ActivationAddress>,
        multi: Vec<ActivationAddress>,
    ) -> Result<(), DirectoryError>;

    /// Tell `target` to tear down activations that lost a registration race.
    async fn delete_activations(
        &self,
        target: &SiloAddress,
        addresses: Vec<ActivationAddress>,
    ) -> Result<(), DirectoryError>;
}

/// An activation hosted on this silo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalActivation {
    /// Its address.
    pub address: ActivationAddress,
    /// `false` for grains allowing several concurrent activations.
    pub single_activation: bool,
}

/// The activation layer, as seen by the directory.
#[async_trait]
pub trait ActivationSource: fmt::Debug + Send + Sync {
    /// Activations currently hosted on this silo.
    fn local_activations(&self) -> Vec<LocalActivation>;

    /// Tear down duplicate activations.
    async fn destroy_activations(&self, addresses: Vec<ActivationAddress>);
}

enum Route {
    Local,
    /// Owner and the hop count to send with the forwarded call.
    Forward(SiloAddress, u8),
}

/// In-cluster directory service of one silo.
#[derive(Debug)]
pub struct LocalGrainDirectory {
    local_silo: SiloAddress,
    max_hops: u8,
    partition: Arc<DirectoryPartition>,
    membership: Arc<MembershipView>,
    transport: Arc<dyn DirectoryTransport>,
    activations: Arc<dyn ActivationSource>,
    handoff: Arc<HandoffManager>,
    shutdown: CancellationToken,
}

impl LocalGrainDirectory {
    /// Create the directory for `local_silo`. It owns nothing until a
    /// membership snapshot is applied.
    pub fn new(
        local_silo: SiloAddress,
        config: &DirectoryConfig,
        transport: Arc<dyn DirectoryTransport>,
        activations: Arc<dyn ActivationSource>,
    ) -> Arc<Self> {
        let partition = Arc::new(DirectoryPartition::new());
        let membership = Arc::new(MembershipView::new(config.buckets_per_silo()));
        let shutdown = CancellationToken::new();
        let handoff = HandoffManager::new(
            local_silo.clone(),
            config,
            Arc::clone(&partition),
            Arc::clone(&transport),
            Arc::clone(&activations),
            membership.clone(),
            shutdown.child_token(),
        );
        Arc::new(Self {
            local_silo,
            max_hops: config.max_hops(),
            partition,
            membership,
            transport,
            activations,
            handoff,
            shutdown,
        })
    }

    /// This silo's address.
    pub fn local_silo(&self) -> &SiloAddress {
        &self.local_silo
    }

    /// The authoritative partition held by this silo.
    pub fn partition(&self) -> &Arc<DirectoryPartition> {
        &self.partition
    }

    /// The membership in effect.
    pub fn membership(&self) -> Arc<DirectoryMembership> {
        self.membership.current()
    }

    /// The silo owning `grain`, per the current membership.
    pub fn owner(&self, grain: &GrainId) -> Option<SiloAddress> {
        self.membership.current().owner(grain).cloned()
    }

    /// `true` when this silo owns `grain`.
    pub fn is_owner(&self, grain: &GrainId) -> bool {
        self.owner(grain).as_ref() == Some(&self.local_silo)
    }

    fn ensure_running(&self) -> Result<(), DirectoryError> {
        if self.shutdown.is_cancelled() {
            return Err(DirectoryError::NotRunning);
        }
        Ok(())
    }

    fn route(&self, grain: &GrainId, hops: u8) -> Result<Route, DirectoryError> {
        self.ensure_running()?;
        if hops > self.max_hops {
            return Err(DirectoryError::TooManyHops {
                grain: grain.to_string(),
                hops,
            });
        }
        let owner = self.owner(grain).ok_or(DirectoryError::NoActiveSilos)?;
        if owner == self.local_silo {
            return Ok(Route::Local);
        }
        let next = hops.checked_add(1).ok_or_else(|| DirectoryError::TooManyHops {
            grain: grain.to_string(),
            hops,
        })?;
        Ok(Route::Forward(owner, next))
    }

    /// Register an activation with its owner.
    ///
    /// Returns the authoritative registration: the caller's address if it
    /// won, the existing one otherwise.
    pub async fn register(
        &self,
        address: ActivationAddress,
        single_activation: bool,
        hops: u8,
    ) -> Result<AddressAndTag, DirectoryError> {
        match self.route(&address.grain, hops)? {
            Route::Local => Ok(self.partition.register_activation(&address, single_activation)),
            Route::Forward(owner, next) => {
                tracing::trace!(grain = %address.grain, owner = %owner, hops, "Directory: forwarding register");
                self.transport
                    .register(&owner, address, single_activation, next)
                    .await
            }
        }
    }

    /// Unregister an activation at its owner. Mismatches are no-ops.
    pub async fn unregister(&self, address: ActivationAddress, hops: u8) -> Result<(), DirectoryError> {
        self.unregister_many(vec![address], hops).await
    }

    /// Unregister activations, batched per owner.
    ///
    /// Every batch is attempted; the first failure is returned.
    pub async fn unregister_many(
        &self,
        addresses: Vec<ActivationAddress>,
        hops: u8,
    ) -> Result<(), DirectoryError> {
        let mut remote: HashMap<SiloAddress, (u8, Vec<ActivationAddress>)> = HashMap::new();
        for address in addresses {
            match self.route(&address.grain, hops)? {
                Route::Local => {
                    self.partition.unregister_activation(&address);
                }
                Route::Forward(owner, next) => {
                    remote.entry(owner).or_insert((next, Vec::new())).1.push(address)
                }
            }
        }

        let calls = remote
            .into_iter()
            .map(|(owner, (next, batch))| async move { self.transport.unregister(&owner, batch, next).await });
        join_all(calls).await.into_iter().collect()
    }

    /// Look up a grain at its owner.
    pub async fn lookup(
        &self,
        grain: &GrainId,
        hops: u8,
    ) -> Result<Option<AddressesAndTag>, DirectoryError> {
        match self.route(grain, hops)? {
            Route::Local => Ok(self.partition.lookup_activations(grain)),
            Route::Forward(owner, next) => {
                self.transport
                    .lookup(&owner, grain.clone(), next)
                    .await
            }
        }
    }

    /// Answer from the local partition, only if this silo owns `grain`.
    ///
    /// Never blocks and never leaves the process.
    pub fn local_lookup(&self, grain: &GrainId) -> Option<AddressesAndTag> {
        if self.shutdown.is_cancelled() || !self.is_owner(grain) {
            return None;
        }
        self.partition.lookup_activations(grain)
    }

    /// Accept registrations handed over by other silos. Returns the losers.
    pub fn accept_existing_registrations(
        &self,
        single: Vec<ActivationAddress>,
        multi: Vec<ActivationAddress>,
    ) -> Result<Vec<ActivationAddress>, DirectoryError> {
        self.ensure_running()?;
        tracing::debug!(
            silo = %self.local_silo,
            single = single.len(),
            multi = multi.len(),
            "Directory: accepting handed-over registrations"
        );
        Ok(self.handoff.accept_existing_registrations(single, multi))
    }

    /// Tear down local activations that lost a registration race.
    pub async fn delete_activations(&self, addresses: Vec<ActivationAddress>) -> Result<(), DirectoryError> {
        self.ensure_running()?;
        self.activations.destroy_activations(addresses).await;
        Ok(())
    }

    /// Install a new membership snapshot and start the handoff it implies.
    ///
    /// Snapshots older than the installed one are ignored.
    pub fn apply_membership(&self, snapshot: MembershipSnapshot) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let Some((previous, current)) = self.membership.install(snapshot) else {
            tracing::debug!(silo = %self.local_silo, "Directory: ignoring stale membership snapshot");
            return;
        };
        if current.snapshot().changes_since(previous.snapshot()).is_empty() {
            return;
        }
        self.handoff.process_membership_change(&previous, &current);
    }

    /// Follow membership snapshots from `updates` until [`stop`](Self::stop).
    ///
    /// The current value is applied immediately.
    pub fn spawn_membership_watch(
        self: &Arc<Self>,
        mut updates: watch::Receiver<MembershipSnapshot>,
    ) -> JoinHandle<()> {
        let directory = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let snapshot = updates.borrow_and_update().clone();
                directory.apply_membership(snapshot);
                tokio::select! {
                    _ = directory.shutdown.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(silo = %directory.local_silo, "Directory: membership watch stopped");
        })
    }

    /// Wait for queued handoff work to finish.
    pub async fn quiesce(&self) {
        self.handoff.quiesce().await;
    }

    /// Handoff operations dropped after exhausting their retries.
    pub fn dropped_handoff_operations(&self) -> u64 {
        self.handoff.dropped_operations()
    }

    /// Stop the directory: background work ends and calls fail with
    /// [`DirectoryError::NotRunning`].
    pub fn stop(&self) {
        tracing::info!(silo = %self.local_silo, "Directory: stopping");
        self.shutdown.cancel();
    }
}
