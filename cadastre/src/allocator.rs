//! The allocator actor.
//!
//! One tokio task owns the ring, the space, the container ownership map,
//! the nickname index and the pending-request queues; nothing else ever
//! touches them, so there are no locks. Clients talk to the task through an
//! [`AllocatorHandle`], which sends typed requests over a channel and
//! awaits a oneshot reply; the gossip transport injects inbound traffic the
//! same way. A five-second tick retries parked requests, re-proposes while
//! a ring election is outstanding, and reclaims the addresses of containers
//! that have stayed dead past their grace period.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use cadastre_core::{encode, Addr, Cidr, Count, PeerName, Range};
use cadastre_paxos::Participant;

use crate::config::Config;
use crate::gossip::{
    decode_unicast, frame, Gossip, GossipBlob, GossipError, UnicastMessage, TAG_RING_UPDATE,
    TAG_SPACE_REQUEST, TAG_SPACE_REQUEST_DENIED,
};
use crate::operations::{AllocateOp, CancelProbe, ClaimOp, ConsenseOp};
use crate::ring::{Ring, RingError};
use crate::space::Space;
use crate::store::{Store, StoreError};
use crate::{CONTAINER_DIED_TIMEOUT, TICK_INTERVAL};

/// Errors returned to allocator clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The operation was abandoned: container death, shutdown, or an
    /// allocate whose cancel probe fired.
    Cancelled { kind: &'static str, ident: String },
    /// Free or Delete for something the container does not hold.
    NoSuchAddress {
        ident: String,
        addr: Option<Addr>,
    },
    /// Claim of an address outside the universe.
    NotInRange { cidr: Cidr, universe: Range },
    /// Claim of an address whose owner is neither us nor any reachable
    /// peer.
    UnknownOwner { cidr: Cidr, owner: PeerName },
    /// Claim of an address we own but already gave to another container.
    AlreadyOwned { cidr: Cidr, by: Option<String> },
    /// Claim denied: the address belongs to a live peer that kept it.
    OwnedByPeer { cidr: Cidr, peer: PeerName },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::Cancelled { kind, ident } => {
                write!(f, "{kind} request for {ident} cancelled")
            }
            AllocError::NoSuchAddress {
                ident,
                addr: Some(addr),
            } => write!(f, "address {addr} not found for {ident}"),
            AllocError::NoSuchAddress { ident, addr: None } => {
                write!(f, "no addresses for {ident}")
            }
            AllocError::NotInRange { cidr, universe } => {
                write!(f, "address {cidr} is outside the universe {universe}")
            }
            AllocError::UnknownOwner { cidr, owner } => {
                write!(f, "address {cidr} belongs to unreachable peer {owner}")
            }
            AllocError::AlreadyOwned { cidr, by: Some(by) } => {
                write!(f, "address {cidr} is already owned by {by}")
            }
            AllocError::AlreadyOwned { cidr, by: None } => {
                write!(f, "address {cidr} is already in use")
            }
            AllocError::OwnedByPeer { cidr, peer } => {
                write!(f, "address {cidr} is owned by peer {peer}")
            }
        }
    }
}

impl std::error::Error for AllocError {}

enum Request {
    Allocate {
        ident: String,
        within: Cidr,
        cancel_probe: CancelProbe,
        reply: oneshot::Sender<Result<Addr, AllocError>>,
    },
    Claim {
        ident: String,
        cidr: Cidr,
        no_error_on_unknown: bool,
        reply: oneshot::Sender<Result<(), AllocError>>,
    },
    Lookup {
        ident: String,
        within: Range,
        reply: oneshot::Sender<Vec<Cidr>>,
    },
    Free {
        ident: String,
        addr: Addr,
        reply: oneshot::Sender<Result<(), AllocError>>,
    },
    Delete {
        ident: String,
        reply: oneshot::Sender<Result<(), AllocError>>,
    },
    Consense {
        reply: oneshot::Sender<Result<(), AllocError>>,
    },
    ContainerStarted {
        ident: String,
    },
    ContainerDied {
        ident: String,
    },
    ContainerDestroyed {
        ident: String,
    },
    AllContainerIds {
        idents: Vec<String>,
    },
    Unicast {
        sender: PeerName,
        payload: Bytes,
        reply: oneshot::Sender<Result<(), GossipError>>,
    },
    Broadcast {
        sender: PeerName,
        payload: Bytes,
        reply: oneshot::Sender<Result<Bytes, GossipError>>,
    },
    AnonymousGossip {
        payload: Bytes,
        reply: oneshot::Sender<Result<(), GossipError>>,
    },
    Encode {
        reply: oneshot::Sender<Bytes>,
    },
    AdminTakeover {
        target: String,
        reply: oneshot::Sender<Count>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Stop,
}

/// Cloneable client handle onto a running [`Allocator`].
#[derive(Clone)]
pub struct AllocatorHandle {
    tx: mpsc::Sender<Request>,
}

impl AllocatorHandle {
    async fn request<T>(
        &self,
        kind: &'static str,
        ident: &str,
        build: impl FnOnce(oneshot::Sender<Result<T, AllocError>>) -> Request,
    ) -> Result<T, AllocError> {
        let cancelled = || AllocError::Cancelled {
            kind,
            ident: ident.to_string(),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| cancelled())?;
        reply_rx.await.map_err(|_| cancelled())?
    }

    /// Get a fresh address for `ident` inside `within`, waiting for space
    /// to appear if the cluster has none to hand right now.
    /// `cancel_probe` is consulted before every retry.
    ///
    /// # Errors
    /// [`AllocError::Cancelled`] on cancellation or shutdown.
    pub async fn allocate(
        &self,
        ident: &str,
        within: Cidr,
        cancel_probe: impl Fn() -> bool + Send + 'static,
    ) -> Result<Addr, AllocError> {
        self.request("allocate", ident, |reply| Request::Allocate {
            ident: ident.to_string(),
            within,
            cancel_probe: Box::new(cancel_probe),
            reply,
        })
        .await
    }

    /// Claim a specific address we believe belongs to `ident`.
    ///
    /// # Errors
    /// See [`AllocError`]; with `no_error_on_unknown` a claim against a
    /// vanished owner succeeds instead of failing.
    pub async fn claim(
        &self,
        ident: &str,
        cidr: Cidr,
        no_error_on_unknown: bool,
    ) -> Result<(), AllocError> {
        self.request("claim", ident, |reply| Request::Claim {
            ident: ident.to_string(),
            cidr,
            no_error_on_unknown,
            reply,
        })
        .await
    }

    /// Addresses currently held by `ident` within `within`.
    ///
    /// # Errors
    /// [`AllocError::Cancelled`] if the allocator is gone.
    pub async fn lookup(&self, ident: &str, within: Range) -> Result<Vec<Cidr>, AllocError> {
        let cancelled = || AllocError::Cancelled {
            kind: "lookup",
            ident: ident.to_string(),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request::Lookup {
                ident: ident.to_string(),
                within,
                reply: reply_tx,
            })
            .await
            .map_err(|_| cancelled())?;
        reply_rx.await.map_err(|_| cancelled())
    }

    /// Release one address held by `ident`.
    ///
    /// # Errors
    /// [`AllocError::NoSuchAddress`] if `ident` does not hold `addr`.
    pub async fn free(&self, ident: &str, addr: Addr) -> Result<(), AllocError> {
        self.request("free", ident, |reply| Request::Free {
            ident: ident.to_string(),
            addr,
            reply,
        })
        .await
    }

    /// Release everything held by `ident`.
    ///
    /// # Errors
    /// [`AllocError::NoSuchAddress`] if `ident` holds nothing.
    pub async fn delete(&self, ident: &str) -> Result<(), AllocError> {
        self.request("delete", ident, |reply| Request::Delete {
            ident: ident.to_string(),
            reply,
        })
        .await
    }

    /// Wait until the ring exists.
    ///
    /// # Errors
    /// [`AllocError::Cancelled`] on shutdown.
    pub async fn consense(&self) -> Result<(), AllocError> {
        self.request("consense", "", |reply| Request::Consense { reply })
            .await
    }

    /// Container lifecycle: `ident` is running (again).
    pub async fn container_started(&self, ident: &str) {
        let _ = self
            .tx
            .send(Request::ContainerStarted {
                ident: ident.to_string(),
            })
            .await;
    }

    /// Container lifecycle: `ident` died; its addresses are reclaimed after
    /// a grace period unless it comes back.
    pub async fn container_died(&self, ident: &str) {
        let _ = self
            .tx
            .send(Request::ContainerDied {
                ident: ident.to_string(),
            })
            .await;
    }

    /// Container lifecycle: `ident` is gone for good.
    pub async fn container_destroyed(&self, ident: &str) {
        let _ = self
            .tx
            .send(Request::ContainerDestroyed {
                ident: ident.to_string(),
            })
            .await;
    }

    /// Authoritative snapshot of live containers; holdings of anything not
    /// listed are released.
    pub async fn all_container_ids(&self, idents: Vec<String>) {
        let _ = self.tx.send(Request::AllContainerIds { idents }).await;
    }

    /// Inbound unicast from the transport.
    ///
    /// # Errors
    /// [`GossipError`] for the transport to log; never fatal.
    pub async fn on_unicast(&self, sender: PeerName, payload: Bytes) -> Result<(), GossipError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Request::Unicast {
                sender,
                payload,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }

    /// Inbound broadcast from the transport; the returned blob is gossiped
    /// back towards the sender.
    ///
    /// # Errors
    /// [`GossipError`] for the transport to log; never fatal.
    pub async fn on_broadcast(
        &self,
        sender: PeerName,
        payload: Bytes,
    ) -> Result<Bytes, GossipError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Request::Broadcast {
                sender,
                payload,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Ok(Bytes::new());
        }
        reply_rx.await.unwrap_or(Ok(Bytes::new()))
    }

    /// Inbound gossip whose sender the transport cannot identify.
    ///
    /// # Errors
    /// [`GossipError`] for the transport to log; never fatal.
    pub async fn on_gossip(&self, payload: Bytes) -> Result<(), GossipError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Request::AnonymousGossip {
                payload,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }

    /// Our current gossip blob, for the transport's periodic gossip.
    pub async fn encode(&self) -> Bytes {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Request::Encode { reply: reply_tx }).await.is_err() {
            return Bytes::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Operator command: take over the ranges of `target` (a nickname or a
    /// peer name). Returns how many free addresses we gained.
    pub async fn admin_takeover_ranges(&self, target: &str) -> Count {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Request::AdminTakeover {
                target: target.to_string(),
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    /// Graceful shutdown: cancel pending work, hand our ranges to an heir,
    /// broadcast the result.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Request::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    /// Make the actor task exit. Test use only: later calls hang.
    pub async fn stop(&self) {
        let _ = self.tx.send(Request::Stop).await;
    }
}

/// The coordinator. Owns all IPAM state; see the module docs.
pub struct Allocator {
    me: PeerName,
    universe: Range,
    seed: Option<Vec<PeerName>>,
    ring: Ring,
    space: Space,
    owned: BTreeMap<String, Vec<Cidr>>,
    nicknames: BTreeMap<PeerName, String>,
    pending_allocates: Vec<AllocateOp>,
    pending_claims: Vec<ClaimOp>,
    pending_consenses: Vec<ConsenseOp>,
    dead: HashMap<String, Instant>,
    store: Store,
    gossip: Box<dyn Gossip>,
    paxos: Option<Participant>,
    awaiting_consensus: bool,
    shutting_down: bool,
    is_known_peer: Box<dyn Fn(PeerName) -> bool + Send>,
    quorum: Box<dyn Fn() -> u32 + Send>,
    request_rx: mpsc::Receiver<Request>,
}

impl Allocator {
    /// Build an allocator, restoring any persisted state (and seeding the
    /// ring if the operator supplied a seed on first start). The caller
    /// spawns [`Allocator::run`] on its runtime.
    ///
    /// # Panics
    /// Persistence failures are fatal.
    #[must_use]
    pub fn new(config: Config, gossip: impl Gossip) -> (Self, AllocatorHandle) {
        let participant = if config.is_observer {
            Participant::observer()
        } else {
            Participant::node(config.our_name, config.our_uid)
        };
        let (tx, request_rx) = mpsc::channel(64);
        let mut alloc = Self {
            me: config.our_name,
            universe: config.universe,
            seed: config.seed,
            ring: Ring::new(config.universe, config.our_name),
            space: Space::new(),
            owned: BTreeMap::new(),
            nicknames: BTreeMap::from([(config.our_name, config.our_nickname)]),
            pending_allocates: Vec::new(),
            pending_claims: Vec::new(),
            pending_consenses: Vec::new(),
            dead: HashMap::new(),
            store: config.store,
            gossip: Box::new(gossip),
            paxos: Some(participant),
            awaiting_consensus: false,
            shutting_down: false,
            is_known_peer: config.is_known_peer,
            quorum: config.quorum,
            request_rx,
        };
        alloc.load_persisted_data();
        (alloc, AllocatorHandle { tx })
    }

    /// The actor loop. Runs until [`AllocatorHandle::stop`] or until every
    /// handle is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                request = self.request_rx.recv() => match request {
                    None | Some(Request::Stop) => break,
                    Some(request) => self.handle_request(request).await,
                },
                _ = ticker.tick() => self.on_tick(),
            }
            self.assert_invariants();
            self.report_free_space();
        }
        info!(me = %self.me, "allocator stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Allocate {
                ident,
                within,
                cancel_probe,
                reply,
            } => {
                let op = AllocateOp {
                    ident,
                    within,
                    cancel_probe,
                    reply: Some(reply),
                };
                if self.shutting_down {
                    op.cancel();
                } else {
                    let mut op = op;
                    if !self.try_allocate(&mut op) {
                        self.pending_allocates.push(op);
                    }
                }
            }
            Request::Claim {
                ident,
                cidr,
                no_error_on_unknown,
                reply,
            } => {
                let op = ClaimOp {
                    ident,
                    cidr,
                    no_error_on_unknown,
                    reply: Some(reply),
                };
                if self.shutting_down {
                    op.cancel();
                } else {
                    let mut op = op;
                    if !self.try_claim(&mut op) {
                        self.pending_claims.push(op);
                    }
                }
            }
            Request::Lookup {
                ident,
                within,
                reply,
            } => {
                let _ = reply.send(self.owned_in_range(&ident, within));
            }
            Request::Free {
                ident,
                addr,
                reply,
            } => {
                let _ = reply.send(self.free(&ident, addr));
            }
            Request::Delete { ident, reply } => {
                let _ = reply.send(self.delete(&ident));
            }
            Request::Consense { reply } => {
                let op = ConsenseOp { reply: Some(reply) };
                if self.shutting_down {
                    op.cancel();
                } else {
                    let mut op = op;
                    if !self.try_consense(&mut op) {
                        self.pending_consenses.push(op);
                    }
                }
            }
            Request::ContainerStarted { ident } => {
                self.dead.remove(&ident);
            }
            Request::ContainerDied { ident } => {
                if self.owned.contains_key(&ident) {
                    debug!(%ident, "container died; reclaiming later");
                    self.dead.insert(ident.clone(), Instant::now());
                }
                self.cancel_ops_for(&ident);
            }
            Request::ContainerDestroyed { ident } => {
                if self.owned.contains_key(&ident) {
                    debug!(%ident, "container destroyed; releasing addresses");
                    let _ = self.delete(&ident);
                    self.dead.remove(&ident);
                }
            }
            Request::AllContainerIds { idents } => {
                self.sync_owned(&idents);
            }
            Request::Unicast {
                sender,
                payload,
                reply,
            } => {
                let _ = reply.send(self.on_unicast(sender, &payload));
            }
            Request::Broadcast {
                sender,
                payload,
                reply,
            } => {
                let result = self
                    .decode_and_update(Some(sender), &payload)
                    .map(|()| self.encode_blob());
                let _ = reply.send(result);
            }
            Request::AnonymousGossip { payload, reply } => {
                let _ = reply.send(self.decode_and_update(None, &payload));
            }
            Request::Encode { reply } => {
                let _ = reply.send(self.encode_blob());
            }
            Request::AdminTakeover { target, reply } => {
                let _ = reply.send(self.admin_takeover_ranges(&target));
            }
            Request::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
            Request::Stop => unreachable!("handled in run"),
        }
    }

    fn on_tick(&mut self) {
        if self.awaiting_consensus {
            self.propose();
        }
        self.remove_dead_containers();
        self.try_pending_ops();
    }

    // ----- pending operations ------------------------------------------

    fn try_pending_ops(&mut self) {
        // Consenses unblock first, then existing claims get their addresses
        // back before new allocations eat into the space.
        let mut consenses = std::mem::take(&mut self.pending_consenses);
        consenses.retain_mut(|op| !self.try_consense(op));
        consenses.append(&mut self.pending_consenses);
        self.pending_consenses = consenses;

        let mut claims = std::mem::take(&mut self.pending_claims);
        let mut kept = Vec::new();
        for mut op in claims.drain(..) {
            if !self.try_claim(&mut op) {
                kept.push(op);
            }
        }
        kept.append(&mut self.pending_claims);
        self.pending_claims = kept;

        let mut allocates = std::mem::take(&mut self.pending_allocates);
        let mut kept = Vec::new();
        for mut op in allocates.drain(..) {
            if !self.try_allocate(&mut op) {
                kept.push(op);
            }
        }
        kept.append(&mut self.pending_allocates);
        self.pending_allocates = kept;
    }

    fn cancel_all_pending(&mut self) {
        for op in std::mem::take(&mut self.pending_claims) {
            op.cancel();
        }
        for op in std::mem::take(&mut self.pending_allocates) {
            op.cancel();
        }
        for op in std::mem::take(&mut self.pending_consenses) {
            op.cancel();
        }
    }

    fn cancel_ops_for(&mut self, ident: &str) {
        let mut kept = Vec::new();
        for op in std::mem::take(&mut self.pending_allocates) {
            if op.ident == ident {
                op.cancel();
            } else {
                kept.push(op);
            }
        }
        self.pending_allocates = kept;

        let mut kept = Vec::new();
        for op in std::mem::take(&mut self.pending_claims) {
            if op.ident == ident {
                op.cancel();
            } else {
                kept.push(op);
            }
        }
        self.pending_claims = kept;
    }

    /// One allocate attempt. True if the operation finished (either way).
    fn try_allocate(&mut self, op: &mut AllocateOp) -> bool {
        if (op.cancel_probe)() {
            let ident = op.ident.clone();
            op.complete(Err(AllocError::Cancelled {
                kind: "allocate",
                ident,
            }));
            return true;
        }
        if self.ring.is_empty() {
            self.establish_ring();
        }
        if let Some(addr) = self.space.allocate_in(op.within.host_range()) {
            debug!(ident = %op.ident, %addr, "allocated");
            self.add_owned(&op.ident, Cidr::host(addr));
            op.complete(Ok(addr));
            return true;
        }
        if self.ring.is_empty() {
            return false;
        }
        if let Some(donor) = self.ring.choose_peer_to_ask_for_space(op.within.range()) {
            debug!(ident = %op.ident, %donor, "asking for space");
            self.send_space_request(donor, op.within.range());
        }
        false
    }

    /// One claim attempt. True if the operation finished (either way).
    fn try_claim(&mut self, op: &mut ClaimOp) -> bool {
        let addr = op.cidr.addr;
        if !self.universe.contains(addr) {
            let err = AllocError::NotInRange {
                cidr: op.cidr,
                universe: self.universe,
            };
            op.complete(Err(err));
            return true;
        }
        if self.ring.is_empty() {
            self.establish_ring();
            if self.ring.is_empty() {
                return false;
            }
        }
        let owner = self
            .ring
            .owner(addr)
            .expect("a non-empty ring covers its universe");
        if owner == self.me {
            return match self.space.claim(addr) {
                Ok(()) => {
                    debug!(ident = %op.ident, cidr = %op.cidr, "claimed");
                    self.add_owned(&op.ident, op.cidr);
                    op.complete(Ok(()));
                    true
                }
                Err(crate::space::SpaceError::AlreadyTaken) => {
                    let result = match self.find_owner(addr) {
                        Some(holder) if holder == op.ident => Ok(()),
                        holder => Err(AllocError::AlreadyOwned {
                            cidr: op.cidr,
                            by: holder.map(ToString::to_string),
                        }),
                    };
                    op.complete(result);
                    true
                }
                // The ring and space disagree transiently; retry later.
                Err(crate::space::SpaceError::NotOurs) => false,
            };
        }
        if (self.is_known_peer)(owner) {
            // The owner either grants the range (we see it in their next
            // ring update) or denies, which fails this claim.
            self.send_space_request(owner, op.cidr.range());
            return false;
        }
        let result = if op.no_error_on_unknown {
            // The owner is gone; the address is abandoned-but-reclaimable
            // once the ring hears of it.
            Ok(())
        } else {
            Err(AllocError::UnknownOwner {
                cidr: op.cidr,
                owner,
            })
        };
        op.complete(result);
        true
    }

    fn try_consense(&mut self, op: &mut ConsenseOp) -> bool {
        if !self.ring.is_empty() {
            op.complete();
            return true;
        }
        self.establish_ring();
        if !self.ring.is_empty() {
            op.complete();
            return true;
        }
        false
    }

    /// A peer denied our space request: finish the claims it blocks.
    fn space_request_denied(&mut self, sender: PeerName, denied: Range) {
        let mut kept = Vec::new();
        for mut claim in std::mem::take(&mut self.pending_claims) {
            if !denied.contains(claim.cidr.addr) {
                kept.push(claim);
                continue;
            }
            if self.ring.owner(claim.cidr.addr) == Some(sender) {
                let err = AllocError::OwnedByPeer {
                    cidr: claim.cidr,
                    peer: sender,
                };
                claim.complete(Err(err));
            } else if !self.try_claim(&mut claim) {
                // Ownership moved since the denial; consult the ring again.
                kept.push(claim);
            }
        }
        kept.append(&mut self.pending_claims);
        self.pending_claims = kept;
    }

    // ----- ring lifecycle ----------------------------------------------

    /// Make progress towards having a ring at all.
    fn establish_ring(&mut self) {
        if !self.ring.is_empty() || self.awaiting_consensus {
            return;
        }
        self.awaiting_consensus = true;
        let quorum = (self.quorum)();
        if let Some(paxos) = &mut self.paxos {
            paxos.set_quorum(quorum);
        }
        self.propose();
        // A quorum of one reaches consensus on the spot.
        if let Some(value) = self.paxos.as_ref().and_then(Participant::consensus) {
            self.create_ring(&value);
        }
    }

    fn propose(&mut self) {
        debug!("proposing ring seed");
        if let Some(paxos) = &mut self.paxos {
            paxos.propose();
        }
        self.broadcast_state();
    }

    fn create_ring(&mut self, peers: &[PeerName]) {
        info!(peers = %self.annotate_peers(peers), "creating ring");
        self.ring.claim_for_peers(peers);
        self.broadcast_state();
        self.ring_updated();
    }

    fn ring_updated(&mut self) {
        // With a ring in hand the election is history.
        if self.awaiting_consensus {
            self.awaiting_consensus = false;
            self.paxos = None;
        }
        self.persist_ring();
        self.space.update_ranges(&self.ring.owned_ranges());
        self.try_pending_ops();
    }

    // ----- gossip ------------------------------------------------------

    fn on_unicast(&mut self, sender: PeerName, payload: &[u8]) -> Result<(), GossipError> {
        debug!(%sender, bytes = payload.len(), "unicast");
        match decode_unicast(payload)? {
            UnicastMessage::SpaceRequest(range) => {
                self.donate_space(range, sender);
                Ok(())
            }
            UnicastMessage::SpaceRequestDenied(range) => {
                self.space_request_denied(sender, range);
                Ok(())
            }
            UnicastMessage::RingUpdate(blob) => self.update(Some(sender), *blob),
        }
    }

    fn decode_and_update(
        &mut self,
        sender: Option<PeerName>,
        payload: &[u8],
    ) -> Result<(), GossipError> {
        let blob: GossipBlob = cadastre_core::decode(payload)?;
        self.update(sender, blob)
    }

    fn update(&mut self, sender: Option<PeerName>, blob: GossipBlob) -> Result<(), GossipError> {
        for (peer, nickname) in blob.nicknames {
            self.nicknames.insert(peer, nickname);
        }

        if let Some(remote) = blob.ring {
            // A ring outranks anything else in the blob; merging may also
            // take us out of the awaiting-consensus state.
            match self.ring.merge(&remote) {
                Ok(()) => {
                    if !self.ring.is_empty() {
                        self.prune_nicknames();
                        self.ring_updated();
                    }
                    Ok(())
                }
                Err(source @ RingError::DifferentSeeds) => {
                    let detail = format!(
                        "ring was seeded by different peers (theirs: {}, ours: {})",
                        self.annotate_peers(remote.seeds()),
                        self.annotate_peers(self.ring.seeds()),
                    );
                    Err(GossipError::Incompatible { source, detail })
                }
                Err(source @ RingError::DifferentRange) => {
                    let detail = format!(
                        "incompatible address ranges (theirs: {}, ours: {})",
                        remote.range(),
                        self.ring.range(),
                    );
                    Err(GossipError::Incompatible { source, detail })
                }
                Err(source) => {
                    let detail = format!("ring update rejected: {source}");
                    Err(GossipError::Incompatible { source, detail })
                }
            }
        } else if !self.ring.is_empty() {
            // The sender is electing or ring-less; either way our ring is
            // the answer.
            if let Some(sender) = sender {
                self.send_ring_update(sender);
            }
            Ok(())
        } else if let Some(remote_paxos) = blob.paxos {
            // Observing an election pulls us into it, with a real quorum,
            // before we judge consensus.
            self.establish_ring();
            if let Some(paxos) = &mut self.paxos {
                if paxos.update(&remote_paxos) {
                    if paxos.think() {
                        self.broadcast_state();
                    }
                    if let Some(value) = self.paxos.as_ref().and_then(Participant::consensus) {
                        self.create_ring(&value);
                    }
                }
            }
            Ok(())
        } else {
            // A ring-less, non-electing sender wants a ring to exist. Only
            // electors respond, and only to identified senders, to avoid
            // request storms.
            if sender.is_some() && self.paxos.as_ref().is_some_and(Participant::is_node) {
                self.establish_ring();
            }
            Ok(())
        }
    }

    /// A peer asked us for space. Whatever happens they get a ring update,
    /// so they learn our latest hints either way.
    fn donate_space(&mut self, wanted: Range, to: PeerName) {
        debug!(%to, %wanted, "peer asked for space");
        if let Some(chunk) = self.space.donate(wanted) {
            self.ring.grant_range(chunk.start, chunk.end, to);
            self.persist_ring();
            debug!(%chunk, %to, "gave range away");
        } else {
            let free = self.space.num_free(wanted);
            if free > 0 {
                debug!(%to, free, "only fragments below the minimum subnet size; denying");
            } else {
                debug!(%to, "no space to give");
            }
            self.send_space_request_denied(to, wanted);
        }
        self.send_ring_update(to);
    }

    fn encode_blob(&self) -> Bytes {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let blob = GossipBlob {
            now,
            nicknames: self.nicknames.clone(),
            // Paxos matters only until a ring exists; observers advertise
            // nothing so electing peers answer with a ring instead.
            paxos: if self.ring.is_empty() {
                self.paxos.as_ref().and_then(Participant::gossip_state)
            } else {
                None
            },
            ring: (!self.ring.is_empty()).then(|| self.ring.clone()),
        };
        Bytes::from(encode(&blob).expect("gossip blob serialization should not fail"))
    }

    fn broadcast_state(&mut self) {
        let blob = self.encode_blob();
        self.gossip.broadcast(blob);
    }

    fn send_ring_update(&mut self, dst: PeerName) {
        let blob = self.encode_blob();
        self.gossip.unicast(dst, frame(TAG_RING_UPDATE, &blob));
    }

    fn send_space_request(&mut self, dst: PeerName, range: Range) {
        let payload = encode(&range).expect("range serialization should not fail");
        self.gossip.unicast(dst, frame(TAG_SPACE_REQUEST, &payload));
    }

    fn send_space_request_denied(&mut self, dst: PeerName, range: Range) {
        let payload = encode(&range).expect("range serialization should not fail");
        self.gossip
            .unicast(dst, frame(TAG_SPACE_REQUEST_DENIED, &payload));
    }

    // ----- shutdown & takeover -----------------------------------------

    /// Heir preference: live peers with ring entries, live peers known only
    /// by nickname, departed peers with entries, then anyone we ever knew.
    fn pick_peer_for_transfer(&self) -> Option<PeerName> {
        self.ring
            .pick_peer_for_transfer(|p| (self.is_known_peer)(p))
            .or_else(|| self.pick_peer_from_nicknames(|p| (self.is_known_peer)(p)))
            .or_else(|| self.ring.pick_peer_for_transfer(|_| true))
            .or_else(|| self.pick_peer_from_nicknames(|_| true))
    }

    fn pick_peer_from_nicknames(&self, is_valid: impl Fn(PeerName) -> bool) -> Option<PeerName> {
        self.nicknames
            .keys()
            .copied()
            .find(|p| *p != self.me && is_valid(*p))
    }

    async fn shutdown(&mut self) {
        info!("shutting down");
        self.shutting_down = true;
        self.cancel_all_pending();
        if let Some(heir) = self.pick_peer_for_transfer() {
            info!(%heir, "handing over our ranges");
            self.ring.transfer(self.me, heir);
            self.space.clear();
            self.persist_ring();
            self.broadcast_state();
            // The transport exposes no flush acknowledgement; give the
            // broadcast a moment to leave.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn admin_takeover_ranges(&mut self, target: &str) -> Count {
        let Some(peer) = self.lookup_peer_name(target) else {
            warn!(target, "takeover from unknown peer");
            return 0;
        };
        if peer == self.me {
            warn!("attempt to take over our own ranges");
            return 0;
        }
        debug!(%peer, "administrative takeover");
        let ranges = self.ring.transfer(peer, self.me);
        if ranges.is_empty() {
            return 0;
        }
        let before = self.space.num_free_total();
        self.space.add_ranges(&ranges);
        let after = self.space.num_free_total();
        self.persist_ring();
        self.broadcast_state();
        self.try_pending_ops();
        after - before
    }

    /// Resolve a nickname or textual peer name. Our own nicknames map is
    /// consulted first because it remembers peers the mesh has forgotten.
    fn lookup_peer_name(&self, target: &str) -> Option<PeerName> {
        self.nicknames
            .iter()
            .find(|(_, nickname)| nickname.as_str() == target)
            .map(|(peer, _)| *peer)
            .or_else(|| target.parse().ok())
    }

    /// Drop nicknames of peers that neither the ring nor the transport
    /// still vouches for.
    fn prune_nicknames(&mut self) {
        let ring_peers = self.ring.peer_names();
        self.nicknames
            .retain(|peer, _| ring_peers.contains(peer) || (self.is_known_peer)(*peer));
    }

    fn annotate_peers<'a>(&self, peers: impl IntoIterator<Item = &'a PeerName>) -> String {
        let annotated: Vec<String> = peers
            .into_iter()
            .map(|p| match self.nicknames.get(p) {
                Some(nickname) => format!("{p}({nickname})"),
                None => p.to_string(),
            })
            .collect();
        annotated.join(", ")
    }

    // ----- container bookkeeping ---------------------------------------

    fn remove_dead_containers(&mut self) {
        let Some(cutoff) = Instant::now().checked_sub(CONTAINER_DIED_TIMEOUT) else {
            return;
        };
        let expired: Vec<String> = self
            .dead
            .iter()
            .filter(|(_, died)| **died <= cutoff)
            .map(|(ident, _)| ident.clone())
            .collect();
        for ident in expired {
            if self.delete(&ident).is_ok() {
                debug!(%ident, "removed addresses of dead container");
            }
            self.dead.remove(&ident);
        }
    }

    fn delete(&mut self, ident: &str) -> Result<(), AllocError> {
        let Some(cidrs) = self.owned.remove(ident) else {
            return Err(AllocError::NoSuchAddress {
                ident: ident.to_string(),
                addr: None,
            });
        };
        self.persist_owned();
        for cidr in cidrs {
            self.space.free(cidr.addr);
        }
        Ok(())
    }

    fn free(&mut self, ident: &str, addr: Addr) -> Result<(), AllocError> {
        if self.remove_owned(ident, addr) {
            debug!(ident, %addr, "freed");
            self.space.free(addr);
            return Ok(());
        }
        Err(AllocError::NoSuchAddress {
            ident: ident.to_string(),
            addr: Some(addr),
        })
    }

    fn add_owned(&mut self, ident: &str, cidr: Cidr) {
        let cidrs = self.owned.entry(ident.to_string()).or_default();
        if !cidrs.contains(&cidr) {
            cidrs.push(cidr);
        }
        self.persist_owned();
    }

    fn remove_owned(&mut self, ident: &str, addr: Addr) -> bool {
        let Some(cidrs) = self.owned.get_mut(ident) else {
            return false;
        };
        let Some(idx) = cidrs.iter().position(|c| c.addr == addr) else {
            return false;
        };
        cidrs.remove(idx);
        if cidrs.is_empty() {
            self.owned.remove(ident);
        }
        self.persist_owned();
        true
    }

    fn owned_in_range(&self, ident: &str, within: Range) -> Vec<Cidr> {
        self.owned
            .get(ident)
            .into_iter()
            .flatten()
            .filter(|cidr| within.contains(cidr.addr))
            .copied()
            .collect()
    }

    fn find_owner(&self, addr: Addr) -> Option<&str> {
        self.owned
            .iter()
            .find(|(_, cidrs)| cidrs.iter().any(|c| c.addr == addr))
            .map(|(ident, _)| ident.as_str())
    }

    /// Release holdings of any container not in the authoritative set.
    fn sync_owned(&mut self, live: &[String]) {
        let stale: Vec<String> = self
            .owned
            .keys()
            .filter(|ident| !live.contains(ident))
            .cloned()
            .collect();
        if stale.is_empty() {
            return;
        }
        for ident in stale {
            for cidr in self.owned.remove(&ident).unwrap_or_default() {
                self.space.free(cidr.addr);
            }
        }
        self.persist_owned();
    }

    // ----- persistence -------------------------------------------------

    fn fatal(&self, err: &StoreError) -> ! {
        error!(me = %self.me, %err, "persistence failure is fatal");
        panic!("persistence failure: {err}");
    }

    fn persist_ring(&self) {
        if let Err(err) = self.store.save_identity(self.me, &self.ring) {
            self.fatal(&err);
        }
    }

    fn persist_owned(&self) {
        if let Err(err) = self.store.save_owned(&self.owned) {
            self.fatal(&err);
        }
    }

    fn load_persisted_data(&mut self) {
        let stored_name = match self.store.load_peer_name() {
            Ok(name) => name,
            Err(err) => self.fatal(&err),
        };

        if let Some(name) = stored_name {
            if name == self.me {
                match self.store.load_ring() {
                    Ok(Some(ring)) => {
                        if self.seed.is_some() {
                            info!("found persisted data; ignoring the supplied seed");
                        }
                        self.ring = ring;
                        self.space.update_ranges(&self.ring.owned_ranges());
                    }
                    Ok(None) => {}
                    Err(err) => self.fatal(&err),
                }
                match self.store.load_owned() {
                    Ok(Some(owned)) => {
                        self.owned = owned;
                        for cidrs in self.owned.values() {
                            for cidr in cidrs {
                                let _ = self.space.claim(cidr.addr);
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(err) => self.fatal(&err),
                }
                return;
            }
            info!(previous = %name, "replacing persisted data of a previous identity");
            self.persist_ring();
            self.persist_owned();
        }

        if let Some(seed) = self.seed.clone() {
            info!("initialising with the supplied seed");
            self.create_ring(&seed);
        } else {
            info!("initialising via deferred consensus");
        }
    }

    // ----- invariants & reporting --------------------------------------

    /// Every range the ring says is ours has a space record, and vice
    /// versa. Divergence is a programming error.
    fn assert_invariants(&self) {
        let ring_view = self.ring.owned_ranges();
        let space_view = self.space.owned_ranges();
        assert!(
            ring_view == space_view,
            "ring and space disagree about our ranges: ring {ring_view:?}, space {space_view:?}"
        );
    }

    /// Refresh our free-count hints; they ride along on the next outbound
    /// gossip and steer donor selection cluster-wide.
    fn report_free_space(&mut self) {
        if self.ring.is_empty() {
            return;
        }
        let mut counts = BTreeMap::new();
        for span in self.ring.owned_spans() {
            counts.insert(span.start, self.space.num_free(span));
        }
        self.ring.report_free(&counts);
    }
}
