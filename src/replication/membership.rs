//! Cluster Membership (SWIM-like)
//!
//! Peer discovery and failure detection over UDP. Every member advertises
//! its zone and QUIC transport address so the replication core can pick
//! zone-local peers and dial them.
//!
//! Uses Sans-IO pattern: message processing is separated from I/O for testability.

use crate::replication::config::ReplicationConfig;
use crate::replication::types::{NodeId, Peer};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Notify};

/// A member silent for longer than this is declared dead.
pub const FAILURE_TIMEOUT: Duration = Duration::from_secs(30);

const FAILURE_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("membership io: {0}")]
    Io(#[from] std::io::Error),
    #[error("membership service is not started")]
    NotStarted,
}

/// State of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Alive,
    Dead,
}

/// What a member says about itself on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub node_id: String,
    pub zone: String,
    pub gossip_addr: SocketAddr,
    pub transport_addr: SocketAddr,
    pub incarnation: u64,
}

/// A remote member as tracked locally.
#[derive(Debug, Clone)]
pub struct Member {
    pub node_id: NodeId,
    pub zone: String,
    pub gossip_addr: SocketAddr,
    pub transport_addr: SocketAddr,
    pub state: MemberState,
    /// When the member was last heard from directly
    pub last_seen: Instant,
    pub incarnation: u64,
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
            && self.zone == other.zone
            && self.gossip_addr == other.gossip_addr
            && self.transport_addr == other.transport_addr
            && self.state == other.state
            && self.incarnation == other.incarnation
    }
}

impl Member {
    fn from_info(info: &MemberInfo) -> Self {
        Self {
            node_id: NodeId::new(&info.node_id),
            zone: info.zone.clone(),
            gossip_addr: info.gossip_addr,
            transport_addr: info.transport_addr,
            state: MemberState::Alive,
            last_seen: Instant::now(),
            incarnation: info.incarnation,
        }
    }

    fn info(&self) -> MemberInfo {
        MemberInfo {
            node_id: self.node_id.0.clone(),
            zone: self.zone.clone(),
            gossip_addr: self.gossip_addr,
            transport_addr: self.transport_addr,
            incarnation: self.incarnation,
        }
    }

    pub fn peer(&self) -> Peer {
        Peer::new(self.node_id.clone(), self.zone.clone())
    }
}

/// Membership protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum GossipMessage {
    /// Liveness probe
    Ping { sender: MemberInfo },
    /// Response to ping
    Ack { sender: MemberInfo },
    /// Announce joining the cluster
    Join { member: MemberInfo },
    /// Known members, sent in answer to a join
    MemberList { members: Vec<MemberInfo> },
}

/// Datagram body: a message scoped to one cluster name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    pub cluster: String,
    pub message: GossipMessage,
}

/// Events emitted by the membership service.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    /// A member was seen for the first time or came back from the dead
    MemberJoined(Member),
    /// A member was declared dead
    MemberLeft(NodeId),
}

/// Output action from message processing (Sans-IO pattern).
#[derive(Debug, Clone, PartialEq)]
pub enum GossipAction {
    Send { to: SocketAddr, message: GossipMessage },
    Emit(MembershipEvent),
}

/// Result of processing a membership message (Sans-IO pattern).
#[derive(Debug, Clone, Default)]
pub struct ProcessResult {
    pub actions: Vec<GossipAction>,
    pub member_discovered: bool,
}

impl ProcessResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn send(to: SocketAddr, message: GossipMessage) -> Self {
        Self {
            actions: vec![GossipAction::Send { to, message }],
            member_discovered: false,
        }
    }

    fn discovered(&mut self, member: Member) {
        self.member_discovered = true;
        self.actions.push(GossipAction::Emit(MembershipEvent::MemberJoined(member)));
    }
}

/// Replace an unspecified advertised IP with the IP the datagram came from.
fn reachable(addr: SocketAddr, src: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(src.ip(), addr.port())
    } else {
        addr
    }
}

/// Record a member heard from directly. Returns it and whether it is new
/// or was previously dead.
fn touch(
    members: &RwLock<HashMap<String, Member>>,
    info: &MemberInfo,
    src: SocketAddr,
) -> (Member, bool) {
    let mut member = Member::from_info(info);
    member.gossip_addr = reachable(info.gossip_addr, src);
    member.transport_addr = reachable(info.transport_addr, src);

    let mut guard = members.write();
    let revived = guard
        .get(&info.node_id)
        .map(|m| m.state == MemberState::Dead)
        .unwrap_or(true);
    guard.insert(info.node_id.clone(), member.clone());
    (member, revived)
}

/// Pure function to process a membership message (Sans-IO pattern).
/// Returns actions to be performed instead of doing I/O directly.
pub fn process_message(
    msg: &GossipMessage,
    src: SocketAddr,
    members: &RwLock<HashMap<String, Member>>,
    local: &MemberInfo,
) -> ProcessResult {
    match msg {
        GossipMessage::Ping { sender } => {
            if sender.node_id == local.node_id {
                return ProcessResult::empty();
            }
            let (member, revived) = touch(members, sender, src);
            let mut result = ProcessResult::send(src, GossipMessage::Ack { sender: local.clone() });
            if revived {
                result.discovered(member);
            }
            result
        }

        GossipMessage::Ack { sender } => {
            let mut result = ProcessResult::empty();
            if sender.node_id == local.node_id {
                return result;
            }
            let (member, revived) = touch(members, sender, src);
            if revived {
                result.discovered(member);
            }
            result
        }

        GossipMessage::Join { member: joiner } => {
            if joiner.node_id == local.node_id {
                return ProcessResult::empty();
            }
            let (member, revived) = touch(members, joiner, src);

            let mut list: Vec<MemberInfo> = members
                .read()
                .values()
                .filter(|m| m.state == MemberState::Alive)
                .map(Member::info)
                .collect();
            list.push(local.clone());

            let mut result = ProcessResult::send(src, GossipMessage::MemberList { members: list });
            if revived {
                result.discovered(member);
            }
            result
        }

        GossipMessage::MemberList { members: list } => {
            let mut result = ProcessResult::empty();
            for info in list {
                if info.node_id == local.node_id {
                    continue;
                }
                // Second-hand news only introduces members; liveness of
                // known members is refreshed by direct contact alone.
                let member = {
                    let mut guard = members.write();
                    if guard.contains_key(&info.node_id) {
                        continue;
                    }
                    let mut member = Member::from_info(info);
                    member.gossip_addr = reachable(info.gossip_addr, src);
                    member.transport_addr = reachable(info.transport_addr, src);
                    guard.insert(info.node_id.clone(), member.clone());
                    member
                };
                result.discovered(member);
            }
            result
        }
    }
}

/// Mark members silent for longer than `timeout` as dead (Sans-IO pattern).
pub fn check_member_failures(
    members: &RwLock<HashMap<String, Member>>,
    timeout: Duration,
) -> Vec<GossipAction> {
    let now = Instant::now();
    let mut guard = members.write();
    let actions = guard
        .values_mut()
        .filter(|m| m.state == MemberState::Alive && now.duration_since(m.last_seen) > timeout)
        .map(|m| {
            m.state = MemberState::Dead;
            GossipAction::Emit(MembershipEvent::MemberLeft(m.node_id.clone()))
        })
        .collect();
    actions
}

/// Every known member is probed each round. Dead members keep being
/// probed so they are revived as soon as they answer.
pub fn ping_targets(members: &RwLock<HashMap<String, Member>>) -> Vec<SocketAddr> {
    members.read().values().map(|m| m.gossip_addr).collect()
}

/// Membership service for the peer mesh.
pub struct MembershipService {
    cluster_name: String,
    gossip_addr: SocketAddr,
    gossip_interval: Duration,
    local: RwLock<MemberInfo>,
    members: Arc<RwLock<HashMap<String, Member>>>,
    events: broadcast::Sender<MembershipEvent>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    shutdown: Arc<RwLock<bool>>,
    stop: Notify,
}

impl MembershipService {
    pub fn new(config: &ReplicationConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            cluster_name: config.cluster_name.clone(),
            gossip_addr: config.gossip_addr,
            gossip_interval: config.gossip_interval,
            local: RwLock::new(MemberInfo {
                node_id: config.node_id.clone(),
                zone: config.zone.clone(),
                gossip_addr: config.gossip_addr,
                transport_addr: config.advertised_transport_addr(),
                incarnation: 0,
            }),
            members: Arc::new(RwLock::new(HashMap::new())),
            events,
            socket: RwLock::new(None),
            shutdown: Arc::new(RwLock::new(false)),
            stop: Notify::new(),
        }
    }

    pub fn local(&self) -> MemberInfo {
        self.local.read().clone()
    }

    /// Announce a transport address learned after binding.
    pub fn set_transport_addr(&self, addr: SocketAddr) {
        self.local.write().transport_addr = addr;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    pub fn members(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }

    pub fn alive_members(&self) -> Vec<Member> {
        self.members
            .read()
            .values()
            .filter(|m| m.state == MemberState::Alive)
            .cloned()
            .collect()
    }

    /// Alive members as replication peers, ordered by node id.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.alive_members().iter().map(Member::peer).collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    pub fn get_member(&self, node_id: &str) -> Option<Member> {
        self.members.read().get(node_id).cloned()
    }

    pub fn transport_addr_of(&self, node_id: &NodeId) -> Option<SocketAddr> {
        self.members
            .read()
            .get(node_id.as_str())
            .filter(|m| m.state == MemberState::Alive)
            .map(|m| m.transport_addr)
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.read()
    }

    pub fn shutdown(&self) {
        *self.shutdown.write() = true;
        self.stop.notify_waiters();
    }

    /// Bind the UDP socket and start the protocol loop. Returns the bound address.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, MembershipError> {
        let socket = Arc::new(UdpSocket::bind(self.gossip_addr).await?);
        let bound = socket.local_addr()?;
        self.local.write().gossip_addr = bound;
        *self.socket.write() = Some(socket.clone());
        tracing::info!("membership listening on {}", bound);

        let this = self.clone();
        tokio::spawn(async move { this.run(socket).await });
        Ok(bound)
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn run(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut gossip_timer = tokio::time::interval(self.gossip_interval);
        let mut failure_timer = tokio::time::interval(FAILURE_CHECK_INTERVAL);

        loop {
            if self.is_shutdown() {
                break;
            }

            tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, src)) => self.handle_datagram(&buf[..len], src, &socket).await,
                    Err(e) => tracing::error!("membership recv error: {}", e),
                },

                _ = gossip_timer.tick() => {
                    let ping = GossipMessage::Ping { sender: self.local() };
                    for target in ping_targets(&self.members) {
                        self.send(&socket, target, ping.clone()).await;
                    }
                }

                _ = failure_timer.tick() => {
                    let actions = check_member_failures(&self.members, FAILURE_TIMEOUT);
                    self.execute_actions(actions, &socket).await;
                }

                _ = self.stop.notified() => break,
            }
        }
        tracing::info!("membership service stopped");
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn handle_datagram(&self, data: &[u8], src: SocketAddr, socket: &UdpSocket) {
        let packet: Packet = match bincode::deserialize(data) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("undecodable membership datagram from {}: {}", src, e);
                return;
            }
        };
        if packet.cluster != self.cluster_name {
            tracing::debug!("ignoring datagram from {} for cluster {}", src, packet.cluster);
            return;
        }

        let result = process_message(&packet.message, src, &self.members, &self.local());
        if result.member_discovered {
            tracing::info!("member discovered via {}", src);
        }
        self.execute_actions(result.actions, socket).await;
    }

    /// Execute membership actions (Sans-IO pattern).
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn execute_actions(&self, actions: Vec<GossipAction>, socket: &UdpSocket) {
        for action in actions {
            match action {
                GossipAction::Send { to, message } => self.send(socket, to, message).await,
                GossipAction::Emit(event) => {
                    match &event {
                        MembershipEvent::MemberJoined(m) => {
                            tracing::info!("member {} joined from zone {}", m.node_id, m.zone)
                        }
                        MembershipEvent::MemberLeft(id) => tracing::warn!("member {} is dead", id),
                    }
                    // No subscribers is fine.
                    let _ = self.events.send(event);
                }
            }
        }
    }

    async fn send(&self, socket: &UdpSocket, to: SocketAddr, message: GossipMessage) {
        let packet = Packet {
            cluster: self.cluster_name.clone(),
            message,
        };
        match bincode::serialize(&packet) {
            Ok(data) => {
                if let Err(e) = socket.send_to(&data, to).await {
                    tracing::debug!("membership send to {} failed: {}", to, e);
                }
            }
            Err(e) => tracing::error!("failed to encode membership packet: {}", e),
        }
    }

    /// Contact seed addresses and wait until at least one member is known or
    /// `timeout` passes. Returns the number of alive members.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn join(&self, seeds: &[String], timeout: Duration) -> Result<usize, MembershipError> {
        let socket = self.socket.read().clone().ok_or(MembershipError::NotStarted)?;
        let join = GossipMessage::Join { member: self.local() };

        for seed in seeds {
            match tokio::net::lookup_host(seed.as_str()).await {
                Ok(addrs) => {
                    for addr in addrs {
                        self.send(&socket, addr, join.clone()).await;
                        tracing::info!("sent join to seed {}", addr);
                    }
                }
                Err(e) => tracing::warn!("cannot resolve seed {}: {}", seed, e),
            }
        }

        let deadline = Instant::now() + timeout;
        while self.alive_members().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(JOIN_POLL_INTERVAL).await;
        }
        Ok(self.alive_members().len())
    }
}
