//! Membership & Gossip Delegate.
//!
//! Wraps a `libp2p` swarm (`gossipsub` for broadcast flooding of `ADD`
//! envelopes, `mdns` + explicit dial for peer discovery, `identify` for
//! learning peer node names, and a `request_response` protocol for
//! anti-entropy push/pull of full LTS snapshots) behind a small
//! command/event API so callers never touch `libp2p` types directly.
//!
//! This crate does not call into `aion-store` or `aion-scheduler` itself,
//! since doing so would create a dependency cycle with `aion-manager`,
//! which drives both. Instead it takes a [`TaskSnapshotSource`] for
//! answering anti-entropy pulls, and emits [`GossipEvent`]s for its caller
//! (the task manager's event loop) to apply.

mod behaviour;
mod envelope;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aion_ring::NodeName;
use aion_task::Task;
use futures::StreamExt;
use libp2p::{gossipsub, identify, mdns, request_response, Multiaddr, PeerId};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use behaviour::{Behaviour, BehaviourEvent};
use envelope::{AntiEntropyRequest, AntiEntropyResponse, Envelope, EnvelopeKind};

const TASKS_TOPIC: &str = "aion/tasks/add";
const ANTI_ENTROPY_INTERVAL: Duration = Duration::from_secs(10);

/// Errors constructing or driving the gossip transport.
#[derive(Debug, Error)]
pub enum GossipError {
    /// The libp2p transport failed to build.
    #[error("failed to build gossip transport: {0}")]
    Transport(String),
    /// The node could not bind its listening address.
    #[error("failed to bind gossip port {0}: {1}")]
    Bind(u16, std::io::Error),
    /// A configured bootstrap peer address did not parse.
    #[error("invalid member address {0:?}: {1}")]
    InvalidMember(String, libp2p::multiaddr::Error),
}

/// Something that can answer "what is my current full task list", implemented
/// by `aion-manager` over its `aion-store::Store`.
pub trait TaskSnapshotSource: Send + Sync {
    /// The sender's entire LTS contents.
    fn snapshot(&self) -> Vec<Task>;
}

/// Configuration for joining the gossip overlay.
pub struct GossipConfig {
    /// This node's stable identity, used both as the libp2p identify
    /// agent string and as the ring membership name.
    pub node_name: NodeName,
    /// Local bind port (`local.gossip`). `0` picks an ephemeral port.
    pub bind_port: u16,
    /// Initial peer addresses to join (`members`). Empty means bootstrap as
    /// a lone node.
    pub bootstrap_members: Vec<String>,
}

/// Events the gossip layer delivers to its caller.
#[derive(Debug, Clone)]
pub enum GossipEvent {
    /// The membership view changed (join, leave, or startup); the full
    /// current view is given so the caller can rebuild the [`aion_ring::Ring`].
    MembershipChanged(Vec<NodeName>),
    /// An `ADD` envelope was received over the broadcast topic.
    /// `REMOVE`/`UPDATE` are logged and dropped inside this crate and never
    /// reach the caller.
    TaskAdded(Task),
    /// A peer responded to our anti-entropy pull with its full snapshot.
    /// The caller applies each code it doesn't already have.
    AntiEntropySnapshot(Vec<Task>),
}

enum Command {
    BroadcastAdd(Task),
    Leave,
}

/// A lightweight handle for issuing commands to the running gossip task.
#[derive(Clone)]
pub struct GossipHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl GossipHandle {
    /// Enqueue an `ADD` envelope for broadcast, the last step of a locally
    /// originated task add. Non-blocking: gossipsub's own publish queue
    /// absorbs backpressure.
    pub fn broadcast_add(&self, task: Task) {
        if self.cmd_tx.send(Command::BroadcastAdd(task)).is_err() {
            warn!("gossip task already shut down, dropping broadcast");
        }
    }

    /// Announce a graceful leave and stop the gossip task.
    pub fn leave(&self) {
        let _ = self.cmd_tx.send(Command::Leave);
    }
}

/// Start the gossip transport and return a handle plus the event stream.
pub async fn spawn(
    config: GossipConfig,
    snapshot_source: Arc<dyn TaskSnapshotSource>,
) -> Result<(GossipHandle, mpsc::UnboundedReceiver<GossipEvent>), GossipError> {
    let local_name = config.node_name.clone();

    let mut swarm = behaviour::build_swarm(&local_name)
        .map_err(|e| GossipError::Transport(e.to_string()))?;

    let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.bind_port)
        .parse()
        .expect("well-formed multiaddr");
    swarm
        .listen_on(listen_addr)
        .map_err(|e| GossipError::Bind(config.bind_port, std::io::Error::other(e.to_string())))?;

    let topic = gossipsub::IdentTopic::new(TASKS_TOPIC);
    swarm
        .behaviour_mut()
        .gossipsub
        .subscribe(&topic)
        .map_err(|e| GossipError::Transport(e.to_string()))?;

    for addr in &config.bootstrap_members {
        match addr.parse::<Multiaddr>() {
            Ok(multiaddr) => {
                if let Err(e) = swarm.dial(multiaddr.clone()) {
                    warn!(%addr, error = %e, "failed to dial bootstrap member");
                }
            }
            Err(e) => return Err(GossipError::InvalidMember(addr.clone(), e)),
        }
    }

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(run(swarm, topic, local_name, cmd_rx, event_tx, snapshot_source));

    Ok((GossipHandle { cmd_tx }, event_rx))
}

async fn run(
    mut swarm: libp2p::Swarm<Behaviour>,
    topic: gossipsub::IdentTopic,
    local_name: NodeName,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<GossipEvent>,
    snapshot_source: Arc<dyn TaskSnapshotSource>,
) {
    let mut members: HashMap<PeerId, NodeName> = HashMap::new();
    let mut anti_entropy = tokio::time::interval(ANTI_ENTROPY_INTERVAL);

    let emit_membership = |members: &HashMap<PeerId, NodeName>, event_tx: &mpsc::UnboundedSender<GossipEvent>| {
        let mut view: Vec<NodeName> = members.values().cloned().collect();
        view.push(local_name.clone());
        view.sort();
        view.dedup();
        let _ = event_tx.send(GossipEvent::MembershipChanged(view));
    };

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::BroadcastAdd(task)) => {
                    let envelope = Envelope { kind: EnvelopeKind::Add, task };
                    match serde_json::to_vec(&envelope) {
                        Ok(bytes) => {
                            if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic.clone(), bytes) {
                                warn!(error = %e, "gossipsub publish failed, will converge via anti-entropy");
                            }
                        }
                        Err(e) => error!(error = %e, "failed to encode broadcast envelope"),
                    }
                }
                Some(Command::Leave) | None => {
                    info!(node = %local_name, "leaving gossip overlay");
                    break;
                }
            },
            _ = anti_entropy.tick() => {
                if let Some(peer) = random_peer(&members) {
                    debug!(%peer, "sending anti-entropy pull");
                    swarm.behaviour_mut().anti_entropy.send_request(&peer, AntiEntropyRequest);
                }
            },
            event = swarm.select_next_some() => match event {
                libp2p::swarm::SwarmEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Discovered(found))) => {
                    for (peer_id, addr) in found {
                        debug!(%peer_id, %addr, "mdns discovered peer");
                        if let Err(e) = swarm.dial(addr) {
                            warn!(%peer_id, error = %e, "failed to dial mdns peer");
                        }
                    }
                }
                libp2p::swarm::SwarmEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Expired(expired))) => {
                    for (peer_id, _addr) in expired {
                        if members.remove(&peer_id).is_some() {
                            info!(%peer_id, "node expired from mdns, treating as leave");
                            emit_membership(&members, &event_tx);
                        }
                    }
                }
                libp2p::swarm::SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
                    let name = NodeName::new(info.agent_version);
                    info!(%peer_id, %name, "node has joined");
                    members.insert(peer_id, name);
                    emit_membership(&members, &event_tx);
                }
                libp2p::swarm::SwarmEvent::ConnectionClosed { peer_id, .. } => {
                    if members.remove(&peer_id).is_some() {
                        info!(%peer_id, "node has left");
                        emit_membership(&members, &event_tx);
                    }
                }
                libp2p::swarm::SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message { message, .. })) => {
                    match serde_json::from_slice::<Envelope>(&message.data) {
                        Ok(envelope) => match envelope.kind {
                            EnvelopeKind::Add => {
                                let _ = event_tx.send(GossipEvent::TaskAdded(envelope.task));
                            }
                            EnvelopeKind::Remove | EnvelopeKind::Update => {
                                warn!(kind = ?envelope.kind, "unsupported envelope type, dropping");
                            }
                        },
                        Err(e) => warn!(error = %e, "malformed broadcast payload, dropping"),
                    }
                }
                libp2p::swarm::SwarmEvent::Behaviour(BehaviourEvent::AntiEntropy(request_response::Event::Message { message, .. })) => match message {
                    request_response::Message::Request { request: AntiEntropyRequest, channel, .. } => {
                        let response = AntiEntropyResponse { tasks: snapshot_source.snapshot() };
                        if swarm.behaviour_mut().anti_entropy.send_response(channel, response).is_err() {
                            warn!("failed to send anti-entropy response, peer likely disconnected");
                        }
                    }
                    request_response::Message::Response { response, .. } => {
                        let _ = event_tx.send(GossipEvent::AntiEntropySnapshot(response.tasks));
                    }
                },
                libp2p::swarm::SwarmEvent::NewListenAddr { address, .. } => {
                    info!(%address, "gossip transport listening");
                }
                _ => {}
            },
        }
    }
}

fn random_peer(members: &HashMap<PeerId, NodeName>) -> Option<PeerId> {
    use rand::seq::IteratorRandom;
    members.keys().copied().choose(&mut rand::thread_rng())
}
