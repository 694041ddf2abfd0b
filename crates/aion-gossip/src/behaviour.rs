//! The libp2p `NetworkBehaviour` this crate drives, and swarm construction.

use std::time::Duration;

use aion_ring::NodeName;
use libp2p::{gossipsub, identify, identity, mdns, noise, request_response, tcp, yamux};
use libp2p::{StreamProtocol, Swarm, SwarmBuilder};

use crate::envelope::{AntiEntropyRequest, AntiEntropyResponse};

/// The combined set of protocols this node speaks: `gossipsub` for
/// broadcast flooding, `mdns` for LAN peer discovery, `identify` for
/// learning peer node names, and a small JSON `request_response` protocol
/// for anti-entropy snapshot exchange. The broadcast topic and the
/// anti-entropy exchange both carry UTF-8 JSON on the wire.
#[derive(libp2p::swarm::NetworkBehaviour)]
pub struct Behaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
    pub identify: identify::Behaviour,
    pub anti_entropy: request_response::json::Behaviour<AntiEntropyRequest, AntiEntropyResponse>,
}

/// Build and configure (but do not yet `listen_on`) a swarm for this node.
pub fn build_swarm(node_name: &NodeName) -> Result<Swarm<Behaviour>, Box<dyn std::error::Error>> {
    let local_key = identity::Keypair::generate_ed25519();

    let swarm = SwarmBuilder::with_existing_identity(local_key)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_behaviour(|key| {
            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(1))
                .validation_mode(gossipsub::ValidationMode::Strict)
                .build()
                .map_err(std::io::Error::other)?;
            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )
            .map_err(std::io::Error::other)?;

            let mdns = mdns::tokio::Behaviour::new(
                mdns::Config::default(),
                key.public().to_peer_id(),
            )?;

            let identify = identify::Behaviour::new(
                identify::Config::new("/aion/1.0.0".to_string(), key.public())
                    .with_agent_version(node_name.to_string()),
            );

            let anti_entropy = request_response::json::Behaviour::new(
                [(
                    StreamProtocol::new("/aion/anti-entropy/1"),
                    request_response::ProtocolSupport::Full,
                )],
                request_response::Config::default(),
            );

            Ok(Behaviour {
                gossipsub,
                mdns,
                identify,
                anti_entropy,
            })
        })?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}
