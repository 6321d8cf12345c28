//! Provider transport: a libp2p swarm (TCP + noise + yamux, DNS resolution) driven by a background
//! task. Protocol support comes from the provider's identify record; protocol streams are opened
//! through `libp2p-stream` and handed to the core as tokio I/O.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use dealprobe_core::api::{AddrInfo, ProviderHost};
use futures::StreamExt;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{DialError, NetworkBehaviour, SwarmEvent};
use libp2p::{identify, noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder};
use libp2p_stream::OpenStreamError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};
use tracing::{debug, trace, warn};

/// Identify protocol version spoken by Filecoin nodes.
pub const IDENTIFY_PROTOCOL: &str = "/ipfs/0.1.0";

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(NetworkBehaviour)]
pub struct HostBehaviour {
    identify: identify::Behaviour,
    stream: libp2p_stream::Behaviour,
}

/// Swarm with a fresh ed25519 identity.
pub fn build_swarm() -> anyhow::Result<Swarm<HostBehaviour>> {
    let swarm = SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .context("TCP transport")?
        .with_dns()
        .context("DNS transport")?
        .with_behaviour(|key| HostBehaviour {
            identify: identify::Behaviour::new(
                identify::Config::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                    .with_agent_version(format!("dealprobe/{}", env!("CARGO_PKG_VERSION"))),
            ),
            stream: libp2p_stream::Behaviour::new(),
        })
        .context("swarm behaviour")?
        .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();
    Ok(swarm)
}

enum Command {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Protocols {
        peer: PeerId,
        reply: oneshot::Sender<Vec<StreamProtocol>>,
    },
}

/// State owned by the swarm task.
#[derive(Default)]
struct Pending {
    dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), String>>>>,
    protocols: HashMap<PeerId, Vec<oneshot::Sender<Vec<StreamProtocol>>>>,
    identified: HashMap<PeerId, Vec<StreamProtocol>>,
}

impl Pending {
    fn dialed(&mut self, peer: &PeerId, result: Result<(), String>) {
        for reply in self.dials.remove(peer).unwrap_or_default() {
            let _ = reply.send(result.clone());
        }
    }

    fn identified(&mut self, peer: PeerId, protocols: Vec<StreamProtocol>) {
        for reply in self.protocols.remove(&peer).unwrap_or_default() {
            let _ = reply.send(protocols.clone());
        }
        self.identified.insert(peer, protocols);
    }
}

fn handle_command(swarm: &mut Swarm<HostBehaviour>, pending: &mut Pending, cmd: Command) {
    match cmd {
        Command::Dial { peer, addrs, reply } => {
            if swarm.is_connected(&peer) {
                let _ = reply.send(Ok(()));
                return;
            }
            match swarm.dial(DialOpts::peer_id(peer).addresses(addrs).build()) {
                // A dial to this peer is already in flight; wait for its outcome.
                Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {
                    pending.dials.entry(peer).or_default().push(reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e.to_string()));
                }
            }
        }
        Command::Protocols { peer, reply } => match pending.identified.get(&peer) {
            Some(protocols) => {
                let _ = reply.send(protocols.clone());
            }
            None => pending.protocols.entry(peer).or_default().push(reply),
        },
    }
}

fn handle_event(pending: &mut Pending, event: SwarmEvent<HostBehaviourEvent>) {
    match event {
        SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
            debug!(peer = %peer_id, addr = %endpoint.get_remote_address(), "connected");
            pending.dialed(&peer_id, Ok(()));
        }
        SwarmEvent::OutgoingConnectionError {
            peer_id: Some(peer_id),
            error,
            ..
        } => {
            debug!(peer = %peer_id, %error, "dial failed");
            pending.dialed(&peer_id, Err(error.to_string()));
        }
        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established: 0,
            cause,
            ..
        } => {
            trace!(peer = %peer_id, ?cause, "disconnected");
            pending.identified.remove(&peer_id);
        }
        SwarmEvent::Behaviour(HostBehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            debug!(
                peer = %peer_id,
                agent = %info.agent_version,
                protocols = info.protocols.len(),
                "identified peer"
            );
            pending.identified(peer_id, info.protocols);
        }
        SwarmEvent::Behaviour(HostBehaviourEvent::Identify(identify::Event::Error {
            peer_id,
            error,
            ..
        })) => {
            warn!(peer = %peer_id, %error, "identify failed");
        }
        _ => {}
    }
}

/// Drives the swarm until every [`Libp2pHost`] handle is dropped.
async fn run_swarm(mut swarm: Swarm<HostBehaviour>, mut commands: mpsc::Receiver<Command>) {
    let mut pending = Pending::default();
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(cmd) => handle_command(&mut swarm, &mut pending, cmd),
                None => break,
            },
            event = swarm.select_next_some() => handle_event(&mut pending, event),
        }
    }
    debug!("swarm task stopped");
}

/// Provider host on libp2p. Connections are reused across streams and closed when idle.
pub struct Libp2pHost {
    commands: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
    local_peer_id: PeerId,
    timeout: Duration,
}

impl Libp2pHost {
    /// Spawns the swarm task on the current tokio runtime.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let swarm = build_swarm()?;
        let control = swarm.behaviour().stream.new_control();
        let local_peer_id = *swarm.local_peer_id();
        let (commands, rx) = mpsc::channel(32);
        tokio::spawn(run_swarm(swarm, rx));
        debug!(%local_peer_id, "libp2p host started");
        Ok(Libp2pHost {
            commands,
            control,
            local_peer_id,
            timeout,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn request<T>(
        &self,
        what: &str,
        cmd: Command,
        rx: oneshot::Receiver<T>,
    ) -> anyhow::Result<T> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| anyhow!("swarm task stopped"))?;
        tokio::time::timeout(self.timeout, rx)
            .await
            .map_err(|_| anyhow!("{what} timed out after {:?}", self.timeout))?
            .map_err(|_| anyhow!("swarm task stopped"))
    }
}

#[async_trait]
impl ProviderHost for Libp2pHost {
    type Stream = Compat<libp2p::swarm::Stream>;

    async fn connect(&self, peer: &AddrInfo) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Dial {
            peer: peer.peer_id,
            addrs: peer.addrs.clone(),
            reply,
        };
        self.request("dial", cmd, rx)
            .await?
            .map_err(|e| anyhow!("failed to dial peer {}: {e}", peer.peer_id))
    }

    async fn supported_protocols(
        &self,
        peer: &AddrInfo,
        candidates: &[String],
    ) -> anyhow::Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Protocols {
            peer: peer.peer_id,
            reply,
        };
        let advertised = self.request("identify", cmd, rx).await?;
        Ok(candidates
            .iter()
            .filter(|c| advertised.iter().any(|p| p.as_ref() == c.as_str()))
            .cloned()
            .collect())
    }

    async fn open_stream(&self, peer: &AddrInfo, protocol: &str) -> anyhow::Result<Self::Stream> {
        self.connect(peer).await?;
        let wanted = StreamProtocol::try_from_owned(protocol.to_string())
            .map_err(|e| anyhow!("invalid protocol name {protocol:?}: {e}"))?;
        let mut control = self.control.clone();
        match control.open_stream(peer.peer_id, wanted).await {
            Ok(stream) => Ok(stream.compat()),
            Err(OpenStreamError::UnsupportedProtocol(p)) => {
                bail!("protocol {p} not supported by peer {}", peer.peer_id)
            }
            Err(e) => Err(anyhow!("opening {protocol} stream to {}: {e}", peer.peer_id)),
        }
    }
}
