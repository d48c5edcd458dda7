// Peer link runtime - drives `PeerLink` over a UDP socket
// Synchronous str0m polling loop on a background thread; signaling leaves
// through the primary channel sender

use anyhow::{anyhow, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use str0m::Candidate;
use tracing::{debug, error, info, warn};

use super::client::{Notification, PeerCommand, PeerEvent, PrimarySender};
use super::peer::{Output, PeerLink, PeerLinkState};

// Short socket timeout so commands are drained frequently
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const STUN_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_BUFFER_SIZE: usize = 8192;

/// Rank a local address for use as the host candidate (lower is better)
fn interface_score(ip: &Ipv4Addr) -> u8 {
    let octets = ip.octets();
    if octets[0] == 192 && octets[1] == 168 {
        0
    } else if octets[0] == 172 && (16..=31).contains(&octets[1]) {
        1
    } else if octets[0] == 10 {
        2
    } else {
        3
    }
}

/// Discover the local network IP to bind the peer socket to
fn discover_local_ip() -> Result<IpAddr> {
    let interfaces =
        if_addrs::get_if_addrs().map_err(|e| anyhow!("Failed to get network interfaces: {}", e))?;

    let mut candidates: Vec<(String, Ipv4Addr)> = interfaces
        .into_iter()
        .filter_map(|iface| match iface.addr.ip() {
            IpAddr::V4(ipv4) if !ipv4.is_loopback() => Some((iface.name, ipv4)),
            _ => None,
        })
        .collect();

    candidates.sort_by_key(|(_, ip)| interface_score(ip));
    let (name, ip) = candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No suitable network interfaces found"))?;

    debug!("Selected interface {} ({})", name, ip);
    Ok(IpAddr::V4(ip))
}

/// Ask a STUN server for our public address, using the same socket ICE will use
fn query_stun_server(udp_socket: &UdpSocket, stun_server: &str) -> Result<SocketAddr> {
    let stun_addr = stun_server
        .to_socket_addrs()?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| anyhow!("Failed to resolve STUN server {} to IPv4", stun_server))?;

    udp_socket.set_read_timeout(Some(STUN_TIMEOUT))?;
    let client = stunclient::StunClient::new(stun_addr);
    let public_addr = client
        .query_external_address(udp_socket)
        .map_err(|e| anyhow!("STUN query failed: {}", e))?;

    Ok(public_addr)
}

/// Bind the socket and register host (and, if reachable, server reflexive) candidates
fn bind_candidates(link: &mut PeerLink, stun_server: Option<&str>) -> Result<UdpSocket> {
    let local_ip = discover_local_ip().unwrap_or_else(|e| {
        warn!("{}, falling back to loopback", e);
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    });

    // Bind to the specific IP so local_addr() matches the host candidate
    let udp_socket = UdpSocket::bind(SocketAddr::new(local_ip, 0))?;
    let host_addr = udp_socket.local_addr()?;
    info!("Bound peer UDP socket: {}", host_addr);

    let host = Candidate::host(host_addr, "udp")
        .map_err(|e| anyhow!("Failed to create host candidate: {}", e))?;
    link.add_local_candidate(host);

    let Some(stun_server) = stun_server else {
        return Ok(udp_socket);
    };
    match query_stun_server(&udp_socket, stun_server) {
        Ok(public_addr) => {
            info!("Public address from STUN: {}", public_addr);
            match Candidate::server_reflexive(public_addr, host_addr, "udp") {
                Ok(srflx) => link.add_local_candidate(srflx),
                Err(e) => warn!("Failed to create server reflexive candidate: {}", e),
            }
        }
        Err(e) => warn!("{:#}, using host candidate only", e),
    }

    Ok(udp_socket)
}

/// Run the peer link in a background thread
pub fn spawn_peer_thread(
    mut link: PeerLink,
    stun_server: Option<String>,
    signals: PrimarySender,
    event_tx: mpsc::Sender<PeerEvent>,
    cmd_rx: mpsc::Receiver<PeerCommand>,
    open: Arc<AtomicBool>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("bingo-peer".to_string())
        .spawn(move || {
            let result = bind_candidates(&mut link, stun_server.as_deref()).and_then(|socket| {
                run_peer_loop(link, socket, &signals, &event_tx, &cmd_rx, &open)
            });
            open.store(false, Ordering::Relaxed);
            if let Err(e) = result {
                error!("Peer link failed: {:#}", e);
                let _ = event_tx.send(PeerEvent::Notification(Notification::error(format!(
                    "Peer link failed: {}",
                    e
                ))));
            }
        })?;

    Ok(())
}

fn run_peer_loop(
    mut link: PeerLink,
    udp_socket: UdpSocket,
    signals: &PrimarySender,
    event_tx: &mpsc::Sender<PeerEvent>,
    cmd_rx: &mpsc::Receiver<PeerCommand>,
    open: &AtomicBool,
) -> Result<()> {
    info!("Starting peer polling loop");
    udp_socket.set_read_timeout(Some(POLL_INTERVAL))?;
    let local_addr = udp_socket.local_addr()?;

    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        // Phase 1: carry out everything the link asked for
        let deadline = loop {
            match link.poll_output()? {
                Output::Transmit(transmit) => {
                    if let Err(e) = udp_socket.send_to(&transmit.contents, transmit.destination) {
                        warn!("Failed to send UDP packet: {}", e);
                    }
                }
                Output::Signal(message) => signals.send(message),
                Output::Event(event) => {
                    if let PeerEvent::StateChanged(state) = &event {
                        open.store(*state == PeerLinkState::Open, Ordering::Relaxed);
                    }
                    let _ = event_tx.send(event);
                }
                Output::Timeout(at) => break at,
                Output::Closed => {
                    info!("Peer polling loop finished");
                    return Ok(());
                }
            }
        };

        // Phase 2: wait briefly for a datagram
        match udp_socket.recv_from(&mut buf) {
            Ok((n, source)) => {
                link.handle_receive(Instant::now(), source, local_addr, &buf[..n]);
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                let now = Instant::now();
                if now >= deadline {
                    link.handle_timeout(now)?;
                }
            }
            Err(e) => {
                error!("UDP socket error: {}", e);
                return Err(e.into());
            }
        }

        // Phase 3: commands from the UI (non-blocking)
        loop {
            match cmd_rx.try_recv() {
                Ok(command) => apply_command(&mut link, command),
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    // UI handle dropped
                    link.stop();
                    break;
                }
            }
        }
    }
}

fn apply_command(link: &mut PeerLink, command: PeerCommand) {
    match command {
        PeerCommand::StartLink => link.start_link(),
        PeerCommand::Signal(envelope) => link.handle_signal(envelope),
        PeerCommand::Send(message) => {
            link.send(&message);
        }
        PeerCommand::SendNumberCall(number) => {
            link.send_number_call(number);
        }
        PeerCommand::SendWinner {
            winner,
            amount,
            pattern,
        } => {
            link.send_winner(winner, amount, pattern);
        }
        PeerCommand::SendChat { message, sender } => {
            link.send_chat(message, sender);
        }
        PeerCommand::Stop => link.stop(),
    }
}
