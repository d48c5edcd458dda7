// bingo-link terminal client
// Line-oriented front-end over the connection layer: commands in on stdin,
// game traffic and notifications out on stdout

use anyhow::Result;
use std::cell::RefCell;
use std::io::{self, BufRead};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use bingo_link::config::{self, Config};
use bingo_link::debug;
use bingo_link::network::protocol::timestamp_ms;
use bingo_link::network::{
    self, CaptureDevice, ClientMessage, ConnectionState, Dispatcher, Identity, MediaSource,
    Notification, PeerClient, PeerConfig, PeerEvent, PeerLink, PeerMessage, PeerRole,
    PrimaryChannel, PrimaryClient, PrimaryConfig, PrimaryEvent, ServerMessage,
};
use bingo_link::storage::{
    last_room_id, load_or_create_player_id, FileStorage, Settings, StoredQueue,
    PENDING_MESSAGES_KEY,
};

const TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Options {
    admin_password: Option<String>,
    room: Option<String>,
    peer_role: Option<PeerRole>,
    debug: bool,
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args);

    debug::init(options.debug)?;
    info!("bingo-link starting");

    let config = config::load_config().unwrap_or_else(|e| {
        warn!("Failed to load config: {}, using defaults", e);
        Config::default()
    });

    let data_dir = config
        .storage
        .data_dir
        .clone()
        .unwrap_or_else(FileStorage::default_dir);
    let mut store = FileStorage::new(data_dir)?;
    let settings = Settings::load(&store);
    let player_id = load_or_create_player_id(&mut store)?;

    let is_admin = match &options.admin_password {
        Some(password) if *password == config.admin.password => true,
        Some(_) => {
            eprintln!("Wrong admin password, continuing as player");
            false
        }
        None => false,
    };

    let room = Rc::new(RefCell::new(
        options.room.clone().or_else(|| last_room_id(&store)),
    ));

    let queue = StoredQueue::new(
        store.clone(),
        PENDING_MESSAGES_KEY,
        config.network.queue_capacity,
    );
    let channel = PrimaryChannel::new(
        PrimaryConfig::from_network(&config.network),
        Identity {
            player_id: player_id.clone(),
            is_admin,
        },
        Box::new(queue),
        Box::new(store),
    );
    let primary = network::start_primary(channel)?;
    let peer = start_peer_link(&config, &options, &primary, room.borrow().clone())?;

    println!(
        "bingo-link {} as {}{}",
        config.network.ws_url,
        player_id,
        if is_admin { " (admin)" } else { "" }
    );
    println!("Type 'help' for commands.");

    let session = Session {
        player_id,
        is_admin,
        room,
        show_notifications: settings.notification_enabled,
    };
    let result = run(&session, &primary, peer.as_ref());

    if let Some(peer) = &peer {
        let _ = peer.stop();
    }
    let _ = primary.shutdown();
    // Let the close handshakes go out
    thread::sleep(Duration::from_millis(200));

    result
}

fn start_peer_link(
    config: &Config,
    options: &Options,
    primary: &PrimaryClient,
    room: Option<String>,
) -> Result<Option<PeerClient>> {
    let Some(role) = options.peer_role else {
        return Ok(None);
    };
    if !config.rtc.enabled {
        println!("Peer link disabled in config");
        return Ok(None);
    }

    let media: Option<Box<dyn MediaSource>> = if config.rtc.enable_media {
        Some(Box::new(CaptureDevice::new(&config.rtc.media_device)))
    } else {
        None
    };
    let link = PeerLink::new(role, room, PeerConfig::from_rtc(&config.rtc), media);
    let peer = network::start_peer(link, config.rtc.stun_server(), primary.sender())?;
    Ok(Some(peer))
}

struct Session {
    player_id: String,
    is_admin: bool,
    room: Rc<RefCell<Option<String>>>,
    show_notifications: bool,
}

impl Session {
    fn room_id(&self) -> Option<String> {
        self.room.borrow().clone()
    }

    fn notify(&self, source: &str, notification: &Notification) {
        if notification.is_error {
            eprintln!("[{}] ! {}", source, notification.message);
        } else if self.show_notifications {
            println!("[{}] {}", source, notification.message);
        }
    }
}

fn run(session: &Session, primary: &PrimaryClient, peer: Option<&PeerClient>) -> Result<()> {
    let lines = spawn_stdin_reader()?;
    let mut server_handlers = server_dispatcher(session.room.clone());
    let mut peer_handlers = peer_dispatcher();

    loop {
        for event in primary.dispatch_pending(&mut server_handlers) {
            match event {
                PrimaryEvent::StateChanged(state) => println!("[server] {:?}", state),
                PrimaryEvent::Signal(envelope) => match peer {
                    Some(peer) => {
                        if let Err(e) = peer.signal(envelope) {
                            warn!("Peer link gone: {}", e);
                        }
                    }
                    None => debug!("No peer link, dropping relayed signaling"),
                },
                PrimaryEvent::Notification(notification) => session.notify("server", &notification),
                PrimaryEvent::Message(_) => {}
            }
        }

        if let Some(peer) = peer {
            for event in peer.dispatch_pending(&mut peer_handlers) {
                match event {
                    PeerEvent::StateChanged(state) => println!("[peer] {:?}", state),
                    PeerEvent::Notification(notification) => session.notify("peer", &notification),
                    PeerEvent::Message(_) => {}
                }
            }
        }

        match lines.recv_timeout(TICK) {
            Ok(line) => {
                if !handle_command(session, primary, peer, line.trim()) {
                    return Ok(());
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

fn spawn_stdin_reader() -> io::Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

fn server_dispatcher(room: Rc<RefCell<Option<String>>>) -> Dispatcher<ServerMessage> {
    let mut handlers = Dispatcher::new("server");
    handlers
        .on("welcome", move |msg: &ServerMessage| {
            if let ServerMessage::Welcome { room_id, message } = msg {
                if let Some(room_id) = room_id {
                    *room.borrow_mut() = Some(room_id.clone());
                }
                println!(
                    "Welcome{}",
                    message.as_deref().map(|m| format!(": {}", m)).unwrap_or_default()
                );
            }
        })
        .on("number_called", |msg: &ServerMessage| {
            if let ServerMessage::NumberCalled { number } = msg {
                println!("Number called: {}", number);
            }
        })
        .on("game_started", |msg: &ServerMessage| {
            if let ServerMessage::GameStarted { game_type, stake } = msg {
                println!(
                    "Game started ({}, stake {})",
                    game_type.as_deref().unwrap_or("standard"),
                    stake.unwrap_or(0)
                );
            }
        })
        .on("game_ended", |_: &ServerMessage| println!("Game ended"))
        .on("win_announced", |msg: &ServerMessage| {
            if let ServerMessage::WinAnnounced {
                winner_name,
                pattern,
                amount,
            } = msg
            {
                println!("{} won with {} ({:.2} ETB)", winner_name, pattern, amount);
            }
        })
        .on("admin_message", |msg: &ServerMessage| {
            if let ServerMessage::AdminMessage { message } = msg {
                println!("Admin: {}", message);
            }
        })
        .on("player_joined", |msg: &ServerMessage| {
            if let ServerMessage::PlayerJoined { player_id, name, .. } = msg {
                println!("{} joined", name.as_deref().unwrap_or(player_id));
            }
        })
        .on("player_left", |msg: &ServerMessage| {
            if let ServerMessage::PlayerLeft { player_id } = msg {
                println!("{} left", player_id);
            }
        })
        .on("player_paid", |msg: &ServerMessage| {
            if let ServerMessage::PlayerPaid { player_id, amount } = msg {
                println!("{} paid {:.2} ETB", player_id, amount);
            }
        })
        .on("player_won", |msg: &ServerMessage| {
            if let ServerMessage::PlayerWon {
                player_id,
                amount,
                pattern,
            } = msg
            {
                println!("{} won {:.2} ETB with {}", player_id, amount, pattern);
            }
        })
        .on("game_request", |msg: &ServerMessage| {
            if let ServerMessage::GameRequest {
                request, player_id, ..
            } = msg
            {
                println!(
                    "Request '{}' from {}",
                    request,
                    player_id.as_deref().unwrap_or("unknown player")
                );
            }
        })
        // Already surfaced as a notification
        .on("error", |_: &ServerMessage| {});
    handlers
}

fn peer_dispatcher() -> Dispatcher<PeerMessage> {
    let mut handlers = Dispatcher::new("peer");
    handlers
        .on("number_called", |msg: &PeerMessage| {
            if let PeerMessage::NumberCalled { number, .. } = msg {
                println!("[peer] Number called: {}", number);
            }
        })
        .on("winner", |msg: &PeerMessage| {
            if let PeerMessage::Winner {
                winner,
                amount,
                pattern,
                ..
            } = msg
            {
                println!("[peer] {} won {:.2} ETB with {}", winner, amount, pattern);
            }
        })
        .on("chat", |msg: &PeerMessage| {
            if let PeerMessage::Chat {
                message, sender, ..
            } = msg
            {
                println!("[peer] {}: {}", sender, message);
            }
        })
        .on("file", |msg: &PeerMessage| {
            if let PeerMessage::File { filename, size } = msg {
                println!("[peer] File offered: {} ({} bytes)", filename, size);
            }
        })
        .on("game_state", |msg: &PeerMessage| {
            if let PeerMessage::GameState { numbers, winners } = msg {
                println!(
                    "[peer] Game state: {} numbers called, {} winners",
                    numbers.as_ref().map_or(0, Vec::len),
                    winners.as_ref().map_or(0, Vec::len)
                );
            }
        });
    handlers
}

fn parse_ball(text: &str) -> Option<u8> {
    text.parse::<u8>().ok().filter(|n| (1..=75).contains(n))
}

/// Returns false when the user asked to quit
fn handle_command(
    session: &Session,
    primary: &PrimaryClient,
    peer: Option<&PeerClient>,
    line: &str,
) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let player_id = session.player_id.clone();

    match command {
        "" => {}
        "help" => print_commands(),
        "quit" | "exit" => return false,
        "mark" => match parse_ball(rest) {
            Some(number) => primary.send(ClientMessage::Mark {
                player_id,
                number,
                marked: true,
            }),
            None => println!("Usage: mark <1-75>"),
        },
        "register" => {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            match parts.as_slice() {
                [name, phone, stake] => match stake.parse::<u64>() {
                    Ok(stake) => primary.send(ClientMessage::Register {
                        player_id,
                        name: name.to_string(),
                        phone: phone.to_string(),
                        stake,
                        board_id: None,
                        game_type: None,
                        payment: stake,
                    }),
                    Err(_) => println!("Stake must be a whole number"),
                },
                _ => println!("Usage: register <name> <phone> <stake>"),
            }
        }
        "pay" => match rest.parse::<u64>() {
            Ok(amount) => primary.send(ClientMessage::Payment { player_id, amount }),
            Err(_) => println!("Usage: pay <amount>"),
        },
        "start" if !rest.is_empty() => primary.send(ClientMessage::StartGame {
            player_id,
            game_type: rest.to_string(),
        }),
        "win" if !rest.is_empty() => primary.send(ClientMessage::Win {
            player_id,
            pattern: rest.to_string(),
            amount: 0.0,
        }),
        "call" | "broadcast" if !session.is_admin => {
            println!("'{}' needs --admin", command);
        }
        "call" => match parse_ball(rest) {
            Some(number) => {
                primary.send(ClientMessage::NumberCalled {
                    number,
                    room_id: session.room_id(),
                    timestamp: timestamp_ms(),
                });
                if let Some(peer) = peer {
                    let _ = peer.send_number_call(number);
                }
            }
            None => println!("Usage: call <1-75>"),
        },
        "broadcast" if !rest.is_empty() => primary.send(ClientMessage::AdminBroadcast {
            message: rest.to_string(),
            room_id: session.room_id(),
            timestamp: timestamp_ms(),
        }),
        "chat" if !rest.is_empty() => match peer {
            Some(peer) => {
                let _ = peer.send_chat(rest.to_string(), player_id);
            }
            None => println!("No peer link (start with --rtc-initiator or --rtc-responder)"),
        },
        "link" => match peer {
            Some(peer) => {
                if let Err(e) = peer.start_link() {
                    println!("Peer link unavailable: {}", e);
                }
            }
            None => println!("No peer link (start with --rtc-initiator or --rtc-responder)"),
        },
        "resume" => {
            if let Err(e) = primary.resume() {
                println!("Primary channel unavailable: {}", e);
            }
        }
        "status" => println!(
            "server: {:?}, peer open: {}, room: {}",
            if primary.is_connected() {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            },
            peer.map_or(false, PeerClient::is_open),
            session.room_id().as_deref().unwrap_or("-")
        ),
        _ => println!("Unknown command '{}', type 'help'", line),
    }
    true
}

fn print_commands() {
    println!("Commands:");
    println!("  mark <n>                      mark a number on your board");
    println!("  register <name> <phone> <stake>");
    println!("  pay <amount>                  report a payment");
    println!("  start <game type>             request a game");
    println!("  win <pattern>                 claim a win");
    println!("  call <n>                      (admin) call a number");
    println!("  broadcast <text>              (admin) message all players");
    println!("  chat <text>                   chat over the peer link");
    println!("  link                          start the peer link (initiator)");
    println!("  resume                        reconnect after giving up");
    println!("  status                        connection summary");
    println!("  quit");
}

/// Parse command line arguments
fn parse_args(args: &[String]) -> Options {
    let mut options = Options::default();
    let mut iter = args.iter().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--admin" => match iter.next() {
                Some(password) => options.admin_password = Some(password.clone()),
                None => usage_error(&args[0], "--admin requires a password"),
            },
            "--room" => match iter.next() {
                Some(room) => options.room = Some(room.clone()),
                None => usage_error(&args[0], "--room requires a room id"),
            },
            "--rtc-initiator" => options.peer_role = Some(PeerRole::Initiator),
            "--rtc-responder" => options.peer_role = Some(PeerRole::Responder),
            "--debug" | "-d" => options.debug = true,
            "--help" | "-h" => {
                print_usage(&args[0]);
                std::process::exit(0);
            }
            other => usage_error(&args[0], &format!("Unknown argument: {}", other)),
        }
    }

    options
}

fn usage_error(program: &str, message: &str) -> ! {
    eprintln!("Error: {}", message);
    print_usage(program);
    std::process::exit(1);
}

fn print_usage(program: &str) {
    println!("bingo-link - bingo game client connection layer");
    println!();
    println!("Usage:");
    println!("  {} [options]", program);
    println!();
    println!("Options:");
    println!("  --admin <password>     Join as the game admin");
    println!("  --room <id>            Room to use before the server assigns one");
    println!("  --rtc-initiator        Open a peer data channel and send the offer");
    println!("  --rtc-responder        Wait for a peer data channel offer");
    println!("  --debug, -d            Log to {}", debug::LOG_FILE_PATH);
    println!("  --help, -h             Show this message");
    println!();
    println!("Settings live in {}", config::get_config_path().display());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("bingo-link")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_parse_args() {
        let options = parse_args(&args(&["--admin", "secret", "--rtc-responder", "-d"]));
        assert_eq!(options.admin_password.as_deref(), Some("secret"));
        assert_eq!(options.peer_role, Some(PeerRole::Responder));
        assert!(options.debug);
        assert!(options.room.is_none());
    }

    #[test]
    fn test_parse_ball_range() {
        assert_eq!(parse_ball("42"), Some(42));
        assert_eq!(parse_ball("0"), None);
        assert_eq!(parse_ball("76"), None);
        assert_eq!(parse_ball("x"), None);
    }
}
