// Primary channel runtime - drives `PrimaryChannel` on a background thread
// Bridges the WebSocket to the sync UI loop via channels

use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc as async_mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::client::{PrimaryCommand, PrimaryEvent};
use super::primary::{ConnectionState, Input, Output, PrimaryChannel};
use super::protocol::ClientMessage;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Connecting = Pin<Box<dyn Future<Output = Result<Socket, String>>>>;

// Close codes reported when the socket ends without a close frame
const NO_STATUS: u16 = 1005;
const ABNORMAL_CLOSURE: u16 = 1006;

// A handshake still pending after this counts as a transport failure
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the primary channel in a background thread with its own tokio runtime
pub fn spawn_primary_thread(
    channel: PrimaryChannel,
    event_tx: mpsc::Sender<PrimaryEvent>,
    cmd_rx: async_mpsc::UnboundedReceiver<PrimaryCommand>,
    connected: Arc<AtomicBool>,
) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("bingo-primary".to_string())
        .spawn(move || {
            let driver = Driver {
                channel,
                socket: None,
                connecting: None,
                event_tx,
                connected,
            };
            runtime.block_on(driver.run(cmd_rx));
        })?;

    Ok(())
}

struct Driver {
    channel: PrimaryChannel,
    socket: Option<Socket>,
    connecting: Option<Connecting>,
    event_tx: mpsc::Sender<PrimaryEvent>,
    connected: Arc<AtomicBool>,
}

impl Driver {
    async fn run(mut self, mut cmd_rx: async_mpsc::UnboundedReceiver<PrimaryCommand>) {
        info!("Primary channel thread started");

        loop {
            let deadline = self.drain().await;

            let input = tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(PrimaryCommand::Send(message)) => self.channel.send(message),
                        Some(PrimaryCommand::Connect) => self.channel.connect(),
                        Some(PrimaryCommand::Resume) => self.channel.resume(),
                        Some(PrimaryCommand::Shutdown) | None => {
                            self.channel.shutdown();
                            self.drain().await;
                            break;
                        }
                    }
                    continue;
                }
                result = next_connect(&mut self.connecting) => {
                    self.connecting = None;
                    match result {
                        Ok(socket) => {
                            self.socket = Some(socket);
                            Input::Opened
                        }
                        Err(e) => Input::Error(e),
                    }
                }
                frame = next_frame(&mut self.socket) => {
                    match frame {
                        Some(Ok(Message::Text(text))) => Input::Frame(text),
                        Some(Ok(Message::Close(frame))) => {
                            self.socket = None;
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((NO_STATUS, String::new()));
                            Input::Closed { code, reason }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            debug!("Ignoring {} byte binary frame", data.len());
                            continue;
                        }
                        // Protocol-level ping/pong is answered by tungstenite
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            self.socket = None;
                            Input::Error(e.to_string())
                        }
                        None => {
                            self.socket = None;
                            Input::Closed {
                                code: ABNORMAL_CLOSURE,
                                reason: "connection dropped".to_string(),
                            }
                        }
                    }
                }
                _ = sleep_until(deadline) => Input::Timeout,
            };

            self.channel.handle_input(Instant::now(), input);
        }

        self.connected.store(false, Ordering::Relaxed);
        info!("Primary channel thread stopped");
    }

    /// Carry out everything the state machine asked for; returns its next deadline
    async fn drain(&mut self) -> Option<Instant> {
        loop {
            match self.channel.poll_output() {
                Output::Connect(url) => {
                    self.socket = None;
                    self.connecting = Some(Box::pin(connect_with_timeout(url, CONNECT_TIMEOUT)));
                }
                Output::Transmit(message) => self.transmit(message).await,
                Output::Close(code) => {
                    if let Some(mut socket) = self.socket.take() {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: "".into(),
                        };
                        if let Err(e) = socket.close(Some(frame)).await {
                            debug!("Close handshake failed: {}", e);
                        }
                    }
                    self.connecting = None;
                }
                Output::Event(event) => {
                    if let PrimaryEvent::StateChanged(state) = &event {
                        self.connected
                            .store(*state == ConnectionState::Connected, Ordering::Relaxed);
                    }
                    let _ = self.event_tx.send(event);
                }
                Output::Timeout(deadline) => return deadline,
            }
        }
    }

    async fn transmit(&mut self, message: ClientMessage) {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode {}: {}", message.kind(), e);
                return;
            }
        };
        let Some(socket) = self.socket.as_mut() else {
            self.channel.requeue(message);
            return;
        };
        let result = socket.send(Message::Text(json)).await;
        if let Err(e) = result {
            warn!("Failed to send {}: {}", message.kind(), e);
            self.socket = None;
            self.channel
                .handle_input(Instant::now(), Input::Error(e.to_string()));
            self.channel.requeue(message);
        }
    }
}

async fn connect_with_timeout(url: String, limit: Duration) -> Result<Socket, String> {
    match tokio::time::timeout(limit, connect_async(url)).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("connect timed out after {}ms", limit.as_millis())),
    }
}

async fn next_connect(connecting: &mut Option<Connecting>) -> Result<Socket, String> {
    match connecting {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(socket: &mut Option<Socket>) -> Option<Result<Message, tungstenite::Error>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn block_on<F: Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn test_silent_server_times_out_handshake() {
        // Accepts TCP (via the backlog) but never answers the upgrade
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());

        let started = Instant::now();
        let result = block_on(connect_with_timeout(url, Duration::from_millis(200)));

        match result {
            Err(e) => assert!(e.contains("timed out"), "unexpected error: {}", e),
            Ok(_) => panic!("handshake should not complete"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(listener);
    }

    #[test]
    fn test_refused_connect_is_an_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("ws://127.0.0.1:{}/ws", port);

        let result = block_on(connect_with_timeout(url, Duration::from_secs(5)));
        assert!(result.is_err());
    }
}
