//! The two TCP front ends: a publish-only output socket and a
//! request/reply control socket. Both are line protocols so any front end
//! can drive them with a plain socket.

use std::str::FromStr;

use snafu::ResultExt;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

use link_api::Command;

use super::{Event, NexusError, SocketBind};

/// Every control request is answered with this line.
pub const CONTROL_REPLY: &str = "Awaiting input:";

/// Publishes state lines to every connected front end.
pub struct OutputPublisher {
    port: u16,
    lines: mpsc::Sender<String>,
}

impl OutputPublisher {
    /// Bind the output socket; port 0 auto-allocates.
    pub async fn bind(port: u16) -> Result<Self, NexusError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .context(SocketBind {
                which: "output",
            })?;
        let port = listener.local_addr().context(SocketBind {
            which: "output",
        })?
        .port();

        let (lines, mut rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            let mut clients: Vec<TcpStream> = Vec::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => clients.push(stream),
                        Err(error) => {
                            warn!("output socket accept failed: {}", error);
                            break;
                        }
                    },
                    line = rx.recv() => match line {
                        Some(line) => {
                            let payload = format!("{}\n", line);
                            let mut alive = Vec::with_capacity(clients.len());
                            for mut client in clients.drain(..) {
                                if client.write_all(payload.as_bytes()).await.is_ok() {
                                    alive.push(client);
                                }
                            }
                            clients = alive;
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(Self {
            port,
            lines,
        })
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Emit one line to every subscriber.
    pub async fn publish(&self, line: &str) {
        debug!("output: {}", line);
        let _ = self.lines.send(line.to_string()).await;
    }
}

/// Accepts command lines and funnels them into the supervisor loop.
/// Every request is acknowledged with [`CONTROL_REPLY`].
pub struct ControlSocket {
    port: u16,
}

impl ControlSocket {
    /// Bind the control socket; port 0 auto-allocates.
    pub async fn bind(port: u16, events: mpsc::Sender<Event>) -> Result<Self, NexusError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .context(SocketBind {
                which: "control",
            })?;
        let port = listener.local_addr().context(SocketBind {
            which: "control",
        })?
        .port();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let events = events.clone();
                        tokio::spawn(async move {
                            serve_requests(stream, events).await;
                        });
                    }
                    Err(error) => {
                        warn!("control socket accept failed: {}", error);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            port,
        })
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

async fn serve_requests(stream: TcpStream, events: mpsc::Sender<Event>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            _ => break,
        };
        let reply = format!("{}\n", CONTROL_REPLY);
        if writer.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
        let event = match Command::from_str(line.trim()) {
            Ok(command) => Event::Command(command),
            Err(_) => Event::UnknownCommand(line),
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
}
