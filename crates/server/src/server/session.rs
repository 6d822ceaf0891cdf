//! Session actor.
//!
//! One worker task per game owns the `Game` outright. Joins, leaves, intents and timer
//! ticks arrive on a single bounded queue and are applied one at a time. After each
//! input the game is stepped, outbound events are fanned out to per-client buffers and
//! a fresh snapshot is published.

use super::game::{Game, Recipient};
use super::player::PlayerId;
use crate::config::ServerConfig;
use crate::error::{JoinError, SessionError, SubmitError};
use protocol::{ClientMessage, GameView, ServerEvent};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

/// Outbound buffer of one connected client.
pub type ClientSender = mpsc::Sender<ServerEvent>;

/// Input to a session.
#[derive(Debug)]
pub enum Command {
    Join {
        name: String,
        outbound: ClientSender,
        reply: oneshot::Sender<Result<PlayerId, JoinError>>,
    },
    Leave {
        id: PlayerId,
    },
    Intent {
        id: PlayerId,
        message: ClientMessage,
    },
    Shutdown,
}

/// Cloneable address of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    game_id: String,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<GameView>,
}

impl SessionHandle {
    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    /// Queue a command without waiting. A full queue is reported, never waited on.
    pub fn submit(&self, command: Command) -> Result<(), SubmitError> {
        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::Backpressure,
            TrySendError::Closed(_) => SubmitError::SessionClosed,
        })
    }

    /// Register a player whose events go to `outbound`.
    pub async fn join(&self, name: &str, outbound: ClientSender) -> Result<PlayerId, SessionError> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::Join {
            name: name.to_string(),
            outbound,
            reply,
        })?;
        let id = response.await.map_err(|_| SubmitError::SessionClosed)??;
        Ok(id)
    }

    /// Report a disconnect. Waits for queue space so the notice is never lost.
    pub async fn leave(&self, id: PlayerId) -> Result<(), SubmitError> {
        self.commands
            .send(Command::Leave { id })
            .await
            .map_err(|_| SubmitError::SessionClosed)
    }

    pub fn intent(&self, id: PlayerId, message: ClientMessage) -> Result<(), SubmitError> {
        self.submit(Command::Intent { id, message })
    }

    /// Parse and queue a raw text frame. Malformed frames are logged and dropped.
    pub fn submit_text(&self, id: PlayerId, text: &str) -> Result<(), SubmitError> {
        match ClientMessage::parse(text) {
            Ok(message) => self.intent(id, message),
            Err(e) => {
                warn!("Game {}: dropping malformed message from player {}: {}", self.game_id, id, e);
                Ok(())
            }
        }
    }

    /// Latest published state. A deep copy, safe to hold across awaits.
    pub fn snapshot(&self) -> GameView {
        self.snapshot.borrow().clone()
    }

    pub fn shutdown(&self) -> Result<(), SubmitError> {
        self.submit(Command::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// The worker owning one game.
pub struct Session {
    game: Game,
    commands: mpsc::Receiver<Command>,
    clients: HashMap<PlayerId, ClientSender>,
    snapshot: watch::Sender<GameView>,
    tick_interval: Duration,
}

impl Session {
    pub fn new(game: Game, config: &ServerConfig) -> (Self, SessionHandle) {
        let (commands_tx, commands) = mpsc::channel(config.command_queue_capacity.max(1));
        let (snapshot, snapshot_rx) = watch::channel(game.view(Instant::now()));
        let handle = SessionHandle {
            game_id: game.id().to_string(),
            commands: commands_tx,
            snapshot: snapshot_rx,
        };
        let session = Self {
            game,
            commands,
            clients: HashMap::new(),
            snapshot,
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
        };
        (session, handle)
    }

    /// Start the worker on the runtime.
    pub fn spawn(game: Game, config: &ServerConfig) -> (SessionHandle, JoinHandle<()>) {
        let (session, handle) = Self::new(game, config);
        (handle, tokio::spawn(session.run()))
    }

    /// Process inputs until the game is torn down or the session is told to stop.
    pub async fn run(mut self) {
        let start = tokio::time::Instant::now() + self.tick_interval;
        let mut ticker = interval_at(start, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Session for game {} started", self.game.id());

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        self.stop();
                        break;
                    }
                    Some(command) => self.handle(command),
                },
                _ = ticker.tick() => {
                    self.apply(|_, _| ());
                    self.flush();
                }
            }
            if self.game.is_finished() {
                break;
            }
        }

        self.clients.clear();
        info!("Session for game {} stopped", self.game.id());
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Join { name, outbound, reply } => {
                let Some(result) = self.apply(|game, now| game.join(&name, now)) else {
                    // Rolled back; dropping `reply` tells the caller the session failed.
                    self.flush();
                    return;
                };
                let joined = result.as_ref().ok().copied();
                if let Some(id) = joined {
                    self.clients.insert(id, outbound);
                }
                self.flush();
                if reply.send(result).is_err() {
                    if let Some(id) = joined {
                        debug!("Game {}: player {} gave up before joining", self.game.id(), id);
                        self.disconnect(id);
                        self.flush();
                    }
                }
            }
            Command::Leave { id } => {
                self.disconnect(id);
                self.flush();
            }
            Command::Intent { id, message } => {
                self.apply(|game, now| game.handle_intent(id, message, now));
                self.flush();
            }
            Command::Shutdown => {}
        }
    }

    fn disconnect(&mut self, id: PlayerId) {
        self.clients.remove(&id);
        self.apply(|game, now| game.leave(id, now));
    }

    /// Run `f` and one step atomically. A panic or broken invariant restores the game
    /// as it was before the input and returns `None`.
    fn apply<T>(&mut self, f: impl FnOnce(&mut Game, Instant) -> T) -> Option<T> {
        let now = Instant::now();
        let backup = self.game.clone();
        let game = &mut self.game;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let value = f(game, now);
            game.step(now);
            game.check_invariants().map(|()| value)
        }));

        match outcome {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                error!("Game {}: {}; step rolled back", backup.id(), e);
                self.game = backup;
                None
            }
            Err(payload) => {
                error!(
                    "Game {}: step panicked ({}); rolled back",
                    backup.id(),
                    panic_message(payload.as_ref())
                );
                self.game = backup;
                None
            }
        }
    }

    /// Deliver pending events and publish a snapshot. Clients whose buffer is full or
    /// closed are dropped and reported to the game as disconnected.
    fn flush(&mut self) {
        loop {
            let mut dropped = Vec::new();
            for out in self.game.drain_events() {
                match out.to {
                    Recipient::All => {
                        for (&id, client) in &self.clients {
                            if client.try_send(out.event.clone()).is_err() {
                                dropped.push(id);
                            }
                        }
                    }
                    Recipient::Player(id) => {
                        if let Some(client) = self.clients.get(&id) {
                            if client.try_send(out.event).is_err() {
                                dropped.push(id);
                            }
                        }
                    }
                }
            }
            if dropped.is_empty() {
                break;
            }
            dropped.sort_unstable();
            dropped.dedup();
            for id in dropped {
                if self.clients.contains_key(&id) {
                    warn!("Game {}: dropping unresponsive client {}", self.game.id(), id);
                    self.disconnect(id);
                }
            }
        }
        self.snapshot.send_replace(self.game.view(Instant::now()));
    }

    /// Administrative stop: tell every client the game is gone.
    fn stop(&mut self) {
        info!("Session for game {} shutting down", self.game.id());
        let event = ServerEvent::GameCleanup {
            game_id: self.game.id().to_string(),
        };
        for client in self.clients.values() {
            let _ = client.try_send(event.clone());
        }
    }
}
