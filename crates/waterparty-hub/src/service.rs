//! Hub control loop and the cloneable handle used by admission and pumps.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use waterparty_core::{RoomId, UserId};

use crate::client::{ClientHandle, EnqueueError};
use crate::error::HubError;
use crate::hub::{BroadcastReport, Hub};

/// Work serialized through the control loop.
#[derive(Debug)]
pub enum HubCommand {
    /// Acknowledged with the client this registration replaced, if any.
    Register {
        client: ClientHandle,
        ack: oneshot::Sender<Option<ClientHandle>>,
    },
    Unregister(ClientHandle),
    BroadcastToRoom { room_id: RoomId, frame: Arc<str> },
    BroadcastGlobal(Arc<str>),
}

/// The single task applying [`HubCommand`]s to the hub, one at a time.
pub struct HubService {
    hub: Arc<Hub>,
    rx: mpsc::Receiver<HubCommand>,
}

impl HubService {
    pub fn new(hub: Arc<Hub>, queue: usize) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let handle = HubHandle {
            hub: Arc::clone(&hub),
            tx,
        };
        (Self { hub, rx }, handle)
    }

    /// Create the service and spawn its loop.
    pub fn spawn(
        hub: Arc<Hub>,
        queue: usize,
        shutdown: CancellationToken,
    ) -> (HubHandle, JoinHandle<()>) {
        let (service, handle) = Self::new(hub, queue);
        let task = tokio::spawn(service.run(shutdown));
        (handle, task)
    }

    /// Serve commands until `shutdown` fires or every handle is dropped,
    /// then close all remaining clients.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("hub control loop started");
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.apply(cmd),
                    None => break,
                },
            }
        }
        let closed = self.hub.close_all();
        info!(closed, "hub control loop stopped");
    }

    fn apply(&self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { client, ack } => {
                let superseded = self.hub.register(client);
                if ack.send(superseded).is_err() {
                    debug!("register acknowledgement dropped");
                }
            }
            HubCommand::Unregister(client) => {
                let _ = self.hub.unregister(&client);
            }
            HubCommand::BroadcastToRoom { room_id, frame } => {
                let _ = self.hub.broadcast_to_room(&room_id, frame);
            }
            HubCommand::BroadcastGlobal(frame) => {
                let _ = self.hub.broadcast_global(frame);
            }
        }
    }
}

/// Cloneable entry point to a running hub.
///
/// Registration goes through the control loop. Room membership and direct
/// broadcasts act on the hub straight away; `queue_*` variants go through
/// the loop instead.
#[derive(Clone)]
pub struct HubHandle {
    hub: Arc<Hub>,
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Register through the control loop and wait until it has been applied.
    pub async fn register(&self, client: ClientHandle) -> Result<Option<ClientHandle>, HubError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(HubCommand::Register { client, ack })
            .await
            .map_err(|_| HubError::ControlLoopClosed)?;
        done.await.map_err(|_| HubError::ControlLoopClosed)
    }

    /// Unregister through the control loop, or directly once it has stopped.
    pub async fn unregister(&self, client: &ClientHandle) {
        if self.tx.send(HubCommand::Unregister(client.clone())).await.is_err() {
            let _ = self.hub.unregister(client);
        }
    }

    pub fn join_room(&self, room_id: &RoomId, client: &ClientHandle) -> bool {
        self.hub.join_room(room_id, client)
    }

    pub fn leave_room(&self, room_id: &RoomId, client: &ClientHandle) -> bool {
        self.hub.leave_room(room_id, client)
    }

    pub fn broadcast_to_room(&self, room_id: &RoomId, frame: Arc<str>) -> BroadcastReport {
        self.hub.broadcast_to_room(room_id, frame)
    }

    pub fn broadcast_global(&self, frame: Arc<str>) -> BroadcastReport {
        self.hub.broadcast_global(frame)
    }

    pub fn send_to_user(&self, user_id: &UserId, frame: Arc<str>) -> bool {
        self.hub.send_to_user(user_id, frame)
    }

    pub fn send_to_client(
        &self,
        client: &ClientHandle,
        frame: Arc<str>,
    ) -> Result<(), EnqueueError> {
        self.hub.send_to_client(client, frame)
    }

    pub async fn queue_broadcast(&self, room_id: RoomId, frame: Arc<str>) -> Result<(), HubError> {
        self.tx
            .send(HubCommand::BroadcastToRoom { room_id, frame })
            .await
            .map_err(|_| {
                warn!("room broadcast dropped, control loop stopped");
                HubError::ControlLoopClosed
            })
    }

    pub async fn queue_global(&self, frame: Arc<str>) -> Result<(), HubError> {
        self.tx
            .send(HubCommand::BroadcastGlobal(frame))
            .await
            .map_err(|_| HubError::ControlLoopClosed)
    }
}
