//! Game simulation modules

pub mod combat;
pub mod events;
pub mod gas;
pub mod grid;
pub mod r#match;
pub mod objects;
pub mod physics;
pub mod player;
pub mod register;
pub mod snapshot;
pub mod visibility;
pub mod world;

pub use r#match::{GameMatch, MatchHandle, MatchRegistry, SlotReservation};

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ws::protocol::ClientMsg;
use physics::Vec2;

/// Inbound message from a connection, queued for the match task
#[derive(Debug)]
pub struct PlayerInput {
    pub conn_id: Uuid,
    pub msg: InboundMsg,
}

#[derive(Debug)]
pub enum InboundMsg {
    /// Handshake already validated by the transport; `outbound` receives one
    /// buffer per tick. The slot is held for as long as the connection is.
    Join {
        name: String,
        outbound: mpsc::Sender<Bytes>,
        slot: SlotReservation,
    },
    Client(ClientMsg),
    Leave,
}

/// Input state for a single tick (latched from the latest InputMsg)
#[derive(Debug, Clone, Default)]
pub struct TickInput {
    pub seq: u8,
    pub move_dir: Vec2,
    pub aim_dir: Vec2,
    pub shoot: bool,
}
