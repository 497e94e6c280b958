pub mod broadcast;
pub mod ws;

pub use broadcast::{BroadcastHub, ClientFrame, ServerFrame};
pub use ws::{serve, WsState};
