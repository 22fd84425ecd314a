//! The persistent event-stream connection.
//!
//! [`GatewayConnection`] owns one socket and runs the HELLO → IDENTIFY/RESUME
//! → dispatch state machine on its own task. Talk to it through a
//! [`GatewayHandle`]; observe it through [`Listeners`] (dispatches) and
//! [`GatewayEvent`]s (lifecycle).

mod close_code;
mod connection;
mod heartbeat;
mod listener;
mod opcode;
mod payload;
mod session;
mod state;
mod transport;

pub use close_code::{classify, CloseAction, CloseCode};
pub use connection::{GatewayConnection, GatewayEvent, GatewayHandle};
pub use heartbeat::{Heartbeat, MISSED_ACK_LIMIT};
pub use listener::Listeners;
pub use opcode::{GatewayOpcode, Intents};
pub use payload::{ConnectionProperties, Hello, Identify, Payload};
pub use session::Session;
pub use state::ConnectionState;
pub use transport::{Connector, Frame, Transport, WebSocketConnector};
