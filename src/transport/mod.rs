pub mod connector;
pub mod link;
pub mod messages;

pub use connector::{Connection, GatewayConnector, Inbound, Outbound, WsConnector};
pub use link::{
    reconnect_delay, Effect, Link, LinkEvent, LinkOutcome, LinkState, TransportSettings,
};
pub use messages::{ClientInfo, ClientMessage, ReconnectInfo, RecognizerOptions, ServerMessage};
