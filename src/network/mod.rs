// Node-facing surface: transaction/block admission, relay and mining

mod broadcast;
mod node;

pub use broadcast::{Broadcaster, ChannelBroadcaster, LogBroadcaster};
pub use node::{MinerHandle, Node};
