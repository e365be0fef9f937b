// Outbound transaction relay

use crate::core::Transaction;
use crate::error::{LedgerError, Result};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Hands transactions to whatever carries them to other nodes
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, tx: &Transaction) -> Result<()>;
}

/// Pushes transactions onto a tokio channel drained by a network task
pub struct ChannelBroadcaster {
    sender: UnboundedSender<Transaction>,
}

impl ChannelBroadcaster {
    /// Create the broadcaster and the receiving end of its queue
    pub fn channel() -> (Self, UnboundedReceiver<Transaction>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<()> {
        self.sender
            .send(tx.clone())
            .map_err(|_| LedgerError::Broadcast(format!("relay closed, dropped {}", tx.id)))?;
        log::debug!("Queued transaction {} for relay", tx.id);
        Ok(())
    }
}

/// Relay for a node with no peers: only logs
#[derive(Debug, Default)]
pub struct LogBroadcaster;

impl Broadcaster for LogBroadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<()> {
        log::info!("Broadcasting transaction {} ({} outputs)", tx.id, tx.outputs.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transaction {
        Transaction::coinbase(vec![5; 20], b"relay".to_vec(), 10)
    }

    #[tokio::test]
    async fn test_channel_delivers_in_order() {
        let (broadcaster, mut receiver) = ChannelBroadcaster::channel();
        let first = sample();
        let second = Transaction::coinbase(vec![6; 20], b"relay 2".to_vec(), 10);

        broadcaster.broadcast(&first).unwrap();
        broadcaster.broadcast(&second).unwrap();

        assert_eq!(receiver.recv().await.unwrap().id, first.id);
        assert_eq!(receiver.recv().await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_closed_channel_reports_error() {
        let (broadcaster, receiver) = ChannelBroadcaster::channel();
        drop(receiver);

        let result = broadcaster.broadcast(&sample());
        assert!(matches!(result, Err(LedgerError::Broadcast(_))));
    }

    #[test]
    fn test_log_broadcaster() {
        assert!(LogBroadcaster.broadcast(&sample()).is_ok());
    }
}
