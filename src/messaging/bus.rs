//! The message bus.
//!
//! A FIFO queue consumed by the orchestrator thread. Senders hold a
//! cheap cloneable [`BusHandle`]; channel semantics give per-sender
//! ordering. High-priority synchronous dispatch from inside the
//! orchestrator process goes through
//! [`Orchestrator::dispatch_msg`](crate::orchestrator::Orchestrator::dispatch_msg)
//! instead of the queue.

use super::Message;
use crate::error::{Error, Result};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Sending side of the bus.
#[derive(Clone)]
pub struct BusHandle {
    tx: Sender<Message>,
}

impl BusHandle {
    /// Enqueue a message. Fails when the consumer is gone.
    pub fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::Fatal("message bus is closed".to_string()))
    }
}

/// Receiving side of the bus, owned by the orchestrator.
pub struct MessageBus {
    rx: Receiver<Message>,
    tx: Sender<Message>,
}

impl MessageBus {
    /// Create a bus and its first handle.
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Self { rx, tx }
    }

    /// A new sending handle.
    pub fn handle(&self) -> BusHandle {
        BusHandle {
            tx: self.tx.clone(),
        }
    }

    /// Block until the next message arrives.
    pub fn recv(&self) -> Result<Message> {
        self.rx
            .recv()
            .map_err(|_| Error::Fatal("message bus is closed".to_string()))
    }

    /// Wait up to `timeout` for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Fatal("message bus is closed".to_string()))
            }
        }
    }

    /// Drain without blocking.
    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;

    #[test]
    fn test_send_and_recv() {
        let bus = MessageBus::new();
        let handle = bus.handle();
        handle
            .send(Message::data("audit-1", vec![Data::domain("example.com")]))
            .unwrap();

        let msg = bus.recv().unwrap();
        assert_eq!(msg.audit_name(), Some("audit-1"));
    }

    #[test]
    fn test_per_sender_fifo_order() {
        let bus = MessageBus::new();
        let handle = bus.handle();
        for i in 0..5 {
            handle.send(Message::data(format!("audit-{i}"), vec![])).unwrap();
        }
        for i in 0..5 {
            let msg = bus.recv().unwrap();
            assert_eq!(msg.audit_name(), Some(format!("audit-{i}").as_str()));
        }
    }

    #[test]
    fn test_recv_timeout_on_empty_bus() {
        let bus = MessageBus::new();
        let got = bus.recv_timeout(Duration::from_millis(10)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_cross_thread_send() {
        let bus = MessageBus::new();
        let handle = bus.handle();
        let worker = std::thread::spawn(move || {
            handle.send(Message::stop(true)).unwrap();
        });
        worker.join().unwrap();
        let msg = bus.recv().unwrap();
        assert!(matches!(
            msg.payload(),
            super::super::Payload::Stop { finished: true }
        ));
    }
}
