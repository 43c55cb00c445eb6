//! Command Queue (base spec §4.E): per-transport FIFO of pending writes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::error::UnipiError;
use crate::registry::PendingCommand;

struct QueuedCommand {
    command: PendingCommand,
    completion: oneshot::Sender<Result<(), UnipiError>>,
    enqueued_at: Instant,
}

/// Resolves once the physical write completes (or fails after retry
/// exhaustion). Dropping the handle without awaiting it is fine — the
/// queue still executes the write, it just has nobody to notify.
pub struct CompletionHandle(oneshot::Receiver<Result<(), UnipiError>>);

impl CompletionHandle {
    pub async fn wait(self) -> Result<(), UnipiError> {
        self.0
            .await
            .unwrap_or_else(|_| Err(UnipiError::CommandTimeout {
                unit_id: 0,
                address: 0,
                elapsed: Duration::ZERO,
            }))
    }
}

/// FIFO of [`PendingCommand`]s for one transport. Same-address commands
/// not yet dequeued for execution are coalesced — the newest value wins,
/// while the command's position in FIFO order is preserved.
pub struct CommandQueue {
    transport_id: String,
    inner: Mutex<VecDeque<QueuedCommand>>,
}

impl CommandQueue {
    pub fn new(transport_id: impl Into<String>) -> Self {
        Self {
            transport_id: transport_id.into(),
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    /// Enqueue a write. Non-blocking: takes the queue's mutex briefly to
    /// append or coalesce, never waits on the transport itself.
    pub async fn submit(&self, command: PendingCommand) -> CompletionHandle {
        let (tx, rx) = oneshot::channel();
        let mut queue = self.inner.lock().await;

        if let Some(existing) = queue
            .iter_mut()
            .find(|q| q.command.unit_id == command.unit_id && q.command.address == command.address)
        {
            debug!(
                transport = %self.transport_id,
                unit_id = command.unit_id,
                address = command.address,
                "coalescing queued command, newest value wins"
            );
            existing.command = command;
            let old = std::mem::replace(&mut existing.completion, tx);
            // The superseded waiter learns its value never made it to the wire.
            let _ = old.send(Err(UnipiError::CommandTimeout {
                unit_id: existing.command.unit_id,
                address: existing.command.address,
                elapsed: Duration::ZERO,
            }));
        } else {
            queue.push_back(QueuedCommand {
                command,
                completion: tx,
                enqueued_at: Instant::now(),
            });
        }

        CompletionHandle(rx)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether the oldest queued command's deadline has passed, meaning it
    /// must be executed immediately rather than waiting its turn in the
    /// scan loop's read/write interleaving (base spec §4.D step 4).
    pub async fn front_deadline_passed(&self) -> bool {
        let queue = self.inner.lock().await;
        queue
            .front()
            .and_then(|q| q.command.deadline)
            .map(|d| Instant::now() >= d)
            .unwrap_or(false)
    }

    /// Take the next command for execution. The caller is responsible for
    /// resolving the returned completion sender once the write finishes.
    pub async fn pop_front(&self) -> Option<(PendingCommand, oneshot::Sender<Result<(), UnipiError>>)> {
        let mut queue = self.inner.lock().await;
        queue.pop_front().map(|q| (q.command, q.completion))
    }

    /// Flush every queued command immediately, used during graceful
    /// shutdown's 2s command-queue-flush budget.
    pub async fn drain(&self) -> Vec<(PendingCommand, oneshot::Sender<Result<(), UnipiError>>)> {
        let mut queue = self.inner.lock().await;
        queue.drain(..).map(|q| (q.command, q.completion)).collect()
    }
}


#[cfg(test)]
mod coalescing_property {
    use super::*;
    use crate::registry::{WriteKind, WriteValue};
    use proptest::prelude::*;

    proptest! {
        /// Rapidly submitting N distinct register values for the same
        /// address always leaves exactly one queued command behind, and it
        /// carries the last value submitted.
        #[test]
        fn n_writes_to_one_address_coalesce_to_one(values in prop::collection::vec(any::<u16>(), 1..32)) {
            tokio_test::block_on(async move {
                let queue = CommandQueue::new("neuron");
                let mut handles = Vec::new();
                for v in &values {
                    handles.push(queue.submit(PendingCommand {
                        transport_id: "neuron".to_string(),
                        unit_id: 0,
                        address: 10,
                        value: WriteValue::Register(*v),
                        kind: WriteKind::SetRegister,
                        deadline: None,
                    }).await);
                }

                prop_assert_eq!(queue.len().await, 1);
                let (popped, _tx) = queue.pop_front().await.unwrap();
                prop_assert!(matches!(popped.value, WriteValue::Register(v) if v == *values.last().unwrap()));
                Ok(())
            })?;
        }
    }
}
