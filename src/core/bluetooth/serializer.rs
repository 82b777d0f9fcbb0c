//! Per-device write serialization
//! Each connected device owns one FIFO drained by a dedicated task, so at most
//! one GATT write per device is in flight. A failed write never short-circuits
//! the writes queued behind it.

use std::future::Future;
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::core::bluetooth::disconnect::DisconnectHandler;
use crate::core::bluetooth::registry::ConnectionRegistry;
use crate::core::bluetooth::transport::{BleTransport, FailureClass, classify};
use crate::core::bluetooth::types::{DeviceId, DisconnectReason, WriteTask};
use crate::error::WriteError;

struct WriteJob {
    task: WriteTask,
    reply: oneshot::Sender<Result<(), WriteError>>,
}

/// Sending half of a device's write FIFO.
///
/// Dropping it lets the worker drain what is already queued and then exit.
pub(crate) struct WriteQueue {
    tx: mpsc::UnboundedSender<WriteJob>,
}

#[derive(Clone)]
pub struct WriteSerializer {
    registry: ConnectionRegistry,
    transport: Arc<dyn BleTransport>,
    disconnects: DisconnectHandler,
}

impl WriteSerializer {
    pub fn new(
        registry: ConnectionRegistry,
        transport: Arc<dyn BleTransport>,
        disconnects: DisconnectHandler,
    ) -> Self {
        Self {
            registry,
            transport,
            disconnects,
        }
    }

    /// Appends `task` to the device's queue.
    ///
    /// The task takes its place in the queue when this is called, not when the
    /// returned future is first polled. Dropping the future does not cancel the
    /// write.
    pub fn enqueue(
        &self,
        device: &DeviceId,
        task: WriteTask,
    ) -> impl Future<Output = Result<(), WriteError>> + Send + use<> {
        let (reply, outcome) = oneshot::channel();
        let job = WriteJob { task, reply };

        let queued = self.registry.with_write_queue(device, |slot, epoch| {
            let queue = slot.get_or_insert_with(|| self.spawn_worker(device.clone(), epoch));
            queue.tx.send(job).is_ok()
        });

        let device = device.clone();
        async move {
            match queued {
                None => Err(WriteError::NotConnected(device)),
                Some(false) => Err(WriteError::QueueClosed(device)),
                Some(true) => outcome
                    .await
                    .unwrap_or_else(|_| Err(WriteError::QueueClosed(device))),
            }
        }
    }

    fn spawn_worker(&self, device: DeviceId, epoch: u64) -> WriteQueue {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();
        let transport = self.transport.clone();
        let disconnects = self.disconnects.clone();

        tokio::spawn(async move {
            debug!("Write queue for {} started", device);
            while let Some(job) = rx.recv().await {
                let result = execute(transport.as_ref(), &disconnects, &device, epoch, &job.task).await;
                // The caller may have stopped waiting; the write still counted.
                let _ = job.reply.send(result);
            }
            debug!("Write queue for {} drained", device);
        });

        WriteQueue { tx }
    }
}

async fn execute(
    transport: &dyn BleTransport,
    disconnects: &DisconnectHandler,
    device: &DeviceId,
    epoch: u64,
    task: &WriteTask,
) -> Result<(), WriteError> {
    match transport
        .write_characteristic(device, task.target, &task.payload)
        .await
    {
        Ok(()) => {
            debug!(
                "Wrote {} bytes to {} after {:?} in queue",
                task.payload.len(),
                device,
                task.enqueued_at.elapsed()
            );
            Ok(())
        }
        Err(source) => match classify(&source) {
            FailureClass::LinkLost => {
                warn!("Write to {} failed, treating as disconnect: {}", device, source);
                disconnects.handle_disconnect_epoch(device, epoch, DisconnectReason::LinkLost);
                Err(WriteError::LinkLost {
                    device: device.clone(),
                    source,
                })
            }
            FailureClass::Transport => {
                warn!("Write to {} failed: {}", device, source);
                Err(WriteError::Transport {
                    device: device.clone(),
                    source,
                })
            }
        },
    }
}
