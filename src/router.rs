//! Response router: couples one outstanding control-point request to the next
//! inbound notification frame, per the "single outstanding request" contract.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};

use crate::error::DfuError;
use crate::transport::DfuTransport;
use crate::wire::{self, Request, ResponseBody};

/// Bounded single-item rendezvous between the transport's notification
/// handler and the router's `request` call. At most one slot is open at a
/// time; a notification that arrives with no open slot is discarded with a
/// warning rather than buffered, since the protocol never has more than one
/// request outstanding.
#[derive(Clone, Default)]
pub struct Rendezvous {
    slot: Arc<Mutex<Option<oneshot::Sender<Vec<u8>>>>>,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new slot, discarding any stale one left over from a previous
    /// (timed-out) request. Returns the receiver half to await.
    async fn register(&self) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        *self.slot.lock().await = Some(tx);
        rx
    }

    /// Invoked by the transport for every control-point notification. Fulfils
    /// the outstanding slot, if any.
    pub async fn fulfill(&self, bytes: Vec<u8>) {
        let mut slot = self.slot.lock().await;
        match slot.take() {
            Some(tx) => {
                // The waiter may already have timed out and dropped its
                // receiver; that's fine, there's nothing left to deliver to.
                let _ = tx.send(bytes);
            }
            None => {
                log::warn!("discarding control-point notification with no outstanding request");
            }
        }
    }
}

/// Issues control-point requests and matches each against the next inbound
/// notification, bounded by a timeout.
pub struct ControlPointRouter<T> {
    transport: Arc<T>,
    rendezvous: Rendezvous,
    timeout: Duration,
}

impl<T: DfuTransport> ControlPointRouter<T> {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6);

    /// Subscribes to the control-point characteristic and builds a router
    /// over it. Must happen before the first request is written: a
    /// notification arriving before the subscription is live is lost.
    pub async fn new(transport: Arc<T>, timeout: Duration) -> Result<Self, DfuError> {
        let rendezvous = Rendezvous::new();
        let handler_rendezvous = rendezvous.clone();
        transport
            .subscribe_control_point(Box::new(move |bytes| {
                let rendezvous = handler_rendezvous.clone();
                tokio::spawn(async move {
                    rendezvous.fulfill(bytes).await;
                });
            }))
            .await?;
        Ok(Self {
            transport,
            rendezvous,
            timeout,
        })
    }

    /// Write `request` to the control point and await its matching response.
    pub async fn request(&self, request: Request) -> Result<ResponseBody, DfuError> {
        let opcode = request.opcode();
        let rx = self.rendezvous.register().await;
        let encoded = request.encode();
        log::debug!("--> {:?} {:02X?}", opcode, encoded);
        self.transport.write_control_point(&encoded).await?;
        let raw = tokio::time::timeout(self.timeout, rx)
            .await
            .map_err(|_| DfuError::Timeout)?
            .map_err(|_| DfuError::Timeout)?;
        log::debug!("<-- {:02X?}", raw);
        wire::decode(&raw, opcode)
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}
