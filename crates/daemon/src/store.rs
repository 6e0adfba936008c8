//! Single owner of the window order.
//!
//! Connection handlers never touch [`WindowOrder`] directly. They send a
//! [`DaemonEvent`] to the event loop, which applies store operations one at
//! a time, so a reconciliation can never interleave with another
//! reconciliation or a promotion.

use backtick_core_order::{ActivationMode, NewWindowPosition, WindowId, WindowOrder, WindowSnapshot};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Capacity of the event channel feeding the store owner.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Returned when the event loop has already stopped.
#[derive(Debug, Error)]
#[error("Helper is shutting down")]
pub struct StoreClosed;

/// Events that the daemon event loop processes.
#[derive(Debug)]
pub enum DaemonEvent {
    /// Merge a fresh window snapshot into the order.
    Reconcile {
        snapshot: Vec<WindowSnapshot>,
        position: NewWindowPosition,
        mode: ActivationMode,
        responder: oneshot::Sender<Vec<WindowSnapshot>>,
    },
    /// Move an activated window to the front.
    Promote {
        id: WindowId,
        responder: oneshot::Sender<()>,
    },
    /// Stop the event loop.
    Shutdown { reason: &'static str },
}

/// Cloneable handle used by connection handlers and signal tasks.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    event_tx: mpsc::Sender<DaemonEvent>,
}

impl StoreHandle {
    /// Create a handle and the receiver the event loop consumes.
    pub fn channel() -> (Self, mpsc::Receiver<DaemonEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { event_tx }, event_rx)
    }

    /// Reconcile a snapshot and return it in the updated order.
    pub async fn reconcile(
        &self,
        snapshot: Vec<WindowSnapshot>,
        position: NewWindowPosition,
        mode: ActivationMode,
    ) -> Result<Vec<WindowSnapshot>, StoreClosed> {
        let (responder, response) = oneshot::channel();
        self.event_tx
            .send(DaemonEvent::Reconcile {
                snapshot,
                position,
                mode,
                responder,
            })
            .await
            .map_err(|_| StoreClosed)?;
        response.await.map_err(|_| StoreClosed)
    }

    /// Promote a window to the front of the order.
    pub async fn promote(&self, id: WindowId) -> Result<(), StoreClosed> {
        let (responder, response) = oneshot::channel();
        self.event_tx
            .send(DaemonEvent::Promote { id, responder })
            .await
            .map_err(|_| StoreClosed)?;
        response.await.map_err(|_| StoreClosed)
    }

    /// Ask the event loop to stop.
    pub async fn shutdown(&self, reason: &'static str) {
        if self
            .event_tx
            .send(DaemonEvent::Shutdown { reason })
            .await
            .is_err()
        {
            debug!("Event loop already stopped ({})", reason);
        }
    }
}

/// Run the event loop until a shutdown event arrives or every handle is dropped.
///
/// Returns the final order.
pub async fn run_event_loop(
    mut event_rx: mpsc::Receiver<DaemonEvent>,
    mut order: WindowOrder,
) -> WindowOrder {
    while let Some(event) = event_rx.recv().await {
        match event {
            DaemonEvent::Reconcile {
                snapshot,
                position,
                mode,
                responder,
            } => {
                let before = order.len();
                let windows = order.reconcile(&snapshot, position, mode);
                debug!(
                    "Reconciled {} snapshot windows ({} -> {} tracked, position={}, mode={})",
                    snapshot.len(),
                    before,
                    order.len(),
                    position,
                    mode
                );
                if responder.send(windows).is_err() {
                    debug!("Client disconnected before receiving window list");
                }
            }
            DaemonEvent::Promote { id, responder } => {
                order.promote(id);
                debug!("Promoted window {} to the front", id);
                let _ = responder.send(());
            }
            DaemonEvent::Shutdown { reason } => {
                info!("Shutdown requested: {}", reason);
                break;
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn win(id: WindowId, active: bool) -> WindowSnapshot {
        WindowSnapshot::new(id, format!("w{}", id), active)
    }

    #[tokio::test]
    async fn test_reconcile_through_handle() {
        let (handle, rx) = StoreHandle::channel();
        let task = tokio::spawn(run_event_loop(rx, WindowOrder::new()));

        let windows = handle
            .reconcile(
                vec![win(1, false), win(2, true)],
                NewWindowPosition::Top,
                ActivationMode::Automatic,
            )
            .await
            .unwrap();
        assert_eq!(windows.iter().map(|w| w.id).collect::<Vec<_>>(), vec![2, 1]);

        handle.shutdown("test").await;
        let order = task.await.unwrap();
        assert_eq!(order.ids(), &[2, 1]);
    }

    #[tokio::test]
    async fn test_promote_through_handle() {
        let (handle, rx) = StoreHandle::channel();
        let task = tokio::spawn(run_event_loop(rx, WindowOrder::from_ids([1, 2, 3])));

        handle.promote(3).await.unwrap();
        handle.shutdown("test").await;

        let order = task.await.unwrap();
        assert_eq!(order.ids(), &[3, 1, 2]);
    }

    #[tokio::test]
    async fn test_concurrent_operations_keep_invariants() {
        let (handle, rx) = StoreHandle::channel();
        let task = tokio::spawn(run_event_loop(rx, WindowOrder::new()));

        let mut joins = Vec::new();
        for i in 0..32u64 {
            let handle = handle.clone();
            joins.push(tokio::spawn(async move {
                let snapshot: Vec<WindowSnapshot> =
                    (0..6).map(|id| win(id, id == i % 6)).collect();
                let mode = if i % 2 == 0 {
                    ActivationMode::Automatic
                } else {
                    ActivationMode::Manual
                };
                let windows = handle
                    .reconcile(snapshot, NewWindowPosition::Bottom, mode)
                    .await
                    .unwrap();
                assert_eq!(windows.len(), 6);
                handle.promote(i % 6).await.unwrap();
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        handle.shutdown("test").await;
        let order = task.await.unwrap();
        let mut ids = order.ids().to_vec();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_closed_store_reports_error() {
        let (handle, rx) = StoreHandle::channel();
        drop(rx);
        assert!(handle.promote(1).await.is_err());
        assert!(handle
            .reconcile(Vec::new(), NewWindowPosition::Top, ActivationMode::Manual)
            .await
            .is_err());
        // Shutdown on a closed store is a no-op
        handle.shutdown("test").await;
    }

    #[tokio::test]
    async fn test_loop_ends_when_all_handles_dropped() {
        let (handle, rx) = StoreHandle::channel();
        let task = tokio::spawn(run_event_loop(rx, WindowOrder::from_ids([4])));
        drop(handle);
        let order = task.await.unwrap();
        assert_eq!(order.ids(), &[4]);
    }
}
