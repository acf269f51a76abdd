// SPDX-License-Identifier: GPL-3.0-only

use arbiter_contracts::WakeNotifier;
use arbiter_types::SessionId;
use tokio::sync::mpsc;

use crate::interface::{ArbiterHandler, OBJECT_PATH};

/// Forwards wakes out of the broker task without blocking it
#[derive(Debug, Clone)]
pub struct SignalNotifier {
    sender: mpsc::UnboundedSender<SessionId>,
}

impl SignalNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionId>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl WakeNotifier for SignalNotifier {
    fn wake(&mut self, session: SessionId) {
        if self.sender.send(session).is_err() {
            tracing::debug!(%session, "Wake dropped; signal forwarder is gone");
        }
    }
}

/// Emits `CallbacksPending` for every wake, coalescing bursts per session
pub async fn forward_wakes(
    connection: zbus::Connection,
    mut receiver: mpsc::UnboundedReceiver<SessionId>,
) -> anyhow::Result<()> {
    let iface_ref = connection
        .object_server()
        .interface::<_, ArbiterHandler>(OBJECT_PATH)
        .await?;

    tokio::spawn(async move {
        let mut batch = Vec::new();
        while let Some(first) = receiver.recv().await {
            batch.clear();
            batch.push(first);
            while let Ok(next) = receiver.try_recv() {
                if !batch.contains(&next) {
                    batch.push(next);
                }
            }

            for session in &batch {
                if let Err(e) =
                    ArbiterHandler::callbacks_pending(iface_ref.signal_emitter(), session.as_u64())
                        .await
                {
                    tracing::error!("Failed to emit callbacks_pending for {session}: {e}");
                }
            }
        }
    });

    Ok(())
}
