// SPDX-License-Identifier: GPL-3.0-only

//! The broker task
//!
//! One tokio task owns the `Broker`. D-Bus handlers, the device feed and the
//! stage engine talk to it through `BrokerHandle`, so every state change is
//! applied one message at a time.

use std::time::Instant;

use arbiter_broker::{Broker, DeviceEvent};
use arbiter_contracts::StageOutcome;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, ServiceError};

type BrokerCall = Box<dyn FnOnce(&mut Broker) + Send>;

pub enum BrokerMessage {
    Call(BrokerCall),
    Device(DeviceEvent),
    StageCompleted(StageOutcome),
}

#[derive(Clone)]
pub struct BrokerHandle {
    sender: mpsc::UnboundedSender<BrokerMessage>,
}

impl BrokerHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BrokerMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Runs `operation` on the broker task and waits for its result
    pub async fn call<T, F>(&self, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Broker) -> T + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(BrokerMessage::Call(Box::new(move |broker| {
                let _ = reply.send(operation(broker));
            })))
            .map_err(|_| ServiceError::BrokerStopped)?;

        response.await.map_err(|_| ServiceError::BrokerStopped)
    }

    pub fn device_event(&self, event: DeviceEvent) -> Result<()> {
        self.sender
            .send(BrokerMessage::Device(event))
            .map_err(|_| ServiceError::BrokerStopped)
    }

    pub fn stage_completed(&self, outcome: StageOutcome) -> Result<()> {
        self.sender
            .send(BrokerMessage::StageCompleted(outcome))
            .map_err(|_| ServiceError::BrokerStopped)
    }
}

/// Serves broker messages until every handle is dropped
pub async fn run(mut broker: Broker, mut receiver: mpsc::UnboundedReceiver<BrokerMessage>) {
    tracing::debug!("Broker task started");

    loop {
        let deadline = broker.next_deadline();

        tokio::select! {
            message = receiver.recv() => {
                let Some(message) = message else {
                    break;
                };
                match message {
                    BrokerMessage::Call(operation) => operation(&mut broker),
                    BrokerMessage::Device(event) => broker.device_event(event),
                    BrokerMessage::StageCompleted(outcome) => broker.stage_completed(outcome),
                }
            }
            _ = sleep_until(deadline) => {
                broker.on_timer();
            }
        }
    }

    tracing::info!("Broker task stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
