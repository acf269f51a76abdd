// SPDX-License-Identifier: GPL-3.0-only

//! Which bus connection owns which session
//!
//! Sessions die with the connection that created them; the watcher releases
//! them when the bus reports the unique name gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use arbiter_types::SessionId;

use crate::runtime::BrokerHandle;

#[derive(Debug, Clone, Default)]
pub struct SessionOwners {
    owners: Arc<Mutex<HashMap<SessionId, String>>>,
}

impl SessionOwners {
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, String>> {
        self.owners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, session: SessionId, owner: &str) {
        self.lock().insert(session, owner.to_string());
    }

    pub fn is_owner(&self, session: SessionId, sender: &str) -> bool {
        self.lock()
            .get(&session)
            .is_some_and(|owner| owner == sender)
    }

    pub fn remove(&self, session: SessionId) {
        self.lock().remove(&session);
    }

    /// Forgets `session`; true only for the first caller
    pub fn take(&self, session: SessionId) -> bool {
        self.lock().remove(&session).is_some()
    }

    /// Forgets and returns every session created by `owner`
    pub fn take_owned_by(&self, owner: &str) -> Vec<SessionId> {
        let mut owners = self.lock();
        let mut sessions: Vec<SessionId> = owners
            .iter()
            .filter(|(_, name)| name.as_str() == owner)
            .map(|(session, _)| *session)
            .collect();
        sessions.sort();
        for session in &sessions {
            owners.remove(session);
        }
        sessions
    }
}

/// Releases sessions whose bus connection disappears
pub async fn watch_name_owners(
    connection: zbus::Connection,
    owners: SessionOwners,
    broker: BrokerHandle,
) -> anyhow::Result<()> {
    let bus = zbus::Proxy::new(
        &connection,
        "org.freedesktop.DBus",
        "/org/freedesktop/DBus",
        "org.freedesktop.DBus",
    )
    .await?;
    let mut changes = bus.receive_signal("NameOwnerChanged").await?;

    tokio::spawn(async move {
        use futures_util::StreamExt;

        while let Some(signal) = changes.next().await {
            let (name, _old_owner, new_owner) =
                match signal.body().deserialize::<(String, String, String)>() {
                    Ok(args) => args,
                    Err(e) => {
                        tracing::error!("Failed to parse NameOwnerChanged signal: {}", e);
                        continue;
                    }
                };

            if !name.starts_with(':') || !new_owner.is_empty() {
                continue;
            }

            for session in owners.take_owned_by(&name) {
                tracing::info!("Client {} vanished; releasing {}", name, session);
                match broker.call(move |broker| broker.release_session(session)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::debug!("Session {} already gone: {}", session, e),
                    Err(e) => {
                        tracing::error!("Cannot release {}: {}", session, e);
                        return;
                    }
                }
            }
        }
    });

    tracing::info!("Watching for vanished clients");
    Ok(())
}
