//! Transport plugins, contact transports and temporary secrets.

use std::collections::BTreeMap;

use driftnet_shared::{
    ContactId, ContactTransport, TemporarySecret, TransportConfig, TransportId,
    TransportProperties,
};

use crate::error::{DbError, Result};
use crate::event::Event;
use crate::locks::{LockDomain as D, LockMode as M};

use super::{map_not_found, SyncEngine};

impl SyncEngine {
    /// Register a transport plugin.  Returns false if already registered.
    pub fn add_transport(&self, t: &TransportId) -> Result<bool> {
        let added = {
            let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Transport, M::Write)]);
            self.with_txn(|txn| Ok(txn.add_transport(t)?))?
        };
        if added {
            tracing::info!(transport = %t, "transport added");
            self.events.emit(&Event::TransportAdded(t.clone()));
        }
        Ok(added)
    }

    /// Unregister a transport.  Its configuration, properties, contact
    /// transports and secrets go with it.
    pub fn remove_transport(&self, t: &TransportId) -> Result<()> {
        {
            let _scope = self.locks.acquire(&[(D::Transport, M::Write), (D::Window, M::Write)]);
            self.with_txn(|txn| {
                map_not_found(txn.remove_transport(t), || {
                    DbError::NoSuchTransport(t.clone())
                })
            })?;
        }
        tracing::info!(transport = %t, "transport removed");
        self.events.emit(&Event::TransportRemoved(t.clone()));
        Ok(())
    }

    pub fn get_transport_ids(&self) -> Result<Vec<TransportId>> {
        let _scope = self.locks.acquire(&[(D::Transport, M::Read)]);
        self.with_txn(|txn| Ok(txn.get_transport_ids()?))
    }

    pub fn get_transport_config(&self, t: &TransportId) -> Result<TransportConfig> {
        let _scope = self.locks.acquire(&[(D::Transport, M::Read)]);
        self.with_txn(|txn| {
            self.ensure_transport(txn, t)?;
            Ok(txn.get_config(t)?)
        })
    }

    /// Merge local-only configuration for the transport.
    pub fn merge_transport_config(&self, t: &TransportId, config: &TransportConfig) -> Result<()> {
        let _scope = self.locks.acquire(&[(D::Transport, M::Write)]);
        self.with_txn(|txn| {
            self.ensure_transport(txn, t)?;
            Ok(txn.merge_config(t, config)?)
        })
    }

    pub fn get_local_transport_properties(&self, t: &TransportId) -> Result<TransportProperties> {
        let _scope = self.locks.acquire(&[(D::Transport, M::Read)]);
        self.with_txn(|txn| {
            self.ensure_transport(txn, t)?;
            Ok(txn.get_local_properties(t)?)
        })
    }

    /// Merge advertised properties for the transport.  A real change makes
    /// a fresh transport update due to every contact.
    pub fn merge_local_transport_properties(
        &self,
        t: &TransportId,
        properties: &TransportProperties,
    ) -> Result<()> {
        {
            let _scope = self.locks.acquire(&[(D::Transport, M::Write)]);
            self.with_txn(|txn| {
                self.ensure_transport(txn, t)?;
                Ok(txn.merge_local_properties(t, properties)?)
            })?;
        }
        self.events.emit(&Event::LocalTransportsUpdated(t.clone()));
        Ok(())
    }

    /// Each contact's advertised properties for one of its transports.
    pub fn get_remote_transport_properties(
        &self,
        t: &TransportId,
    ) -> Result<BTreeMap<ContactId, TransportProperties>> {
        let _scope = self.locks.acquire(&[(D::Transport, M::Read)]);
        self.with_txn(|txn| Ok(txn.get_remote_properties(t)?))
    }

    // -----------------------------------------------------------------
    // Contact transports and secrets
    // -----------------------------------------------------------------

    /// Record that the contact is reachable over the transport.
    pub fn add_contact_transport(&self, ct: &ContactTransport) -> Result<()> {
        let _scope = self.locks.acquire(&[
            (D::Contact, M::Read),
            (D::Transport, M::Read),
            (D::Window, M::Write),
        ]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, ct.contact)?;
            self.ensure_transport(txn, &ct.transport)?;
            Ok(txn.add_contact_transport(ct)?)
        })
    }

    pub fn get_contact_transports(&self) -> Result<Vec<ContactTransport>> {
        let _scope = self.locks.acquire(&[(D::Contact, M::Read), (D::Window, M::Read)]);
        self.with_txn(|txn| Ok(txn.get_contact_transports()?))
    }

    /// Store fresh temporary secrets, retiring stale periods.
    pub fn add_secrets(&self, secrets: &[TemporarySecret]) -> Result<()> {
        let _scope = self.locks.acquire(&[(D::Window, M::Write)]);
        self.with_txn(|txn| Ok(txn.add_secrets(secrets)?))
    }

    pub fn get_secrets(&self) -> Result<Vec<TemporarySecret>> {
        let _scope = self.locks.acquire(&[(D::Window, M::Read)]);
        self.with_txn(|txn| Ok(txn.get_secrets()?))
    }

    /// Atomically take the next outgoing connection counter value for the
    /// secret, or `None` if no secret is stored for the period.  Touching
    /// a counter counts as contact activity.
    pub fn increment_connection_counter(
        &self,
        c: ContactId,
        t: &TransportId,
        period: i64,
    ) -> Result<Option<i64>> {
        let now = self.clock.now_ms();
        let _scope = self.locks.acquire(&[(D::Contact, M::Write), (D::Window, M::Write)]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            let counter = txn.increment_connection_counter(c, t, period)?;
            if counter.is_some() {
                txn.set_last_connected(c, now)?;
            }
            Ok(counter)
        })
    }

    /// Replace the replay-detection window for a secret after an incoming
    /// connection.
    pub fn set_connection_window(
        &self,
        c: ContactId,
        t: &TransportId,
        period: i64,
        centre: i64,
        bitmap: &[u8],
    ) -> Result<()> {
        let now = self.clock.now_ms();
        let _scope = self.locks.acquire(&[(D::Contact, M::Write), (D::Window, M::Write)]);
        self.with_txn(|txn| {
            self.ensure_contact(txn, c)?;
            txn.set_connection_window(c, t, period, centre, bitmap)?;
            txn.set_last_connected(c, now)?;
            Ok(())
        })
    }

    fn ensure_transport(&self, txn: &driftnet_store::Txn<'_>, t: &TransportId) -> Result<()> {
        if !txn.contains_transport(t)? {
            return Err(DbError::NoSuchTransport(t.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SyncConfig;

    use super::*;

    fn secret(c: ContactId, t: &TransportId, period: i64) -> TemporarySecret {
        TemporarySecret {
            contact: c,
            transport: t.clone(),
            period,
            secret: vec![0u8; 32],
            outgoing: 0,
            centre: 0,
            bitmap: vec![0; 4],
        }
    }

    #[test]
    fn transport_lifecycle() {
        let engine = SyncEngine::open_in_memory(SyncConfig::default()).unwrap();
        let t = TransportId::new("tcp");

        assert!(engine.add_transport(&t).unwrap());
        assert!(!engine.add_transport(&t).unwrap());
        assert_eq!(engine.get_transport_ids().unwrap(), vec![t.clone()]);

        engine
            .merge_transport_config(
                &t,
                &[("timeout".to_string(), "30".to_string())].into_iter().collect(),
            )
            .unwrap();
        assert_eq!(
            engine.get_transport_config(&t).unwrap().get("timeout"),
            Some(&"30".to_string())
        );

        engine.remove_transport(&t).unwrap();
        assert!(matches!(
            engine.remove_transport(&t),
            Err(DbError::NoSuchTransport(_))
        ));
        assert!(matches!(
            engine.get_transport_config(&t),
            Err(DbError::NoSuchTransport(_))
        ));
    }

    #[test]
    fn counters_and_windows_touch_last_connected() {
        let engine = SyncEngine::open_in_memory(SyncConfig::default()).unwrap();
        let c = engine.add_contact("alice").unwrap();
        let t = TransportId::new("tcp");
        engine.add_transport(&t).unwrap();
        engine
            .add_contact_transport(&ContactTransport {
                contact: c,
                transport: t.clone(),
                epoch: 0,
                alice: true,
            })
            .unwrap();
        engine.add_secrets(&[secret(c, &t, 1)]).unwrap();

        assert_eq!(
            engine.increment_connection_counter(c, &t, 1).unwrap(),
            Some(0)
        );
        assert_eq!(
            engine.increment_connection_counter(c, &t, 1).unwrap(),
            Some(1)
        );
        // Missing period: no counter, no activity recorded.
        assert_eq!(engine.increment_connection_counter(c, &t, 9).unwrap(), None);
        assert!(engine.get_contact(c).unwrap().last_connected > 0);

        engine.set_connection_window(c, &t, 1, 5, &[1, 2]).unwrap();
        let stored = engine.get_secrets().unwrap();
        assert_eq!(stored[0].centre, 5);
    }

    #[test]
    fn removing_a_contact_takes_its_secrets() {
        let engine = SyncEngine::open_in_memory(SyncConfig::default()).unwrap();
        let c = engine.add_contact("alice").unwrap();
        let t = TransportId::new("tcp");
        engine.add_transport(&t).unwrap();
        engine
            .add_contact_transport(&ContactTransport {
                contact: c,
                transport: t.clone(),
                epoch: 0,
                alice: false,
            })
            .unwrap();
        engine.add_secrets(&[secret(c, &t, 1)]).unwrap();
        assert_eq!(engine.get_secrets().unwrap().len(), 1);

        engine.remove_contact(c).unwrap();
        assert!(engine.get_secrets().unwrap().is_empty());
        assert!(engine.get_contact_transports().unwrap().is_empty());
    }
}
