//! Per-user, per-transport table of live connections and send buffers.
//!
//! Every mutation runs under one short-lived lock so multi-table updates
//! (connection entries plus the derived connected-uids sets) are atomic.
//! Background tasks that race with newer connections of the same
//! `(uid, cid)` compare a `(channel, udt)` snapshot before acting, so a
//! stale grace-close can never clobber a fresh attach.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use chansock_protocol::constants::epoch_ms;
use chansock_protocol::Event;

use crate::adapter::ServerChannel;

/// The two underlying transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Ws,
    Ajax,
}

impl Transport {
    pub(crate) fn idx(self) -> usize {
        match self {
            Transport::Ws => 0,
            Transport::Ajax => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Ws => "ws",
            Transport::Ajax => "ajax",
        }
    }
}

/// What an attach expects the current channel to be.
pub enum Expect {
    /// Replace whatever is there (fresh connection).
    Any,
    /// Replace only this exact channel (`None` = a channel-less entry).
    Channel(Option<Arc<dyn ServerChannel>>),
}

/// Result of an attach.
pub struct AttachOutcome {
    /// The expectation matched and the entry was written.
    pub attached: bool,
    /// First-ever entry for this `(transport, uid, cid)`.
    pub init: bool,
    /// The uid had no entries under any transport before this attach.
    pub uidport_open: bool,
    /// The entry's udt after the attach (unchanged when not attached).
    pub udt: u64,
}

/// Result of a grace reap.
#[derive(Debug, Default)]
pub struct ReapOutcome {
    pub removed: bool,
    /// The uid's last entry (across both transports) went away.
    pub uidport_close: bool,
}

/// A `(channel, udt)` snapshot for staleness checks. Channels compare by
/// pointer identity.
pub struct ConnSnapshot {
    pub sch: Option<Arc<dyn ServerChannel>>,
    pub udt: u64,
}

impl ConnSnapshot {
    pub fn same_channel(&self, other: &Option<Arc<dyn ServerChannel>>) -> bool {
        same_sch(&self.sch, other)
    }
}

fn same_sch(a: &Option<Arc<dyn ServerChannel>>, b: &Option<Arc<dyn ServerChannel>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

struct ConnEntry {
    sch: Option<Arc<dyn ServerChannel>>,
    udt: u64,
}

/// Buffered events awaiting a flush, with the ids of the sends that put
/// them there. A scheduled flush only fires while its own id survives.
#[derive(Default)]
struct SendBuffer {
    events: Vec<Event>,
    pending: HashSet<Uuid>,
}

#[derive(Default)]
struct Inner {
    // Indexed by Transport::idx().
    conns: [HashMap<String, HashMap<String, ConnEntry>>; 2],
    bufs: [HashMap<String, SendBuffer>; 2],
}

impl Inner {
    fn uid_present(&self, uid: &str) -> bool {
        self.conns.iter().any(|m| m.get(uid).is_some_and(|c| !c.is_empty()))
    }
}

/// Connected-uids view derived from the registry. A uid counts as
/// connected while it has at least one entry, channel-less grace/repoll
/// windows included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectedUids {
    pub ws: HashSet<String>,
    pub ajax: HashSet<String>,
    pub any: HashSet<String>,
}

/// The connection registry.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks activity: `udt := now`, channel preserved. No-op without an
    /// entry.
    pub fn touch(&self, transport: Transport, uid: &str, cid: &str) {
        let mut inner = self.lock();
        if let Some(entry) = inner.conns[transport.idx()]
            .get_mut(uid)
            .and_then(|c| c.get_mut(cid))
        {
            entry.udt = epoch_ms();
        }
    }

    /// Installs `sch` for `(transport, uid, cid)` when `expect` matches
    /// the current channel, updating the udt.
    pub fn attach(
        &self,
        transport: Transport,
        uid: &str,
        cid: &str,
        expect: Expect,
        sch: Option<Arc<dyn ServerChannel>>,
    ) -> AttachOutcome {
        let mut inner = self.lock();
        let was_present = inner.uid_present(uid);
        let by_cid = inner.conns[transport.idx()].entry(uid.to_owned()).or_default();

        let (init, matched, prior_udt) = match by_cid.get(cid) {
            None => (true, matches!(expect, Expect::Any | Expect::Channel(None)), 0),
            Some(entry) => {
                let matched = match &expect {
                    Expect::Any => true,
                    Expect::Channel(want) => same_sch(&entry.sch, want),
                };
                (false, matched, entry.udt)
            }
        };

        if !matched {
            // A newer connection owns the slot; leave it alone.
            if by_cid.is_empty() {
                inner.conns[transport.idx()].remove(uid);
            }
            return AttachOutcome {
                attached: false,
                init: false,
                uidport_open: false,
                udt: prior_udt,
            };
        }

        let udt = epoch_ms();
        by_cid.insert(cid.to_owned(), ConnEntry { sch, udt });
        AttachOutcome {
            attached: true,
            init,
            uidport_open: !was_present,
            udt,
        }
    }

    /// Current `(channel, udt)` for an entry.
    pub fn snapshot(&self, transport: Transport, uid: &str, cid: &str) -> Option<ConnSnapshot> {
        let inner = self.lock();
        inner.conns[transport.idx()]
            .get(uid)
            .and_then(|c| c.get(cid))
            .map(|e| ConnSnapshot {
                sch: e.sch.clone(),
                udt: e.udt,
            })
    }

    /// Removes the entry iff it still matches the `(channel, udt)`
    /// snapshot taken when the grace timer was armed.
    pub fn reap(
        &self,
        transport: Transport,
        uid: &str,
        cid: &str,
        expect_sch: Option<Arc<dyn ServerChannel>>,
        expect_udt: u64,
    ) -> ReapOutcome {
        let mut inner = self.lock();
        let Some(by_cid) = inner.conns[transport.idx()].get_mut(uid) else {
            return ReapOutcome::default();
        };
        let Some(entry) = by_cid.get(cid) else {
            return ReapOutcome::default();
        };
        if entry.udt != expect_udt || !same_sch(&entry.sch, &expect_sch) {
            // Reconnected (or otherwise superseded) during the grace
            // window.
            return ReapOutcome::default();
        }

        by_cid.remove(cid);
        if by_cid.is_empty() {
            inner.conns[transport.idx()].remove(uid);
        }
        ReapOutcome {
            removed: true,
            uidport_close: !inner.uid_present(uid),
        }
    }

    /// Nils the channel of an Ajax entry after a successful long-poll
    /// send (the HTTP response is committed, a repoll will reattach). The
    /// udt is preserved so grace timers armed against it stay valid.
    pub fn clear_ajax_sch(&self, uid: &str, cid: &str, sch: &Arc<dyn ServerChannel>) {
        let mut inner = self.lock();
        if let Some(entry) = inner.conns[Transport::Ajax.idx()]
            .get_mut(uid)
            .and_then(|c| c.get_mut(cid))
        {
            if entry.sch.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, sch)) {
                entry.sch = None;
            }
        }
    }

    /// All `(cid, channel)` pairs currently registered under
    /// `(transport, uid)`.
    pub fn conns_for(
        &self,
        transport: Transport,
        uid: &str,
    ) -> Vec<(String, Option<Arc<dyn ServerChannel>>)> {
        let inner = self.lock();
        inner.conns[transport.idx()]
            .get(uid)
            .map(|by_cid| {
                by_cid
                    .iter()
                    .map(|(cid, e)| (cid.clone(), e.sch.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every live channel for a uid, across both transports.
    pub fn all_schs_for(&self, uid: &str) -> Vec<Arc<dyn ServerChannel>> {
        let inner = self.lock();
        inner
            .conns
            .iter()
            .filter_map(|m| m.get(uid))
            .flat_map(|by_cid| by_cid.values().filter_map(|e| e.sch.clone()))
            .collect()
    }

    /// Appends an event (tagged with its send's id) to the uid's buffer
    /// for one transport.
    pub fn buffer_append(&self, transport: Transport, uid: &str, event: Event, ev_uuid: Uuid) {
        let mut inner = self.lock();
        let buf = inner.bufs[transport.idx()].entry(uid.to_owned()).or_default();
        buf.events.push(event);
        buf.pending.insert(ev_uuid);
    }

    /// Takes the whole buffer entry iff `ev_uuid` is still pending in it.
    /// A `None` means an earlier flush already drained this send.
    pub fn buffer_take_if(
        &self,
        transport: Transport,
        uid: &str,
        ev_uuid: Uuid,
    ) -> Option<Vec<Event>> {
        let mut inner = self.lock();
        let bufs = &mut inner.bufs[transport.idx()];
        if !bufs.get(uid).is_some_and(|b| b.pending.contains(&ev_uuid)) {
            return None;
        }
        bufs.remove(uid).map(|b| b.events)
    }

    /// Unconditionally drains the uid's buffer for one transport. Used by
    /// the administrative close path, which flushes before closing.
    pub fn buffer_take_all(&self, transport: Transport, uid: &str) -> Option<Vec<Event>> {
        let mut inner = self.lock();
        inner.bufs[transport.idx()]
            .remove(uid)
            .map(|b| b.events)
            .filter(|events| !events.is_empty())
    }

    /// The derived connected-uids view.
    pub fn connected_uids(&self) -> ConnectedUids {
        let inner = self.lock();
        let collect = |t: Transport| -> HashSet<String> {
            inner.conns[t.idx()]
                .iter()
                .filter(|(_, c)| !c.is_empty())
                .map(|(uid, _)| uid.clone())
                .collect()
        };
        let ws = collect(Transport::Ws);
        let ajax = collect(Transport::Ajax);
        let any = ws.union(&ajax).cloned().collect();
        ConnectedUids { ws, ajax, any }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
