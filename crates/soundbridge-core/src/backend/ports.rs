//! Copy-on-write port table and the port engine surface
//!
//! The registry maps port names to locally owned wrappers. The realtime
//! thread looks ports up on every cycle, so the table is an immutable
//! snapshot behind an atomic reference: writers copy, mutate the copy and
//! publish it in one atomic store. Readers load the current snapshot and
//! never block; superseded tables are freed by the last in-flight reader.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use crate::backend::adapter::PatchbayBackend;
use crate::backend::BackendError;
use crate::server::api::{DataKind, LatencyRange, MidiEventInfo, PortFlags, PortRef};

/// Locally owned wrapper around a server-native port.
///
/// Identity is the server-native reference: the same name can map to a new
/// wrapper after the remote port was re-registered.
#[derive(Debug)]
pub struct PortHandle {
    name: String,
    kind: DataKind,
    flags: PortFlags,
    server_ref: PortRef,
    /// True if this process registered the port itself
    mine: bool,
}

impl PortHandle {
    /// Wrap a known server port. Backend code does this on registration and
    /// on slow-path lookups; connector implementations and tests may build
    /// wrappers directly.
    pub fn new(
        name: String,
        kind: DataKind,
        flags: PortFlags,
        server_ref: PortRef,
        mine: bool,
    ) -> Self {
        Self {
            name,
            kind,
            flags,
            server_ref,
            mine,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DataKind {
        self.kind
    }

    pub fn flags(&self) -> PortFlags {
        self.flags
    }

    pub fn server_ref(&self) -> PortRef {
        self.server_ref
    }

    pub fn is_mine(&self) -> bool {
        self.mine
    }

    /// Same underlying server port, regardless of wrapper instance
    pub fn same_port(&self, other: &PortHandle) -> bool {
        self.server_ref == other.server_ref
    }
}

type Table = HashMap<String, Arc<PortHandle>>;

/// Read-many/write-rare name-to-port table.
///
/// `lookup` is realtime-safe; `insert`/`remove` are control-path only.
pub struct PortRegistry {
    table: ArcSwap<Table>,
    writer: Mutex<()>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(Table::new()),
            writer: Mutex::new(()),
        }
    }

    /// Current wrapper for `name`, if any. Single atomic load plus hash
    /// lookup; safe on the realtime thread.
    pub fn lookup(&self, name: &str) -> Option<Arc<PortHandle>> {
        self.table.load().get(name).cloned()
    }

    /// Full current snapshot
    pub fn snapshot(&self) -> Arc<Table> {
        self.table.load_full()
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }

    /// Publish a new table containing `handle`.
    ///
    /// Replacing an existing entry is a re-registration anomaly, logged but
    /// not an error.
    pub fn insert(&self, handle: Arc<PortHandle>) {
        let _writer = self.writer.lock().unwrap();
        let mut next: Table = (**self.table.load()).clone();
        if next
            .insert(handle.name().to_string(), Arc::clone(&handle))
            .is_some()
        {
            tracing::warn!(port = %handle.name(), "port re-registered, replacing stale entry");
        }
        self.table.store(Arc::new(next));
    }

    /// Publish a new table without `name`
    pub fn remove(&self, name: &str) -> Option<Arc<PortHandle>> {
        let _writer = self.writer.lock().unwrap();
        let mut next: Table = (**self.table.load()).clone();
        let removed = next.remove(name);
        if removed.is_some() {
            self.table.store(Arc::new(next));
        }
        removed
    }

    /// Drop every entry (used when the connection dies and the underlying
    /// references become invalid)
    pub fn clear(&self) {
        let _writer = self.writer.lock().unwrap();
        self.table.store(Arc::new(Table::new()));
    }

    /// Wait out any in-flight writer.
    ///
    /// Publication itself is a single atomic store, so once the writer lock
    /// is acquired every earlier mutation is visible. Old tables are
    /// reclaimed by reference count, never while a reader still holds them.
    pub fn flush(&self) {
        let _writer = self.writer.lock().unwrap();
    }
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/* ---- port engine surface of the backend ---- */

impl PatchbayBackend {
    /// Register a port under this client and track it in the registry
    pub fn register_port(
        &self,
        name: &str,
        kind: DataKind,
        flags: PortFlags,
    ) -> Result<Arc<PortHandle>, BackendError> {
        let api = self.api()?;
        let server_ref = api.register_port(name, kind, flags)?;
        let full_name = api
            .port_name(server_ref)
            .unwrap_or_else(|| name.to_string());

        let handle = Arc::new(PortHandle::new(full_name, kind, flags, server_ref, true));
        self.registry().insert(Arc::clone(&handle));
        Ok(handle)
    }

    /// Unregister one of our ports and forget it
    pub fn unregister_port(&self, port: &PortHandle) -> Result<(), BackendError> {
        let api = self.api()?;
        api.unregister_port(port.server_ref())?;
        self.registry().remove(port.name());
        Ok(())
    }

    /// Find a port by name.
    ///
    /// The registry answers on the fast path. On a miss the server is
    /// queried and the wrapper cached; that fallback allocates and must not
    /// run on the realtime thread.
    pub fn port_by_name(&self, name: &str) -> Option<Arc<PortHandle>> {
        if let Some(handle) = self.registry().lookup(name) {
            return Some(handle);
        }

        let api = self.api().ok()?;
        let server_ref = api.port_by_name(name)?;
        let kind = api.port_kind(server_ref)?;
        let flags = api.port_flags(server_ref)?;
        let handle = Arc::new(PortHandle::new(
            name.to_string(),
            kind,
            flags,
            server_ref,
            false,
        ));
        self.registry().insert(Arc::clone(&handle));
        Some(handle)
    }

    /// Connect two ports by name
    pub fn connect(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        let api = self.api()?;
        api.connect_ports(src, dst)?;
        Ok(())
    }

    /// Disconnect two ports by name
    pub fn disconnect(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        let api = self.api()?;
        api.disconnect_ports(src, dst)?;
        Ok(())
    }

    /// Break every connection of `port`
    pub fn disconnect_all(&self, port: &PortHandle) -> Result<(), BackendError> {
        let api = self.api()?;
        api.disconnect_all(port.server_ref())?;
        Ok(())
    }

    /// Names connected to `port`; empty while disconnected
    pub fn get_connections(&self, port: &PortHandle) -> Vec<String> {
        match self.api() {
            Ok(api) => api.port_connections(port.server_ref()),
            Err(_) => Vec::new(),
        }
    }

    /// True if `port` has a connection to a hardware terminal
    pub fn physically_connected(&self, port: &PortHandle) -> bool {
        match self.api() {
            Ok(api) => api.physically_connected(port.server_ref()),
            Err(_) => false,
        }
    }

    /// Names of server ports matching the filters; empty while disconnected
    pub fn get_ports(
        &self,
        pattern: Option<&str>,
        kind: Option<DataKind>,
        flags: PortFlags,
    ) -> Vec<String> {
        match self.api() {
            Ok(api) => api.list_ports(pattern, kind, flags),
            Err(_) => Vec::new(),
        }
    }

    /// Audio buffer of `port` for the current cycle.
    ///
    /// Only meaningful from the process callback. The slice is valid for
    /// this cycle; callers must not request the same port twice within one
    /// cycle.
    pub fn audio_buffer<'a>(
        &'a self,
        port: &PortHandle,
        nframes: u32,
    ) -> Option<&'a mut [f32]> {
        let api = self.api().ok()?;
        let ptr = api.audio_buffer(port.server_ref(), nframes)?;
        // The server guarantees nframes samples for the duration of the
        // cycle; exclusivity is the caller's side of the contract above.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), nframes as usize) })
    }

    pub fn latency_range(&self, port: &PortHandle, playback: bool) -> LatencyRange {
        match self.api() {
            Ok(api) => api.port_latency_range(port.server_ref(), playback),
            Err(_) => LatencyRange::default(),
        }
    }

    pub fn set_latency_range(&self, port: &PortHandle, playback: bool, range: LatencyRange) {
        if let Ok(api) = self.api() {
            api.set_port_latency_range(port.server_ref(), playback, range);
        }
    }

    /// Number of MIDI events in `port`'s buffer this cycle
    pub fn midi_event_count(&self, port: &PortHandle) -> u32 {
        match self.api() {
            Ok(api) => api.midi_event_count(port.server_ref()),
            Err(_) => 0,
        }
    }

    /// Copy MIDI event `index` into `out`; returns its time and true size
    pub fn midi_event_get(
        &self,
        port: &PortHandle,
        index: u32,
        out: &mut [u8],
    ) -> Option<MidiEventInfo> {
        let api = self.api().ok()?;
        api.midi_event(port.server_ref(), index, out)
    }

    /// Append a MIDI event to `port`'s buffer
    pub fn midi_event_put(
        &self,
        port: &PortHandle,
        time: u32,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let api = self.api()?;
        api.midi_put(port.server_ref(), time, data)?;
        Ok(())
    }

    /// Drop every MIDI event queued on `port`
    pub fn midi_clear(&self, port: &PortHandle) {
        if let Ok(api) = self.api() {
            api.midi_clear(port.server_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: &str, id: u64) -> Arc<PortHandle> {
        Arc::new(PortHandle::new(
            name.to_string(),
            DataKind::Audio,
            PortFlags::output(),
            PortRef(id),
            true,
        ))
    }

    #[test]
    fn lookup_sees_published_entries() {
        let registry = PortRegistry::new();
        assert!(registry.lookup("a").is_none());

        registry.insert(handle("a", 1));
        assert_eq!(registry.lookup("a").unwrap().server_ref(), PortRef(1));
        assert_eq!(registry.len(), 1);

        registry.remove("a");
        assert!(registry.lookup("a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn insert_replaces_on_reregistration() {
        let registry = PortRegistry::new();
        registry.insert(handle("a", 1));
        registry.insert(handle("a", 2));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("a").unwrap().server_ref(), PortRef(2));
    }

    #[test]
    fn identity_is_server_ref_not_wrapper() {
        let first = handle("a", 7);
        let second = handle("a", 7);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.same_port(&second));
    }

    #[test]
    fn old_snapshots_stay_intact() {
        let registry = PortRegistry::new();
        registry.insert(handle("a", 1));

        let before = registry.snapshot();
        registry.insert(handle("b", 2));
        let after = registry.snapshot();

        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 2);
        assert!(before.contains_key("a"));
        assert!(!before.contains_key("b"));
    }

    #[test]
    fn clear_publishes_empty_table() {
        let registry = PortRegistry::new();
        registry.insert(handle("a", 1));
        registry.insert(handle("b", 2));
        registry.clear();
        assert!(registry.is_empty());
    }
}
