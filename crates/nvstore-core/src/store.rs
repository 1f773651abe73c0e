//! Configuration store: typed parameters over a persistent backend
//!
//! The store keeps an ordered list of parameter descriptors. `read()` loads
//! only the table; values are pulled from the backend the first time they
//! are accessed. `write()` serializes the whole list back in one locked pass.
//!
//! **Locking**: every public call holds the store mutex for its whole
//! duration, including multi-step backend sequences. The guards returned by
//! `get_writeable` keep holding it until they are dropped.
//!
//! **Dirty tracking**: a descriptor is dirty when it is writable and its
//! bytes differ from what the backend holds. Nothing dirty means `write()`
//! does not touch the medium at all.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::format::{ConfigHeader, ParamHeader};
use crate::param::{ParamDescriptor, ParamKey, ParamKind, Persist};

/// Header and table found on the medium, with each payload's offset
#[derive(Debug, Clone)]
pub struct StoredTable {
    pub header: ConfigHeader,
    pub params: Vec<(ParamHeader, usize)>,
}

/// Persistence strategy behind a `ConfigStore`
pub trait ConfigBackend: Send {
    /// Human readable medium name for logs
    fn name(&self) -> &'static str;

    /// Read and validate the stored header and table.
    fn load(&mut self) -> StoreResult<StoredTable>;

    /// Stored header if it carries the magic; the CRC is not checked.
    fn read_header(&mut self) -> StoreResult<Option<ConfigHeader>>;

    /// Stored bytes of one parameter, without the string terminator
    fn read_value(&mut self, param: &ParamDescriptor) -> StoreResult<Vec<u8>>;

    /// Persist a new image of `params` tagged with `version`
    fn store(&mut self, params: &[ParamDescriptor], version: u32) -> StoreResult<()>;

    /// Wipe the stored configuration
    fn erase(&mut self) -> StoreResult<()>;

    /// Give up cached handles while the store is idle
    fn release(&mut self) {}
}

/// Descriptors that take part in the next image: stored ones and those
/// holding a pending value.
pub(crate) fn persisted(params: &[ParamDescriptor]) -> impl Iterator<Item = &ParamDescriptor> {
    params.iter().filter(|d| d.is_stored() || d.pending().is_some())
}

/// Selects the parameters listed by `ConfigStore::dump`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFilter {
    All,
    Dirty,
    Handle(u16),
}

pub(crate) struct Inner<B> {
    pub(crate) backend: B,
    pub(crate) params: Vec<ParamDescriptor>,
    index: HashMap<ParamKey, usize>,
    header: Option<ConfigHeader>,
    last_read_access: Option<Instant>,
}

impl<B: ConfigBackend> Inner<B> {
    pub(crate) fn find(&self, key: ParamKey) -> Option<usize> {
        self.index.get(&key).copied()
    }

    pub(crate) fn find_or_create(&mut self, key: ParamKey) -> usize {
        if let Some(idx) = self.find(key) {
            return idx;
        }
        debug!("new parameter {} 0x{:04x}", key.kind, key.handle);
        self.params.push(ParamDescriptor::fresh(key));
        let idx = self.params.len() - 1;
        self.index.insert(key, idx);
        idx
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .params
            .iter()
            .enumerate()
            .map(|(i, d)| (d.key(), i))
            .collect();
    }

    /// Pull the stored value of `idx` into RAM if not already there
    pub(crate) fn materialize(&mut self, idx: usize) -> StoreResult<()> {
        let param = &self.params[idx];
        if param.is_materialized() || !param.is_stored() {
            return Ok(());
        }
        let bytes = self.backend.read_value(param)?;
        self.params[idx].materialize(&bytes)?;
        self.last_read_access = Some(Instant::now());
        Ok(())
    }

    /// Make `idx` writable with `len` bytes, keeping the stored prefix
    pub(crate) fn writable(&mut self, idx: usize, len: usize) -> StoreResult<&mut [u8]> {
        if len > u16::MAX as usize {
            return Err(StoreError::CapacityExceeded {
                required: len,
                capacity: u16::MAX as usize,
            });
        }
        self.materialize(idx)?;
        self.params[idx].make_writable(len)
    }

    fn reload(&mut self) -> StoreResult<()> {
        self.params.clear();
        self.index.clear();
        self.header = None;

        let table = self.backend.load()?;
        for (ph, offset) in table.params {
            let Some(kind) = ParamKind::from_u8(ph.kind) else {
                warn!("skipping parameter 0x{:04x} with unknown kind {}", ph.handle, ph.kind);
                continue;
            };
            let key = ParamKey { kind, handle: ph.handle };
            self.params.push(ParamDescriptor::stored(
                key,
                ph.length as usize,
                ph.stride as usize,
                offset,
            ));
        }
        self.rebuild_index();
        debug!(
            "{} configuration loaded version={} params={} length={}",
            self.backend.name(),
            table.header.version,
            self.params.len(),
            table.header.length
        );
        self.header = Some(table.header);
        Ok(())
    }

    fn write(&mut self) -> StoreResult<()> {
        let old = self.backend.read_header()?;
        let dirty = self.params.iter().filter(|d| d.is_dirty()).count();

        if old.is_some() && dirty == 0 {
            debug!("configuration unchanged, skipping write");
            return self.reload_after_write();
        }

        let version = old.map_or(1, |h| h.version.wrapping_add(1));
        self.backend.store(&self.params, version)?;
        info!(
            "{} configuration written version={} params={} dirty={}",
            self.backend.name(),
            version,
            persisted(&self.params).count(),
            dirty
        );
        self.reload_after_write()
    }

    fn reload_after_write(&mut self) -> StoreResult<()> {
        self.reload().map_err(|e| match e {
            StoreError::ValidationFailure { .. } => e,
            other => StoreError::ValidationFailure {
                reason: format!("reload after write failed: {}", other),
            },
        })
    }
}

/// Typed parameter store over a `ConfigBackend`
pub struct ConfigStore<B: ConfigBackend> {
    inner: Mutex<Inner<B>>,
    hot_handles: Vec<u16>,
    lock_timeout: Option<Duration>,
}

impl<B: ConfigBackend> ConfigStore<B> {
    /// Create an empty store; call `read()` to load the stored table.
    pub fn new(backend: B, config: &Config) -> Self {
        Self {
            inner: Mutex::new(Inner {
                backend,
                params: Vec::new(),
                index: HashMap::new(),
                header: None,
                last_read_access: None,
            }),
            hot_handles: config.hot_handles.clone(),
            lock_timeout: config.lock_timeout,
        }
    }

    pub(crate) fn lock(&self) -> StoreResult<MutexGuard<'_, Inner<B>>> {
        match self.lock_timeout {
            Some(waited) => self
                .inner
                .try_lock_for(waited)
                .ok_or(StoreError::LockTimeout { waited }),
            None => Ok(self.inner.lock()),
        }
    }

    /// Run `f` with exclusive access to the backend
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> StoreResult<R> {
        let mut inner = self.lock()?;
        Ok(f(&mut inner.backend))
    }

    /// Discard RAM state and load the parameter table from the backend.
    ///
    /// Values are not read until accessed. On failure the store is left
    /// empty and `false` is returned.
    pub fn read(&self) -> bool {
        let mut inner = match self.lock() {
            Ok(inner) => inner,
            Err(e) => {
                warn!("configuration read: {}", e);
                return false;
            }
        };
        match inner.reload() {
            Ok(()) => true,
            Err(e) => {
                warn!("configuration read failed: {} ({})", e, e.code());
                false
            }
        }
    }

    /// Persist all modifications.
    ///
    /// Nothing dirty and a valid stored header: the medium is not touched and
    /// the table is reloaded. Otherwise a new image with `version + 1` is
    /// written and read back.
    pub fn write(&self) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.write().map_err(|e| {
            warn!("configuration write failed: {} ({})", e, e.code());
            e
        })
    }

    /// Wipe the backend. The parameter list is kept.
    ///
    /// Descriptors lose their stored copy. Values held in RAM become pending
    /// so the next `write()` stores them; parameters never loaded have no
    /// value left and are not written again.
    pub fn erase(&self) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.backend.erase()?;
        for param in inner.params.iter_mut() {
            param.detach();
        }
        inner.header = None;
        info!(
            "{} configuration erased, {} of {} values kept in RAM",
            inner.backend.name(),
            inner.params.iter().filter(|d| d.is_materialized()).count(),
            inner.params.len()
        );
        Ok(())
    }

    /// Value of a fixed-size parameter; `T::default()` when absent or when
    /// the stored length does not match `T`.
    pub fn get<T: Persist + Default>(&self, handle: u16) -> T {
        let key = ParamKey { kind: T::KIND, handle };
        let Ok(mut inner) = self.lock() else {
            return T::default();
        };
        let Some(idx) = inner.find(key) else {
            return T::default();
        };
        if inner.params[idx].length() != T::SIZE {
            debug!(
                "parameter 0x{:04x} length {} does not match {}",
                handle,
                inner.params[idx].length(),
                T::SIZE
            );
            return T::default();
        }
        if let Err(e) = inner.materialize(idx) {
            warn!("reading parameter 0x{:04x} failed: {}", handle, e);
            return T::default();
        }
        match inner.params[idx].value() {
            Some(bytes) if bytes.len() == T::SIZE => T::decode(bytes),
            _ => T::default(),
        }
    }

    /// Mutable access to a fixed-size parameter, created if absent.
    ///
    /// The store stays locked while the guard lives; the value is written
    /// back into the descriptor when the guard drops.
    pub fn get_writeable<T: Persist>(&self, handle: u16) -> StoreResult<Writeable<'_, B, T>> {
        let key = ParamKey { kind: T::KIND, handle };
        let mut guard = self.lock()?;
        let index = guard.find_or_create(key);
        let value = T::decode(guard.writable(index, T::SIZE)?);
        Ok(Writeable { guard, index, value })
    }

    pub fn set<T: Persist>(&self, handle: u16, value: T) -> StoreResult<()> {
        let key = ParamKey { kind: T::KIND, handle };
        let mut inner = self.lock()?;
        let idx = inner.find_or_create(key);
        value.encode(inner.writable(idx, T::SIZE)?);
        Ok(())
    }

    pub fn exists<T: Persist>(&self, handle: u16) -> bool {
        self.contains(T::KIND, handle)
    }

    pub fn contains(&self, kind: ParamKind, handle: u16) -> bool {
        self.lock()
            .map(|inner| inner.find(ParamKey { kind, handle }).is_some())
            .unwrap_or(false)
    }

    pub fn get_bool(&self, handle: u16) -> bool {
        self.get::<bool>(handle)
    }

    pub fn set_bool(&self, handle: u16, value: bool) -> StoreResult<()> {
        self.set(handle, value)
    }

    /// String parameter, empty when absent
    pub fn get_string(&self, handle: u16) -> String {
        self.get_bytes(ParamKind::String, handle)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }

    pub fn set_string(&self, handle: u16, value: &str) -> StoreResult<()> {
        self.set_bytes(ParamKind::String, handle, value.as_bytes())
    }

    /// Store at most `max_len - 1` bytes of `value`, one byte being reserved
    /// for the terminator. Truncation stops at a character boundary.
    pub fn set_string_bounded(&self, handle: u16, value: &str, max_len: usize) -> StoreResult<()> {
        self.set_string(handle, bounded(value, max_len))
    }

    /// Editable copy of a string parameter, created empty if absent.
    ///
    /// On drop the string is cut to `max_len - 1` bytes like
    /// `set_string_bounded` and stored back into the parameter.
    pub fn get_writeable_string(&self, handle: u16, max_len: usize) -> StoreResult<WriteableString<'_, B>> {
        let key = ParamKey { kind: ParamKind::String, handle };
        let mut guard = self.lock()?;
        let index = guard.find_or_create(key);
        guard.materialize(index)?;
        let current = guard.params[index]
            .value()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();
        let value = bounded(&current, max_len).to_string();
        guard.writable(index, value.len())?.copy_from_slice(value.as_bytes());
        Ok(WriteableString { guard, index, value, max_len })
    }

    pub fn get_binary(&self, handle: u16) -> Option<Vec<u8>> {
        self.get_bytes(ParamKind::Binary, handle)
    }

    pub fn set_binary(&self, handle: u16, value: &[u8]) -> StoreResult<()> {
        self.set_bytes(ParamKind::Binary, handle, value)
    }

    /// Mutable view of a binary parameter resized to `len` bytes
    pub fn get_writeable_binary(&self, handle: u16, len: usize) -> StoreResult<WriteableBytes<'_, B>> {
        let key = ParamKey { kind: ParamKind::Binary, handle };
        let mut guard = self.lock()?;
        let index = guard.find_or_create(key);
        guard.writable(index, len)?;
        Ok(WriteableBytes { guard, index })
    }

    pub(crate) fn get_bytes(&self, kind: ParamKind, handle: u16) -> Option<Vec<u8>> {
        let mut inner = self.lock().ok()?;
        let idx = inner.find(ParamKey { kind, handle })?;
        if let Err(e) = inner.materialize(idx) {
            warn!("reading parameter 0x{:04x} failed: {}", handle, e);
            return None;
        }
        inner.params[idx].value().map(<[u8]>::to_vec)
    }

    pub(crate) fn set_bytes(&self, kind: ParamKind, handle: u16, value: &[u8]) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let idx = inner.find_or_create(ParamKey { kind, handle });
        inner.writable(idx, value.len())?.copy_from_slice(value);
        Ok(())
    }

    /// Any parameter modified and not yet written
    pub fn is_dirty(&self) -> bool {
        self.lock()
            .map(|inner| inner.params.iter().any(ParamDescriptor::is_dirty))
            .unwrap_or(false)
    }

    /// Free RAM copies of read-only and unmodified parameters.
    /// Modified parameters and hot handles keep their buffers.
    pub fn release(&self) {
        if let Ok(mut inner) = self.lock() {
            self.release_locked(&mut inner);
        }
    }

    fn release_locked(&self, inner: &mut Inner<B>) {
        let mut freed = 0;
        for param in inner.params.iter_mut() {
            if param.is_materialized()
                && !param.is_dirty()
                && !self.hot_handles.contains(&param.handle())
            {
                param.release();
                freed += 1;
            }
        }
        inner.backend.release();
        inner.last_read_access = None;
        debug!("released {} parameter buffers", freed);
    }

    /// `release()` if no value was read from the backend for `idle`
    pub fn release_if_idle(&self, idle: Duration) -> bool {
        let Ok(mut inner) = self.lock() else {
            return false;
        };
        match inner.last_read_access {
            Some(at) if at.elapsed() >= idle => {
                self.release_locked(&mut inner);
                true
            }
            _ => false,
        }
    }

    /// Time of the last value read from the backend
    pub fn last_read_access(&self) -> Option<Instant> {
        self.lock().ok().and_then(|inner| inner.last_read_access)
    }

    /// Drop every RAM buffer including modifications
    pub fn discard(&self) {
        let Ok(mut inner) = self.lock() else {
            return;
        };
        inner.params.retain(ParamDescriptor::is_stored);
        for param in inner.params.iter_mut() {
            param.release();
        }
        inner.rebuild_index();
        inner.last_read_access = None;
    }

    /// Forget all parameters; the backend is untouched
    pub fn clear(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.params.clear();
            inner.index.clear();
        }
    }

    /// Version of the stored configuration, 0 if nothing valid is stored
    pub fn version(&self) -> u32 {
        let Ok(mut inner) = self.lock() else {
            return 0;
        };
        match inner.backend.read_header() {
            Ok(Some(header)) => header.version,
            Ok(None) => 0,
            Err(e) => {
                warn!("reading configuration header failed: {}", e);
                0
            }
        }
    }

    /// Number of parameters known to the store
    pub fn item_count(&self) -> usize {
        self.lock().map(|inner| inner.params.len()).unwrap_or(0)
    }

    /// Sum of all parameter lengths
    pub fn item_size(&self) -> usize {
        self.lock()
            .map(|inner| inner.params.iter().map(ParamDescriptor::length).sum())
            .unwrap_or(0)
    }

    /// Write a listing of the stored header and the selected parameters.
    /// Returns the number of listed parameters.
    pub fn dump<W: fmt::Write>(&self, out: &mut W, filter: DumpFilter) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        match inner.header {
            Some(h) => {
                let _ = writeln!(
                    out,
                    "{} configuration version {} params {} length {}",
                    inner.backend.name(),
                    h.version,
                    h.param_count,
                    h.length
                );
            }
            None => {
                let _ = writeln!(out, "{} configuration not loaded", inner.backend.name());
            }
        }

        let mut listed = 0;
        for idx in 0..inner.params.len() {
            let param = &inner.params[idx];
            let selected = match filter {
                DumpFilter::All => true,
                DumpFilter::Dirty => param.is_dirty(),
                DumpFilter::Handle(h) => param.handle() == h,
            };
            if !selected {
                continue;
            }
            if let Err(e) = inner.materialize(idx) {
                warn!("dump: reading parameter 0x{:04x} failed: {}", inner.params[idx].handle(), e);
            }
            let param = &inner.params[idx];
            let value = param
                .value()
                .map(|bytes| crate::export::render(param.kind(), bytes))
                .unwrap_or(serde_json::Value::Null);
            let _ = writeln!(
                out,
                "0x{:04x} {:<6} len={:<4}{}{} {}",
                param.handle(),
                param.kind(),
                param.length(),
                if param.is_writable() { " writable" } else { "" },
                if param.is_dirty() { " dirty" } else { "" },
                value
            );
            listed += 1;
        }
        Ok(listed)
    }
}

/// Write-back guard for a fixed-size parameter
pub struct Writeable<'a, B: ConfigBackend, T: Persist> {
    guard: MutexGuard<'a, Inner<B>>,
    index: usize,
    value: T,
}

impl<B: ConfigBackend, T: Persist> Deref for Writeable<'_, B, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<B: ConfigBackend, T: Persist> DerefMut for Writeable<'_, B, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<B: ConfigBackend, T: Persist> Drop for Writeable<'_, B, T> {
    fn drop(&mut self) {
        if let Some(buf) = self.guard.params[self.index].value_mut() {
            self.value.encode(buf);
        }
    }
}

/// Longest prefix of `value` that fits `max_len` with a terminator
fn bounded(value: &str, max_len: usize) -> &str {
    let mut end = value.len().min(max_len.saturating_sub(1));
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Write-back guard for a string parameter
pub struct WriteableString<'a, B: ConfigBackend> {
    guard: MutexGuard<'a, Inner<B>>,
    index: usize,
    value: String,
    max_len: usize,
}

impl<B: ConfigBackend> Deref for WriteableString<'_, B> {
    type Target = String;

    fn deref(&self) -> &String {
        &self.value
    }
}

impl<B: ConfigBackend> DerefMut for WriteableString<'_, B> {
    fn deref_mut(&mut self) -> &mut String {
        &mut self.value
    }
}

impl<B: ConfigBackend> Drop for WriteableString<'_, B> {
    fn drop(&mut self) {
        let handle = self.guard.params[self.index].handle();
        let value = bounded(&self.value, self.max_len);
        match self.guard.writable(self.index, value.len()) {
            Ok(buf) => buf.copy_from_slice(value.as_bytes()),
            Err(e) => warn!("string parameter 0x{:04x} not stored: {}", handle, e),
        }
    }
}

/// In-place view of a binary parameter
pub struct WriteableBytes<'a, B: ConfigBackend> {
    guard: MutexGuard<'a, Inner<B>>,
    index: usize,
}

impl<B: ConfigBackend> Deref for WriteableBytes<'_, B> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.params[self.index].value().unwrap_or(&[])
    }
}

impl<B: ConfigBackend> DerefMut for WriteableBytes<'_, B> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.guard.params[self.index].value_mut().unwrap_or(&mut [])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemFlash;
    use crate::flash::FlashConfigStore;

    const NAME: u16 = 0x6f10;
    const COUNT: u16 = 0x0200;
    const KEY: u16 = 0x0201;

    fn store_with(config: Config) -> FlashConfigStore<MemFlash> {
        FlashConfigStore::with_flash(MemFlash::from_config(&config), &config)
    }

    fn store() -> FlashConfigStore<MemFlash> {
        store_with(Config::host())
    }

    fn materialized<B: ConfigBackend>(s: &ConfigStore<B>, kind: ParamKind, handle: u16) -> bool {
        let inner = s.lock().unwrap();
        let idx = inner.find(ParamKey { kind, handle }).unwrap();
        inner.params[idx].is_materialized()
    }

    fn written() -> FlashConfigStore<MemFlash> {
        let s = store();
        s.set_string(NAME, "device").unwrap();
        s.set::<u32>(COUNT, 7).unwrap();
        s.write().unwrap();
        assert!(s.read());
        s
    }

    #[test]
    fn test_values_load_lazily() {
        let s = written();
        assert_eq!(s.item_count(), 2);
        assert!(!materialized(&s, ParamKind::Dword, COUNT));
        assert!(s.last_read_access().is_none());
        assert_eq!(s.get::<u32>(COUNT), 7);
        assert!(materialized(&s, ParamKind::Dword, COUNT));
        assert!(s.last_read_access().is_some());
    }

    #[test]
    fn test_kind_and_length_mismatch_give_default() {
        let s = store();
        s.set::<u32>(COUNT, 9).unwrap();
        assert_eq!(s.get::<u16>(COUNT), 0);
        assert!(!s.exists::<u16>(COUNT));
        assert!(s.exists::<u32>(COUNT));

        s.set_binary(KEY, &[1, 2, 3]).unwrap();
        assert_eq!(s.get::<[u8; 4]>(KEY), [0; 4]);
        assert_eq!(s.get::<[u8; 3]>(KEY), [1, 2, 3]);
    }

    #[test]
    fn test_writeable_guard_writes_back() {
        let s = written();
        {
            let mut count = s.get_writeable::<u32>(COUNT).unwrap();
            assert_eq!(*count, 7);
            *count += 5;
        }
        assert_eq!(s.get::<u32>(COUNT), 12);
        assert!(s.is_dirty());

        {
            let mut bytes = s.get_writeable_binary(KEY, 4).unwrap();
            assert_eq!(&*bytes, &[0, 0, 0, 0]);
            bytes[1] = 0xAB;
        }
        assert_eq!(s.get_binary(KEY), Some(vec![0, 0xAB, 0, 0]));
    }

    #[test]
    fn test_setting_same_value_is_not_dirty() {
        let s = written();
        s.set::<u32>(COUNT, 7).unwrap();
        s.set_string(NAME, "device").unwrap();
        assert!(!s.is_dirty());
        s.set::<u32>(COUNT, 8).unwrap();
        assert!(s.is_dirty());
    }

    #[test]
    fn test_change_with_equal_crc_is_written() {
        // both values share a CRC32C
        let a = 0x9f3c_d6b8_37fa_ac9au64;
        let b = 0x0e34_3b3c_0f87_1528u64;
        let s = store();
        s.set::<u64>(KEY, a).unwrap();
        s.write().unwrap();
        assert!(s.read());

        s.set::<u64>(KEY, b).unwrap();
        assert!(s.is_dirty());
        s.write().unwrap();
        assert!(s.read());
        assert_eq!(s.get::<u64>(KEY), b);
        assert_eq!(s.version(), 2);
    }

    #[test]
    fn test_erase_keeps_only_loaded_values() {
        let s = written();
        assert_eq!(s.get::<u32>(COUNT), 7);
        s.erase().unwrap();
        assert_eq!(s.version(), 0);
        assert_eq!(s.item_count(), 2);
        assert!(s.contains(ParamKind::String, NAME));
        assert!(s.is_dirty());

        s.write().unwrap();
        assert!(s.read());
        assert_eq!(s.version(), 1);
        assert_eq!(s.item_count(), 1);
        assert_eq!(s.get::<u32>(COUNT), 7);
        assert!(!s.contains(ParamKind::String, NAME));
    }

    #[test]
    fn test_writeable_string_bounded_on_drop() {
        let s = written();
        {
            let mut name = s.get_writeable_string(NAME, 9).unwrap();
            assert_eq!(name.as_str(), "device");
            name.push_str("-01-extra");
        }
        assert_eq!(s.get_string(NAME), "device-0");
        assert!(s.is_dirty());

        {
            let name = s.get_writeable_string(NAME, 4).unwrap();
            assert_eq!(name.as_str(), "dev");
        }
        assert_eq!(s.get_string(NAME), "dev");

        {
            let mut fresh = s.get_writeable_string(0x7000, 16).unwrap();
            assert!(fresh.is_empty());
            fresh.push_str("h\u{e9}");
        }
        assert_eq!(s.get_string(0x7000), "h\u{e9}");
    }

    #[test]
    fn test_string_bounded_truncates_on_char_boundary() {
        let s = store();
        s.set_string_bounded(NAME, "abcdef", 4).unwrap();
        assert_eq!(s.get_string(NAME), "abc");
        s.set_string_bounded(NAME, "h\u{e9}llo", 3).unwrap();
        assert_eq!(s.get_string(NAME), "h");
        s.set_string_bounded(NAME, "x", 0).unwrap();
        assert_eq!(s.get_string(NAME), "");
    }

    #[test]
    fn test_oversized_value_rejected() {
        let s = store();
        let big = vec![0u8; u16::MAX as usize + 1];
        let err = s.set_binary(KEY, &big).unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded { .. }));
    }

    #[test]
    fn test_release_keeps_dirty_and_hot_handles() {
        let s = written();
        s.get_string(NAME);
        s.get::<u32>(COUNT);
        s.set_binary(KEY, &[1]).unwrap();

        s.release();
        assert!(materialized(&s, ParamKind::String, NAME));
        assert!(!materialized(&s, ParamKind::Dword, COUNT));
        assert!(materialized(&s, ParamKind::Binary, KEY));
        assert!(s.last_read_access().is_none());
        // released values are read again on demand
        assert_eq!(s.get::<u32>(COUNT), 7);
    }

    #[test]
    fn test_release_if_idle() {
        let s = written();
        assert!(!s.release_if_idle(Duration::ZERO));
        s.get::<u32>(COUNT);
        assert!(!s.release_if_idle(Duration::from_secs(3600)));
        assert!(s.release_if_idle(Duration::ZERO));
        assert!(!materialized(&s, ParamKind::Dword, COUNT));
        assert!(s.last_read_access().is_none());
    }

    #[test]
    fn test_release_if_idle_gives_up_when_locked() {
        let s = store_with(Config::host().with_lock_timeout(Some(Duration::from_millis(20))));
        s.set::<u32>(COUNT, 1).unwrap();
        s.write().unwrap();
        assert!(s.read());
        s.get::<u32>(COUNT);

        let guard = s.get_writeable::<u32>(KEY).unwrap();
        assert!(!s.release_if_idle(Duration::ZERO));
        drop(guard);
        assert!(materialized(&s, ParamKind::Dword, COUNT));
        assert!(s.release_if_idle(Duration::ZERO));
    }

    #[test]
    fn test_discard_drops_modifications() {
        let s = written();
        s.set::<u32>(COUNT, 100).unwrap();
        s.set_binary(KEY, &[9]).unwrap();
        s.discard();
        assert!(!s.is_dirty());
        assert_eq!(s.item_count(), 2);
        assert!(s.get_binary(KEY).is_none());
        assert_eq!(s.get::<u32>(COUNT), 7);
    }

    #[test]
    fn test_clear_and_sizes() {
        let s = written();
        assert_eq!(s.item_size(), 6 + 4);
        s.clear();
        assert_eq!(s.item_count(), 0);
        assert_eq!(s.item_size(), 0);
        assert_eq!(s.version(), 1);
    }

    #[test]
    fn test_lock_timeout() {
        let s = store_with(Config::host().with_lock_timeout(Some(Duration::from_millis(20))));
        let guard = s.get_writeable::<u32>(COUNT).unwrap();
        let err = s.set::<u32>(KEY, 1).unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        assert!(!s.read());
        assert_eq!(s.get::<u32>(COUNT), 0);
        drop(guard);
        s.set::<u32>(KEY, 1).unwrap();
    }

    #[test]
    fn test_dump_listing() {
        let s = written();
        s.set::<u32>(COUNT, 8).unwrap();

        let mut out = String::new();
        assert_eq!(s.dump(&mut out, DumpFilter::All).unwrap(), 2);
        assert!(out.starts_with("flash configuration version 1 params 2"));
        assert!(out.contains("0x6f10 STRING"));
        assert!(out.contains("\"device\""));

        let mut dirty = String::new();
        assert_eq!(s.dump(&mut dirty, DumpFilter::Dirty).unwrap(), 1);
        assert!(dirty.contains("0x0200 DWORD") && dirty.contains("dirty"));

        let mut one = String::new();
        assert_eq!(s.dump(&mut one, DumpFilter::Handle(0x9999)).unwrap(), 0);
    }
}
