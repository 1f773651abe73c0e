//! Process-wide store instances
//!
//! ```ignore
//! static CONFIG: Global<FlashConfigStore<MemFlash>> = Global::new();
//!
//! CONFIG.install(FlashConfigStore::with_flash(flash, &config));
//! if let Some(store) = CONFIG.instance() {
//!     store.read();
//! }
//! ```
//!
//! The stores already serialize every call through their own mutex, so the
//! slot only guards installation and teardown.

use std::sync::Arc;

use log::debug;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;

/// A lazily created slot holding at most one shared instance
pub struct Global<T> {
    slot: OnceCell<RwLock<Option<Arc<T>>>>,
}

impl<T> Global<T> {
    pub const fn new() -> Self {
        Self { slot: OnceCell::new() }
    }

    fn slot(&self) -> &RwLock<Option<Arc<T>>> {
        self.slot.get_or_init(|| RwLock::new(None))
    }

    /// Install `value`, replacing any previous instance. Holders of the old
    /// instance keep it alive until they drop it.
    pub fn install(&self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        let previous = self.slot().write().replace(Arc::clone(&value));
        if previous.is_some() {
            debug!("global instance replaced");
        }
        value
    }

    pub fn instance(&self) -> Option<Arc<T>> {
        self.slot.get()?.read().clone()
    }

    /// Remove the installed instance
    pub fn teardown(&self) -> Option<Arc<T>> {
        self.slot.get()?.write().take()
    }

    pub fn is_installed(&self) -> bool {
        self.slot.get().is_some_and(|slot| slot.read().is_some())
    }
}

impl<T> Default for Global<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemRetained;
    use crate::config::Config;
    use crate::retained::RetainedStore;

    static RETAINED: Global<RetainedStore<MemRetained>> = Global::new();

    #[test]
    fn test_install_instance_teardown() {
        assert!(!RETAINED.is_installed());
        assert!(RETAINED.instance().is_none());

        let config = Config::esp8266();
        let store = RETAINED.install(RetainedStore::new(MemRetained::from_config(&config), &config));
        assert!(RETAINED.is_installed());
        assert!(store.write(0x10, b"abc"));

        let shared = RETAINED.instance().unwrap();
        assert_eq!(shared.read_vec(0x10), Some(b"abc".to_vec()));

        let removed = RETAINED.teardown().unwrap();
        assert!(Arc::ptr_eq(&removed, &store));
        assert!(!RETAINED.is_installed());
        // existing handles stay usable
        assert_eq!(shared.read_vec(0x10), Some(b"abc".to_vec()));
    }

    #[test]
    fn test_install_replaces() {
        let global: Global<u32> = Global::default();
        assert!(global.teardown().is_none());
        global.install(1);
        let old = global.instance().unwrap();
        global.install(2);
        assert_eq!(*old, 1);
        assert_eq!(*global.instance().unwrap(), 2);
    }
}
