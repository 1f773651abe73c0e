//! Property tests: both stores against a plain map model.

use std::collections::BTreeMap;

use proptest::prelude::*;

use nvstore_core::{Config, FlashConfigStore, MemFlash, MemRetained, RetainedStore};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn retained_op() -> impl Strategy<Value = (u8, Vec<u8>)> {
    (1u8..=12, prop::collection::vec(any::<u8>(), 0..=24))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn retained_store_matches_model(
        esp8266 in any::<bool>(),
        ops in prop::collection::vec(retained_op(), 1..40),
    ) {
        init_logging();
        let config = if esp8266 { Config::esp8266() } else { Config::esp32() };
        let store = RetainedStore::new(MemRetained::from_config(&config), &config);
        let mut model: BTreeMap<u8, Vec<u8>> = BTreeMap::new();

        for (id, data) in ops {
            if store.write(id, &data) {
                if data.is_empty() {
                    model.remove(&id);
                } else {
                    model.insert(id, data);
                }
            }

            let mut stored = store.entries();
            stored.sort();
            let expected: Vec<(u8, Vec<u8>)> = model.clone().into_iter().collect();
            prop_assert_eq!(stored, expected);
            prop_assert!(store.used().unwrap_or(0) <= config.retained_region_size);
        }
    }

    #[test]
    fn flash_store_round_trips(
        words in prop::collection::btree_map(0u16..64, any::<u32>(), 0..24),
        names in prop::collection::btree_map(0x100u16..0x140, "[a-z]{0,40}", 0..8),
    ) {
        init_logging();
        let config = Config::host();
        let store = FlashConfigStore::with_flash(MemFlash::from_config(&config), &config);
        for (&handle, &value) in &words {
            store.set::<u32>(handle, value).unwrap();
        }
        for (&handle, name) in &names {
            store.set_string(handle, name).unwrap();
        }
        store.write().unwrap();

        let image = store.with_backend(|b| b.flash().clone()).unwrap();
        let reopened = FlashConfigStore::with_flash(image, &config);
        prop_assert!(reopened.read());
        prop_assert_eq!(reopened.item_count(), words.len() + names.len());
        for (&handle, &value) in &words {
            prop_assert_eq!(reopened.get::<u32>(handle), value);
        }
        for (&handle, name) in &names {
            prop_assert_eq!(&reopened.get_string(handle), name);
        }
    }
}
