//! JSON export and import of the configuration
//!
//! ```json
//! {
//!   "magic": "0x4e564346",
//!   "version": "0.2.0",
//!   "config": {
//!     "0x6f10": { "type": 1, "type_name": "STRING", "length": 5, "data": "hello" }
//!   }
//! }
//! ```
//!
//! Scalars are JSON numbers, strings are JSON strings and binary values are
//! lowercase hex.

use log::{debug, warn};
use serde_json::{json, Map, Number, Value};

use crate::error::{StoreError, StoreResult};
use crate::format::CONFIG_MAGIC;
use crate::param::{ParamKey, ParamKind};
use crate::store::{ConfigBackend, ConfigStore};

/// JSON value of the raw bytes of a parameter; `null` when the length does
/// not fit the kind.
pub fn render(kind: ParamKind, bytes: &[u8]) -> Value {
    fn le<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
        bytes.try_into().ok()
    }

    let value = match kind {
        ParamKind::String => Some(Value::String(String::from_utf8_lossy(bytes).into_owned())),
        ParamKind::Binary => Some(Value::String(to_hex(bytes))),
        ParamKind::Byte => le::<1>(bytes).map(|b| json!(b[0])),
        ParamKind::Word => le(bytes).map(|b| json!(u16::from_le_bytes(b))),
        ParamKind::Dword => le(bytes).map(|b| json!(u32::from_le_bytes(b))),
        ParamKind::Qword => le(bytes).map(|b| json!(u64::from_le_bytes(b))),
        ParamKind::Int8 => le(bytes).map(|b| json!(i8::from_le_bytes(b))),
        ParamKind::Int16 => le(bytes).map(|b| json!(i16::from_le_bytes(b))),
        ParamKind::Int32 => le(bytes).map(|b| json!(i32::from_le_bytes(b))),
        ParamKind::Int64 => le(bytes).map(|b| json!(i64::from_le_bytes(b))),
        ParamKind::Float => le(bytes)
            .and_then(|b| Number::from_f64(f32::from_le_bytes(b) as f64))
            .map(Value::Number),
        ParamKind::Double => le(bytes)
            .and_then(|b| Number::from_f64(f64::from_le_bytes(b)))
            .map(Value::Number),
    };
    value.unwrap_or(Value::Null)
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

fn parse_handle(key: &str) -> Option<u16> {
    let digits = key.strip_prefix("0x").or_else(|| key.strip_prefix("0X"))?;
    u16::from_str_radix(digits, 16).ok()
}

/// Raw bytes for `data` interpreted as `kind`
fn parse_data(kind: ParamKind, data: &Value) -> Result<Vec<u8>, String> {
    fn unsigned(data: &Value, max: u64) -> Result<u64, String> {
        let n = match data {
            Value::Bool(b) => *b as u64,
            _ => data.as_u64().ok_or_else(|| format!("{} is not an unsigned integer", data))?,
        };
        if n > max {
            return Err(format!("{} exceeds {}", n, max));
        }
        Ok(n)
    }

    fn signed(data: &Value, min: i64, max: i64) -> Result<i64, String> {
        let n = data.as_i64().ok_or_else(|| format!("{} is not an integer", data))?;
        if n < min || n > max {
            return Err(format!("{} outside {}..={}", n, min, max));
        }
        Ok(n)
    }

    let float = || data.as_f64().ok_or_else(|| format!("{} is not a number", data));

    Ok(match kind {
        ParamKind::String => data
            .as_str()
            .ok_or_else(|| format!("{} is not a string", data))?
            .as_bytes()
            .to_vec(),
        ParamKind::Binary => data
            .as_str()
            .and_then(from_hex)
            .ok_or_else(|| format!("{} is not a hex string", data))?,
        ParamKind::Byte => vec![unsigned(data, u8::MAX as u64)? as u8],
        ParamKind::Word => (unsigned(data, u16::MAX as u64)? as u16).to_le_bytes().to_vec(),
        ParamKind::Dword => (unsigned(data, u32::MAX as u64)? as u32).to_le_bytes().to_vec(),
        ParamKind::Qword => unsigned(data, u64::MAX)?.to_le_bytes().to_vec(),
        ParamKind::Int8 => {
            (signed(data, i8::MIN as i64, i8::MAX as i64)? as i8).to_le_bytes().to_vec()
        }
        ParamKind::Int16 => {
            (signed(data, i16::MIN as i64, i16::MAX as i64)? as i16).to_le_bytes().to_vec()
        }
        ParamKind::Int32 => {
            (signed(data, i32::MIN as i64, i32::MAX as i64)? as i32).to_le_bytes().to_vec()
        }
        ParamKind::Int64 => signed(data, i64::MIN, i64::MAX)?.to_le_bytes().to_vec(),
        ParamKind::Float => (float()? as f32).to_le_bytes().to_vec(),
        ParamKind::Double => float()?.to_le_bytes().to_vec(),
    })
}

fn parse_entry(key: &str, entry: &Value) -> Result<(ParamKey, Vec<u8>), String> {
    let handle = parse_handle(key).ok_or_else(|| format!("invalid handle {:?}", key))?;
    let tag = entry
        .get("type")
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("{}: missing type", key))?;
    let kind = u8::try_from(tag)
        .ok()
        .and_then(ParamKind::from_u8)
        .ok_or_else(|| format!("{}: unknown type {}", key, tag))?;
    let data = entry.get("data").ok_or_else(|| format!("{}: missing data", key))?;
    let bytes = parse_data(kind, data).map_err(|e| format!("{}: {}", key, e))?;
    if bytes.len() > u16::MAX as usize {
        return Err(format!("{}: {} bytes is too long", key, bytes.len()));
    }
    if let Some(length) = entry.get("length").and_then(Value::as_u64) {
        if length != bytes.len() as u64 {
            return Err(format!("{}: length {} but data has {} bytes", key, length, bytes.len()));
        }
    }
    Ok((ParamKey { kind, handle }, bytes))
}

impl<B: ConfigBackend> ConfigStore<B> {
    /// Every known parameter as a JSON document. Values are read from the
    /// backend as needed; unreadable ones are left out.
    pub fn export_json(&self, app_version: &str) -> StoreResult<Value> {
        let mut inner = self.lock()?;
        let mut config = Map::new();
        for idx in 0..inner.params.len() {
            let key = format!("0x{:04x}", inner.params[idx].handle());
            if let Err(e) = inner.materialize(idx) {
                warn!("export: skipping {}: {}", key, e);
                continue;
            }
            let param = &inner.params[idx];
            let Some(bytes) = param.value() else {
                continue;
            };
            if config.contains_key(&key) {
                warn!("export: {} already exported, skipping {}", key, param.kind());
                continue;
            }
            config.insert(
                key,
                json!({
                    "type": param.kind() as u8,
                    "type_name": param.kind().name(),
                    "length": bytes.len(),
                    "data": render(param.kind(), bytes),
                }),
            );
        }
        debug!("exported {} parameters", config.len());
        Ok(json!({
            "magic": format!("0x{:08x}", CONFIG_MAGIC),
            "version": app_version,
            "config": config,
        }))
    }

    /// Apply the parameters of an exported document.
    ///
    /// With `allow` set only the listed handles are imported. The whole
    /// document is validated before the first value changes. Returns the
    /// number of imported parameters; call `write()` to persist them.
    pub fn import_json(&self, doc: &Value, allow: Option<&[u16]>) -> StoreResult<usize> {
        let invalid = |reason: String| StoreError::InvalidImport { reason };

        if let Some(magic) = doc.get("magic") {
            let expected = format!("0x{:08x}", CONFIG_MAGIC);
            if magic.as_str().map(str::to_ascii_lowercase).as_deref() != Some(expected.as_str()) {
                return Err(invalid(format!("magic {} does not match {}", magic, expected)));
            }
        }
        let config = doc
            .get("config")
            .and_then(Value::as_object)
            .ok_or_else(|| invalid("missing config object".into()))?;

        let mut parsed = Vec::with_capacity(config.len());
        for (key, entry) in config {
            let (param, bytes) = parse_entry(key, entry).map_err(invalid)?;
            if allow.is_some_and(|handles| !handles.contains(&param.handle)) {
                debug!("import: 0x{:04x} not allowed", param.handle);
                continue;
            }
            parsed.push((param, bytes));
        }

        let mut inner = self.lock()?;
        for (param, bytes) in &parsed {
            let idx = inner.find_or_create(*param);
            inner.writable(idx, bytes.len())?.copy_from_slice(bytes);
        }
        debug!("imported {} parameters", parsed.len());
        Ok(parsed.len())
    }
}
