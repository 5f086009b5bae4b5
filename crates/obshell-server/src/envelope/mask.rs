// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Masking of sensitive fields before a body is logged.

use serde_json::Value;

const MASK: &str = "******";

/// Keys whose values never reach a log line.
pub const MASKED_FIELDS: &[&str] = &[
    "password",
    "new_password",
    "old_password",
    "token",
    "root_password",
    "tenant_password",
    "proxy_password",
    "master_password",
    "target_agent_password",
    "passphrase",
    "encryption",
    "decryption",
    "context",
    "secret_key",
    "archive_base_uri",
    "data_base_uri",
    "backup_base_uri",
    "log_archive_uri",
    "restore_uri",
];

/// Replace every masked field of `value`, at any depth.
pub fn mask(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                if MASKED_FIELDS.contains(&key.as_str()) {
                    *field = Value::from(MASK);
                } else {
                    mask(field);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask),
        _ => {}
    }
}

/// A loggable rendering of a JSON body. Bodies that are not JSON are
/// summarised by length only.
pub fn masked_body(raw: &[u8]) -> String {
    match serde_json::from_slice::<Value>(raw) {
        Ok(mut value) => {
            mask(&mut value);
            value.to_string()
        }
        Err(_) => format!("<{} bytes>", raw.len()),
    }
}
