//! State the worker task updates as side effects of reading the stream
//! (transaction status, `ParameterStatus` values, the server's numeric
//! version) but that the connection handle needs to read without going
//! through the request/response channel.
//!
//! Grounded on `sqlx-postgres::connection::worker::shared.rs`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures_channel::mpsc::UnboundedSender;

use crate::message::{NotificationResponse, TransactionStatus};

#[derive(Clone)]
pub struct Shared(Arc<Mutex<SharedInner>>);

struct SharedInner {
    transaction_status: TransactionStatus,
    parameter_statuses: BTreeMap<String, String>,
    server_version_num: Option<u32>,
    process_id: Option<u32>,
    secret_key: Option<u32>,
    notify_tx: Option<UnboundedSender<NotificationResponse>>,
}

impl Shared {
    pub fn new() -> Self {
        Shared(Arc::new(Mutex::new(SharedInner {
            transaction_status: TransactionStatus::default(),
            parameter_statuses: BTreeMap::new(),
            server_version_num: None,
            process_id: None,
            secret_key: None,
            notify_tx: None,
        })))
    }

    pub fn set_notify_sender(&self, tx: Option<UnboundedSender<NotificationResponse>>) {
        self.0.lock().unwrap().notify_tx = tx;
    }

    /// Forwards a `NotificationResponse` to whichever `PgListener` is
    /// currently attached, if any. Returns `true` if it was delivered.
    pub fn deliver_notification(&self, notification: NotificationResponse) -> bool {
        let inner = self.0.lock().unwrap();
        match &inner.notify_tx {
            Some(tx) => tx.unbounded_send(notification).is_ok(),
            None => false,
        }
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.0.lock().unwrap().transaction_status
    }

    pub fn set_transaction_status(&self, status: TransactionStatus) {
        self.0.lock().unwrap().transaction_status = status;
    }

    pub fn insert_parameter_status(&self, name: String, value: String) {
        let mut inner = self.0.lock().unwrap();
        if name == "server_version" {
            inner.server_version_num = parse_server_version(&value);
        }
        inner.parameter_statuses.insert(name, value);
    }

    pub fn parameter_status(&self, name: &str) -> Option<String> {
        self.0.lock().unwrap().parameter_statuses.get(name).cloned()
    }

    pub fn server_version_num(&self) -> Option<u32> {
        self.0.lock().unwrap().server_version_num
    }

    pub fn set_backend_key_data(&self, process_id: u32, secret_key: u32) {
        let mut inner = self.0.lock().unwrap();
        inner.process_id = Some(process_id);
        inner.secret_key = Some(secret_key);
    }

    pub fn backend_key_data(&self) -> Option<(u32, u32)> {
        let inner = self.0.lock().unwrap();
        Some((inner.process_id?, inner.secret_key?))
    }
}

impl Default for Shared {
    fn default() -> Self {
        Shared::new()
    }
}

/// Parse a Postgres `server_version` parameter status value into its
/// packed numeric form (`major * 10000 + minor * 100 + patch` for versions
/// before 10, `major * 10000 + minor` from 10 onward), matching the
/// semantics of libpq's `PQserverVersion`.
///
/// Grounded on `sqlx-postgres::connection::stream.rs`'s `parse_server_version`.
pub fn parse_server_version(s: &str) -> Option<u32> {
    let mut parts = s.split(|c: char| c == '.' || !c.is_ascii_digit());

    let major: u32 = parts.next()?.parse().ok()?;

    if major >= 10 {
        // New-style versioning: "10.1", "10devel", "13devel87"
        let rest = &s[s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len())..];
        if rest.is_empty() || rest.starts_with("devel") {
            return Some(major * 10_000);
        }
        let minor_str: String = rest
            .trim_start_matches('.')
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let minor: u32 = minor_str.parse().unwrap_or(0);
        Some(major * 10_000 + minor)
    } else {
        // Old-style versioning: "9.6.1", "9.6devel"
        let minor: u32 = parts.next()?.parse().unwrap_or(0);
        let patch_str: String = parts
            .next()
            .unwrap_or("")
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let patch: u32 = patch_str.parse().unwrap_or(0);
        Some(major * 10_000 + minor * 100 + patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_old_style_version() {
        assert_eq!(parse_server_version("9.6.1"), Some(90_601));
    }

    #[test]
    fn parses_old_style_devel_version() {
        assert_eq!(parse_server_version("9.6devel"), Some(90_600));
    }

    #[test]
    fn parses_new_style_version() {
        assert_eq!(parse_server_version("10.1"), Some(100_001));
    }

    #[test]
    fn parses_new_style_devel_version() {
        assert_eq!(parse_server_version("10devel"), Some(100_000));
    }

    #[test]
    fn parses_new_style_devel_with_build() {
        assert_eq!(parse_server_version("13devel87"), Some(130_000));
    }

    #[test]
    fn unknown_string_returns_none() {
        assert_eq!(parse_server_version("unknown"), None);
    }
}
