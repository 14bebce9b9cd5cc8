//! LISTEN/NOTIFY (spec.md's asynchronous notification channel): a
//! self-healing subscriber that re-issues `LISTEN` for every tracked
//! channel whenever its underlying connection is replaced.
//!
//! Grounded on `sqlx-postgres::listener::{PgListener, PgNotification}` for
//! the channel-tracking/auto-reconnect shape and `ident()`/
//! `build_listen_all_query()` escaping, adapted to this crate's
//! `Shared::set_notify_sender`/`deliver_notification` push channel instead
//! of a side-channel-aware response reader.

use futures_channel::mpsc::{self, UnboundedReceiver};
use futures_util::StreamExt;

use crate::connect::Config;
use crate::error::PgError;
use crate::message::NotificationResponse;
use crate::pool::{Pool, PooledConnection, PoolOptions};

/// A subscription to one or more Postgres `NOTIFY` channels.
///
/// Reconnects transparently: if the connection currently backing this
/// listener dies, the next [`PgListener::recv`]/[`PgListener::try_recv`]
/// acquires a fresh one from the pool and re-subscribes to every channel
/// this listener was told to [`listen`](PgListener::listen) on.
pub struct PgListener {
    pool: Pool,
    connection: Option<PooledConnection>,
    receiver: Option<UnboundedReceiver<NotificationResponse>>,
    channels: Vec<String>,
}

/// One notification delivered by `NOTIFY channel, payload`.
#[derive(Debug, Clone)]
pub struct Notification {
    process_id: u32,
    channel: String,
    payload: String,
}

impl Notification {
    /// The process ID of the backend that issued the `NOTIFY`.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// The channel the notification was raised on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The notification's payload; empty if `NOTIFY` was issued without one.
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl From<NotificationResponse> for Notification {
    fn from(n: NotificationResponse) -> Self {
        Notification {
            process_id: n.process_id,
            channel: n.channel,
            payload: n.payload,
        }
    }
}

impl PgListener {
    /// Builds a dedicated one-connection pool for `url` and attaches a
    /// listener to it. The pool is private to this listener; reconnection
    /// is the only thing it's used for, so no lifetime/idle eviction
    /// applies.
    pub async fn connect(url: &str) -> Result<Self, PgError> {
        let config = Config::parse(url).map_err(PgError::ParseConfig)?;
        let options = PoolOptions::new()
            .max_connections(1)
            .max_lifetime(None)
            .idle_timeout(None);
        let pool = options.connect_with(config).await?;
        Self::connect_with(&pool).await
    }

    /// Acquires a connection from `pool` and attaches this listener to it.
    pub async fn connect_with(pool: &Pool) -> Result<Self, PgError> {
        let mut connection = pool.acquire().await?;
        let receiver = attach(&mut connection);
        Ok(PgListener {
            pool: pool.clone(),
            connection: Some(connection),
            receiver: Some(receiver),
            channels: Vec::new(),
        })
    }

    /// Starts listening on `channel`. The name is double-quoted on the wire
    /// so it is treated case-sensitively.
    pub async fn listen(&mut self, channel: &str) -> Result<(), PgError> {
        let sql = format!(r#"LISTEN "{}""#, ident(channel));
        self.connection_mut().simple_query(&sql).await?;
        self.channels.push(channel.to_owned());
        Ok(())
    }

    /// Starts listening on every channel in `channels` with a single
    /// round-trip.
    pub async fn listen_all(&mut self, channels: impl IntoIterator<Item = &str>) -> Result<(), PgError> {
        let start = self.channels.len();
        self.channels.extend(channels.into_iter().map(str::to_owned));
        let query = build_listen_all_query(&self.channels[start..]);
        self.connection_mut().simple_query(&query).await?;
        Ok(())
    }

    /// Stops listening on `channel`.
    pub async fn unlisten(&mut self, channel: &str) -> Result<(), PgError> {
        let sql = format!(r#"UNLISTEN "{}""#, ident(channel));
        self.connection_mut().simple_query(&sql).await?;
        self.channels.retain(|c| c != channel);
        Ok(())
    }

    /// Stops listening on every channel.
    pub async fn unlisten_all(&mut self) -> Result<(), PgError> {
        self.connection_mut().simple_query("UNLISTEN *").await?;
        self.channels.clear();
        Ok(())
    }

    /// Waits for the next notification, reconnecting and re-subscribing as
    /// many times as it takes.
    pub async fn recv(&mut self) -> Result<Notification, PgError> {
        loop {
            if let Some(notification) = self.try_recv().await? {
                return Ok(notification);
            }
        }
    }

    /// Waits for the next notification. Returns `Ok(None)` if the
    /// connection was lost and has just been re-established (the caller is
    /// expected to loop); notifications raised during the gap are not
    /// retroactively delivered.
    pub async fn try_recv(&mut self) -> Result<Option<Notification>, PgError> {
        let receiver = self.receiver.as_mut().expect("PgListener receiver always set while connected");
        match receiver.next().await {
            Some(notification) => Ok(Some(notification.into())),
            None => {
                self.reconnect().await?;
                Ok(None)
            }
        }
    }

    /// Returns the next notification already buffered on this connection,
    /// without waiting for one to arrive.
    pub fn next_buffered(&mut self) -> Option<Notification> {
        self.receiver.as_mut()?.try_next().ok().flatten().map(Notification::from)
    }

    async fn reconnect(&mut self) -> Result<(), PgError> {
        let mut connection = self.pool.acquire().await?;
        let receiver = attach(&mut connection);
        if !self.channels.is_empty() {
            let query = build_listen_all_query(&self.channels);
            connection.simple_query(&query).await?;
        }
        self.connection = Some(connection);
        self.receiver = Some(receiver);
        Ok(())
    }

    fn connection_mut(&mut self) -> &mut PooledConnection {
        self.connection.as_mut().expect("PgListener connection always set while connected")
    }
}

impl Drop for PgListener {
    fn drop(&mut self) {
        if let Some(connection) = &self.connection {
            connection.queue_simple_query("UNLISTEN *");
        }
    }
}

/// Attaches a fresh notification channel to `connection`'s [`crate::connection::shared::Shared`]
/// slot, replacing (and thereby dropping) whatever was attached before.
fn attach(connection: &mut PooledConnection) -> UnboundedReceiver<NotificationResponse> {
    let (tx, rx) = mpsc::unbounded();
    connection.shared().set_notify_sender(Some(tx));
    rx
}

/// Truncates at the first NUL (Postgres identifiers can't contain one) and
/// doubles embedded double quotes so the channel name can be safely
/// interpolated inside `"..."`.
fn ident(mut name: &str) -> String {
    if let Some(index) = name.find('\0') {
        name = &name[..index];
    }
    name.replace('"', "\"\"")
}

fn build_listen_all_query(channels: impl IntoIterator<Item = impl AsRef<str>>) -> String {
    channels.into_iter().fold(String::new(), |mut acc, chan| {
        acc.push_str(r#"LISTEN ""#);
        acc.push_str(&ident(chan.as_ref()));
        acc.push_str(r#"";"#);
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_listen_all_query_single_channel() {
        assert_eq!(build_listen_all_query(&["test"]), r#"LISTEN "test";"#);
    }

    #[test]
    fn build_listen_all_query_multiple_channels() {
        assert_eq!(
            build_listen_all_query(&["channel.0", "channel.1"]),
            r#"LISTEN "channel.0";LISTEN "channel.1";"#
        );
    }

    #[test]
    fn ident_doubles_embedded_quotes() {
        assert_eq!(ident(r#"weird"name"#), r#"weird""name"#);
    }

    #[test]
    fn ident_truncates_at_nul() {
        assert_eq!(ident("abc\0def"), "abc");
    }
}
