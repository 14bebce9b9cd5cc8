//! libpq-compatible environment variable defaults (C6), applied after
//! connection-string parsing and before `pg_service.conf`/`.pgpass`
//! lookups so that an explicit value anywhere in the string always wins.

use once_cell::sync::Lazy;

use super::Config;

/// `whoami::username()` shells out to the OS on some platforms; the
/// fallback user name can't change over the life of the process, so it's
/// resolved once rather than on every unqualified `Config::parse` call.
static DEFAULT_USER: Lazy<String> = Lazy::new(whoami::username);

pub fn apply(config: &mut Config) {
    if config.host.is_empty() {
        if let Ok(host) = std::env::var("PGHOST") {
            config.host = host.split(',').map(str::to_string).collect();
        }
    }
    if config.port.is_empty() {
        if let Ok(port) = std::env::var("PGPORT") {
            config.port = port
                .split(',')
                .filter_map(|p| p.parse().ok())
                .collect();
        }
    }
    if config.user.is_empty() {
        if let Ok(user) = std::env::var("PGUSER") {
            config.user = user;
        } else {
            config.user = DEFAULT_USER.clone();
        }
    }
    if config.password.is_empty() {
        if let Ok(password) = std::env::var("PGPASSWORD") {
            config.password = password;
        }
    }
    if config.database.is_empty() {
        if let Ok(database) = std::env::var("PGDATABASE") {
            config.database = database;
        } else {
            config.database = config.user.clone();
        }
    }
    if config.application_name.is_none() {
        config.application_name = std::env::var("PGAPPNAME").ok();
    }
    if config.options.is_none() {
        config.options = std::env::var("PGOPTIONS").ok();
    }
    if let Ok(sslmode) = std::env::var("PGSSLMODE") {
        if let Ok(mode) = super::SslMode::parse(&sslmode) {
            config.ssl_mode = mode;
        }
    }
    if let Ok(connect_timeout) = std::env::var("PGCONNECT_TIMEOUT") {
        if let Ok(secs) = connect_timeout.parse::<u64>() {
            config.connect_timeout = Some(std::time::Duration::from_secs(secs));
        }
    }
    if let Ok(attrs) = std::env::var("PGTARGETSESSIONATTRS") {
        if let Ok(attrs) = super::TargetSessionAttrs::parse(&attrs) {
            config.target_session_attrs = attrs;
        }
    }
    if let Ok(service) = std::env::var("PGSERVICE") {
        if config.service.is_none() {
            config.service = Some(service);
        }
    }
}
