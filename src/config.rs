use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub session_ttl_hours: i64,
    pub admin_password_hash: Option<String>,
    pub auth_disabled: bool,
    pub webhook_secret: Option<String>,
    pub cookie_secure: bool,
    pub live_channel_capacity: usize,
    pub db_max_connections: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let session_ttl_hours = env::var("SESSION_TTL_HOURS")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|h| *h > 0)
            .unwrap_or(24);

        let admin_password_hash = non_empty(env::var("ADMIN_PASSWORD_HASH").ok());
        let auth_disabled = env::var("AUTH_DISABLED").ok().is_some_and(|v| parse_flag(&v));

        if admin_password_hash.is_none() && !auth_disabled {
            anyhow::bail!("ADMIN_PASSWORD_HASH must be set (or AUTH_DISABLED=true for local dev)");
        }

        let webhook_secret = non_empty(env::var("WEBHOOK_SECRET").ok());
        let cookie_secure = env::var("COOKIE_SECURE").ok().is_some_and(|v| parse_flag(&v));

        let live_channel_capacity = env::var("LIVE_CHANNEL_CAPACITY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|c| *c > 0)
            .unwrap_or(256);

        let db_max_connections = env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|c| *c > 0)
            .unwrap_or(10);

        Ok(Self {
            database_url,
            bind_addr,
            session_ttl_hours,
            admin_password_hash,
            auth_disabled,
            webhook_secret,
            cookie_secure,
            live_channel_capacity,
            db_max_connections,
        })
    }
}

/// Accepts the usual truthy spellings: `1`, `true`, `yes`, `on`.
pub fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parsing_accepts_common_truthy_values() {
        for v in ["1", "true", "TRUE", " yes ", "On"] {
            assert!(parse_flag(v), "{v} should be truthy");
        }
        for v in ["0", "false", "", "no", "maybe"] {
            assert!(!parse_flag(v), "{v} should be falsy");
        }
    }

    #[test]
    fn blank_values_are_treated_as_missing() {
        assert_eq!(non_empty(Some("   ".into())), None);
        assert_eq!(non_empty(None), None);
        assert_eq!(non_empty(Some(" s3cret ".into())), Some("s3cret".into()));
    }
}
