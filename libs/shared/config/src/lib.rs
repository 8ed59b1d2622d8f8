use std::env;
use tracing::warn;

const DEFAULT_LOCK_WAIT_MS: u64 = 2000;
const DEFAULT_SERVER_PORT: u16 = 3000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_role_key: String,
    pub supabase_jwt_secret: String,
    /// Upper bound on how long a confirmation waits for its doctor-day lock.
    pub appointment_lock_wait_ms: u64,
    pub server_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_service_role_key: env::var("SUPABASE_SERVICE_ROLE_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_SERVICE_ROLE_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            appointment_lock_wait_ms: parse_or_default("APPOINTMENT_LOCK_WAIT_MS", DEFAULT_LOCK_WAIT_MS),
            server_port: parse_or_default("SERVER_PORT", DEFAULT_SERVER_PORT),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    /// Persistence writes go through the service-role key, so it is required
    /// on top of the basic configuration.
    pub fn is_persistence_configured(&self) -> bool {
        self.is_configured() && !self.supabase_service_role_key.is_empty()
    }
}

fn parse_or_default<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "anon".to_string(),
            supabase_service_role_key: String::new(),
            supabase_jwt_secret: "secret".to_string(),
            appointment_lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            server_port: DEFAULT_SERVER_PORT,
        }
    }

    #[test]
    fn persistence_requires_service_role_key() {
        let mut config = base_config();
        assert!(config.is_configured());
        assert!(!config.is_persistence_configured());

        config.supabase_service_role_key = "service".to_string();
        assert!(config.is_persistence_configured());
    }

    #[test]
    fn missing_url_is_not_configured() {
        let mut config = base_config();
        config.supabase_url.clear();
        assert!(!config.is_configured());
    }

    #[test]
    fn parse_or_default_falls_back_for_unset_key() {
        let value: u64 = parse_or_default("CLINIC_TEST_SURELY_UNSET_KEY", 42);
        assert_eq!(value, 42);
    }
}
