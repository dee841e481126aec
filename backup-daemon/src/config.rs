use backup_engine::manifest::Category;
use std::path::PathBuf;

/// Cron expressions (with seconds) used when `SCHEDULE_<CATEGORY>` is unset.
pub const DEFAULT_SCHEDULES: [(Category, &str); 3] = [
    (Category::Daily, "0 0 2 * * *"),
    (Category::Weekly, "0 0 3 * * Sun"),
    (Category::Monthly, "0 0 4 1 * *"),
];

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    /// Engine TOML file; built-in defaults when unset.
    pub engine_config: Option<PathBuf>,
    pub log_level: String,
    pub schedules: Vec<(Category, String)>,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let schedules = DEFAULT_SCHEDULES
            .iter()
            .filter_map(|(category, default)| {
                let key = format!("SCHEDULE_{}", category.as_str().to_uppercase());
                schedule_value(lookup(&key), default).map(|cron| (*category, cron))
            })
            .collect();

        Self {
            port: lookup("PORT").and_then(|v| v.parse().ok()).unwrap_or(3000),
            engine_config: lookup("BACKUP_ENGINE_CONFIG")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            schedules,
        }
    }
}

/// `off` or an empty value disables the schedule.
fn schedule_value(value: Option<String>, default: &str) -> Option<String> {
    match value.map(|v| v.trim().to_string()) {
        None => Some(default.to_string()),
        Some(v) if v.is_empty() || v.eq_ignore_ascii_case("off") => None,
        Some(v) => Some(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> DaemonConfig {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        DaemonConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.port, 3000);
        assert!(config.engine_config.is_none());
        assert_eq!(config.schedules.len(), 3);
        assert_eq!(config.schedules[0], (Category::Daily, "0 0 2 * * *".to_string()));
    }

    #[test]
    fn test_overrides_and_disabled_schedules() {
        let config = config_from(&[
            ("PORT", "8088"),
            ("BACKUP_ENGINE_CONFIG", "/etc/backup-engine.toml"),
            ("SCHEDULE_DAILY", "0 30 1 * * *"),
            ("SCHEDULE_MONTHLY", "off"),
        ]);
        assert_eq!(config.port, 8088);
        assert_eq!(config.engine_config, Some(PathBuf::from("/etc/backup-engine.toml")));
        assert_eq!(
            config.schedules,
            vec![
                (Category::Daily, "0 30 1 * * *".to_string()),
                (Category::Weekly, "0 0 3 * * Sun".to_string()),
            ]
        );
    }
}
