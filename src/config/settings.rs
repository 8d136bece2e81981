//! Runtime settings read from the environment (`.env` is loaded first by binaries via dotenvy).

use crate::error::ConfigError;
use crate::privacy::PolicyPlacement;

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub database_url: String,
    pub max_connections: u32,
    /// Schema JSON file; `None` when the caller builds the schema in code.
    pub schema_path: Option<String>,
    pub policy_placement: PolicyPlacement,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            database_url: "postgres://localhost/entgraph".into(),
            max_connections: 5,
            schema_path: None,
            policy_placement: PolicyPlacement::Outermost,
        }
    }
}

impl EngineSettings {
    /// `DATABASE_URL`, `ENTGRAPH_MAX_CONNECTIONS`, `ENTGRAPH_SCHEMA_PATH`, `ENTGRAPH_POLICY_PLACEMENT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EngineSettings::default();
        let max_connections = match get("ENTGRAPH_MAX_CONNECTIONS") {
            Some(v) => v
                .parse()
                .map_err(|_| ConfigError::Validation(format!("ENTGRAPH_MAX_CONNECTIONS: not a number: '{}'", v)))?,
            None => defaults.max_connections,
        };
        let policy_placement = match get("ENTGRAPH_POLICY_PLACEMENT") {
            Some(v) => v.parse()?,
            None => defaults.policy_placement,
        };
        Ok(EngineSettings {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections,
            schema_path: get("ENTGRAPH_SCHEMA_PATH").filter(|p| !p.is_empty()),
            policy_placement,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn reads_overrides_and_falls_back_to_defaults() {
        let env: HashMap<&str, &str> = [
            ("ENTGRAPH_MAX_CONNECTIONS", "12"),
            ("ENTGRAPH_POLICY_PLACEMENT", "innermost"),
        ]
        .into_iter()
        .collect();
        let s = EngineSettings::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(s.max_connections, 12);
        assert_eq!(s.policy_placement, PolicyPlacement::Innermost);
        assert_eq!(s.database_url, "postgres://localhost/entgraph");
        assert!(s.schema_path.is_none());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(EngineSettings::from_lookup(|k| (k == "ENTGRAPH_MAX_CONNECTIONS").then(|| "many".into())).is_err());
        assert!(EngineSettings::from_lookup(|k| (k == "ENTGRAPH_POLICY_PLACEMENT").then(|| "middle".into())).is_err());
    }
}
