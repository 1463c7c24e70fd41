use std::collections::HashMap;

/** \brief Rotation group: primary aggregator key followed by its backup. */
pub const PRIMARY_GROUP_ID: &str = "OPENROUTER_API_KEY";
const PRIMARY_GROUP_SLOTS: [&str; 2] = ["OPENROUTER_API_KEY", "OPENROUTER_API_KEY2"];

/** \brief Ids that may live under either of two variable names. */
const ALTERNATE_NAMES: [&str; 2] = ["HF_API_KEY", "HF_TOKEN"];

/**
 * \brief Source of named secrets.
 * \details Implementations must not cache; every lookup reflects the current state.
 */
pub trait SecretSource: Send + Sync {
    fn lookup(&self, name: &str) -> Option<String>;
}

/**
 * \brief Process environment, refreshed from `.env` on every lookup.
 */
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecrets;

impl SecretSource for EnvSecrets {
    fn lookup(&self, name: &str) -> Option<String> {
        // Does not override variables that are already set.
        dotenv::dotenv().ok();
        std::env::var(name).ok()
    }
}

impl SecretSource for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/**
 * \brief Resolves the ordered candidate secrets for a credential id.
 * \return Empty when nothing is configured; the caller decides how to react.
 */
pub fn resolve(source: &dyn SecretSource, credential_id: &str) -> Vec<String> {
    let fetch = |name: &str| source.lookup(name).filter(|v| !v.trim().is_empty());

    if credential_id == PRIMARY_GROUP_ID {
        return PRIMARY_GROUP_SLOTS.iter().filter_map(|slot| fetch(slot)).collect();
    }
    if ALTERNATE_NAMES.contains(&credential_id) {
        return ALTERNATE_NAMES
            .iter()
            .find_map(|name| fetch(name))
            .into_iter()
            .collect();
    }
    fetch(credential_id).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_primary_group_keeps_rotation_order() {
        let env = source(&[("OPENROUTER_API_KEY2", "backup"), ("OPENROUTER_API_KEY", "main")]);
        assert_eq!(resolve(&env, PRIMARY_GROUP_ID), vec!["main", "backup"]);

        let only_backup = source(&[("OPENROUTER_API_KEY2", "backup")]);
        assert_eq!(resolve(&only_backup, PRIMARY_GROUP_ID), vec!["backup"]);
    }

    #[test]
    fn test_alternate_name_first_match_wins() {
        let both = source(&[("HF_API_KEY", "a"), ("HF_TOKEN", "b")]);
        assert_eq!(resolve(&both, "HF_TOKEN"), vec!["a"]);

        let token_only = source(&[("HF_TOKEN", "b")]);
        assert_eq!(resolve(&token_only, "HF_API_KEY"), vec!["b"]);
    }

    #[test]
    fn test_exact_lookup_and_missing() {
        let env = source(&[("OPENAI_API_KEY", "sk"), ("EMPTY_KEY", "  ")]);
        assert_eq!(resolve(&env, "OPENAI_API_KEY"), vec!["sk"]);
        assert!(resolve(&env, "EMPTY_KEY").is_empty());
        assert!(resolve(&env, "MISSING_KEY").is_empty());
        assert!(resolve(&env, PRIMARY_GROUP_ID).is_empty());
    }

    #[test]
    fn test_env_source_rereads_environment() {
        let name = "CHATLIST_TEST_SECRET_REREAD";
        std::env::remove_var(name);
        assert!(resolve(&EnvSecrets, name).is_empty());
        std::env::set_var(name, "fresh");
        assert_eq!(resolve(&EnvSecrets, name), vec!["fresh"]);
        std::env::remove_var(name);
    }
}
