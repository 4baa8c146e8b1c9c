use super::loader::{ConfigError, ControllerConfig};

/// Validate the complete controller configuration.
///
/// Checks sane ranges on numeric parameters. The controller refuses to
/// start on validation failure.
pub fn validate(config: &ControllerConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    validate_master(config, &mut errors);
    validate_routing(config, &mut errors);
    validate_queue_and_cache(config, &mut errors);
    validate_context(config, &mut errors);
    validate_oracle(config, &mut errors);
    validate_retry(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors.join("; ")))
    }
}

fn validate_master(config: &ControllerConfig, errors: &mut Vec<String>) {
    let m = &config.system.master;

    if m.master_id.is_empty() {
        errors.push("master.master_id must not be empty".into());
    }
    if m.heartbeat_interval_secs == 0 {
        errors.push("master.heartbeat_interval_secs must be > 0".into());
    }
    if m.timeout_secs <= m.heartbeat_interval_secs {
        errors.push("master.timeout_secs must be > heartbeat_interval_secs".into());
    }
}

fn validate_routing(config: &ControllerConfig, errors: &mut Vec<String>) {
    let r = &config.system.routing;

    if r.heartbeat_fresh_secs == 0 {
        errors.push("routing.heartbeat_fresh_secs must be > 0".into());
    }
    if !(0.0..=100.0).contains(&r.cpu_threshold) {
        errors.push("routing.cpu_threshold must be between 0 and 100".into());
    }
    if !(0.0..=100.0).contains(&r.memory_threshold) {
        errors.push("routing.memory_threshold must be between 0 and 100".into());
    }
    if r.step_timeout_secs == 0 {
        errors.push("routing.step_timeout_secs must be > 0".into());
    }
    if r.failure_threshold == 0 {
        errors.push("routing.failure_threshold must be > 0".into());
    }
}

fn validate_queue_and_cache(config: &ControllerConfig, errors: &mut Vec<String>) {
    if config.system.queue.capacity == 0 {
        errors.push("queue.capacity must be > 0".into());
    }
    if config.system.cache.ttl_seconds == 0 {
        errors.push("cache.ttl_seconds must be > 0".into());
    }
    if config.system.cache.max_entries == 0 {
        errors.push("cache.max_entries must be > 0".into());
    }
}

fn validate_context(config: &ControllerConfig, errors: &mut Vec<String>) {
    if config.system.context.max_context_messages == 0 {
        errors.push("context.max_context_messages must be > 0".into());
    }
}

fn validate_oracle(config: &ControllerConfig, errors: &mut Vec<String>) {
    let validate_role = |role: &foreman_common::config::OracleRoleConfig,
                         name: &str,
                         errors: &mut Vec<String>| {
        if role.provider.is_empty() {
            errors.push(format!("oracle.{}.provider must not be empty", name));
        }
        if role.model.is_empty() {
            errors.push(format!("oracle.{}.model must not be empty", name));
        }
        if role.max_tokens == 0 {
            errors.push(format!("oracle.{}.max_tokens must be > 0", name));
        }
        if let Some(temp) = role.temperature {
            if !(0.0..=2.0).contains(&temp) {
                errors.push(format!(
                    "oracle.{}.temperature must be between 0.0 and 2.0",
                    name
                ));
            }
        }
    };

    validate_role(&config.system.oracle.planner, "planner", errors);
    validate_role(&config.system.oracle.context, "context", errors);
    validate_role(&config.system.oracle.validator, "validator", errors);
    validate_role(&config.system.oracle.builtin, "builtin", errors);
}

fn validate_retry(config: &ControllerConfig, errors: &mut Vec<String>) {
    let rc = &config.system.retry;

    if rc.max_attempts == 0 {
        errors.push("retry.max_attempts must be > 0".into());
    }
    if rc.initial_backoff_ms == 0 {
        errors.push("retry.initial_backoff_ms must be > 0".into());
    }
    if rc.max_backoff_ms < rc.initial_backoff_ms {
        errors.push("retry.max_backoff_ms must be >= initial_backoff_ms".into());
    }
    if rc.backoff_multiplier < 1.0 {
        errors.push("retry.backoff_multiplier must be >= 1.0".into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::ControllerConfig;
    use foreman_common::config::SystemConfig;

    fn default_config() -> ControllerConfig {
        ControllerConfig {
            system: SystemConfig::default(),
            config_dir: std::path::PathBuf::from("config"),
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(validate(&default_config()).is_ok());
    }

    #[test]
    fn test_timeout_must_exceed_heartbeat_interval() {
        let mut config = default_config();
        config.system.master.timeout_secs = config.system.master.heartbeat_interval_secs;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_threshold_ranges() {
        let mut config = default_config();
        config.system.routing.cpu_threshold = 150.0;
        assert!(validate(&config).is_err());
    }
}
