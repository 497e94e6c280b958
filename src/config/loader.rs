/// Configuration loading from TOML file
use std::path::Path;

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::types::BrokerRole;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    // Session
    if config.session.timezone.parse::<chrono_tz::Tz>().is_err() {
        return Err(EngineError::Config(format!(
            "Unknown timezone: {}",
            config.session.timezone
        )));
    }
    parse_hhmm(&config.session.open_time)?;
    parse_hhmm(&config.session.close_time)?;

    // Strategy
    if !(0.0..=1.0).contains(&config.strategy.min_win_prob) {
        return Err(EngineError::Config(format!(
            "min_win_prob out of [0,1]: {}",
            config.strategy.min_win_prob
        )));
    }
    if config.strategy.advantage_ratio <= 0.0 {
        return Err(EngineError::Config(
            "advantage_ratio must be positive".to_string(),
        ));
    }
    if config.strategy.utility_alpha <= 0.0 || config.strategy.utility_beta <= 0.0 {
        return Err(EngineError::Config(
            "utility exponents must be positive".to_string(),
        ));
    }
    if config.strategy.htf_window < 2 || config.strategy.itf_window < 2 || config.strategy.ltf_window < 2 {
        return Err(EngineError::Config(
            "analyzer windows must be >= 2 candles".to_string(),
        ));
    }
    if config.strategy.signal_ttl_minutes <= 0 {
        return Err(EngineError::Config("signal_ttl_minutes must be positive".to_string()));
    }
    let th = &config.strategy.strength_thresholds;
    if !(th.moderate < th.strong && th.strong < th.very_strong) {
        return Err(EngineError::Config(
            "strength_thresholds must be strictly increasing".to_string(),
        ));
    }

    // Sizing
    if config.sizing.kelly_fraction <= 0.0 || config.sizing.kelly_fraction > 1.0 {
        return Err(EngineError::Config(format!(
            "kelly_fraction out of (0,1]: {}",
            config.sizing.kelly_fraction
        )));
    }
    for (name, v) in [
        ("portfolio_budget", config.sizing.portfolio_budget),
        ("symbol_budget", config.sizing.symbol_budget),
        ("position_budget", config.sizing.position_budget),
    ] {
        if v <= 0.0 {
            return Err(EngineError::Config(format!(
                "{} must be a positive log-loss magnitude, got {}",
                name, v
            )));
        }
    }
    if config.sizing.velocity_table.is_empty() {
        return Err(EngineError::Config("velocity_table must not be empty".to_string()));
    }
    if config.sizing.reentry_spacing_atr <= 0.0 {
        return Err(EngineError::Config("reentry_spacing_atr must be positive".to_string()));
    }

    // Exits
    if config.exits.exit_cooldown_seconds <= 0 {
        return Err(EngineError::Config("exit_cooldown_seconds must be positive".to_string()));
    }
    if config.exits.exit_cutoff_minutes < 0 {
        return Err(EngineError::Config("exit_cutoff_minutes must be >= 0".to_string()));
    }
    if config.exits.max_hold_days <= 0 {
        return Err(EngineError::Config("max_hold_days must be positive".to_string()));
    }
    if config.exits.trailing_enabled
        && (config.exits.trailing_distance_pct <= 0.0 || config.exits.trailing_activation_pct <= 0.0)
    {
        return Err(EngineError::Config(
            "trailing activation/distance must be positive when trailing is enabled".to_string(),
        ));
    }

    // User brokers
    let data_brokers: Vec<_> = config
        .user_brokers
        .iter()
        .filter(|b| b.enabled && b.role == BrokerRole::Data)
        .collect();
    if data_brokers.len() != 1 {
        return Err(EngineError::Config(format!(
            "exactly one enabled DATA broker required, found {}",
            data_brokers.len()
        )));
    }
    for ub in &config.user_brokers {
        if ub.capital <= 0.0 {
            return Err(EngineError::Config(format!(
                "user broker {} has non-positive capital",
                ub.user_broker_id
            )));
        }
        if ub.max_open_trades < 0 {
            return Err(EngineError::Config(format!(
                "user broker {} has negative max_open_trades",
                ub.user_broker_id
            )));
        }
    }

    Ok(())
}

/// Parse "HH:MM" into a NaiveTime
pub fn parse_hhmm(s: &str) -> Result<chrono::NaiveTime> {
    chrono::NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|e| EngineError::Config(format!("Invalid HH:MM time '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hhmm() {
        assert!(parse_hhmm("09:15").is_ok());
        assert!(parse_hhmm("15:30").is_ok());
        assert!(parse_hhmm("9am").is_err());
    }
}
