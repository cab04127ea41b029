//! Reads a `Config` from HCL source text via `hcl-rs`'s serde bridge.
//! This crate never writes an HCL parser of its own; it borrows the
//! library the same way the rest of the workspace borrows `serde_json`
//! for the wire protocol, and validates the result the same way either
//! path would need to.

use std::path::Path;

use crate::config::Config;
use crate::error::ConfigError;

pub fn load_str(source: &str) -> Result<Config, ConfigError> {
    let config: Config = hcl::from_str(source)?;
    config.validate()?;
    Ok(config)
}

pub fn load_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let source = std::fs::read_to_string(path)?;
    load_str(&source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_fallback_only_config() {
        let source = r#"
            rules = [
              {
                name         = "default"
                display_name = "Default"
              }
            ]
        "#;
        let config = load_str(source).expect("minimal config should parse and validate");
        assert_eq!(config.rules.len(), 1);
    }

    #[test]
    fn rejects_config_missing_fallback_rule() {
        let source = r#"
            rules = [
              {
                name         = "trusted"
                display_name = "Trusted"
                condition    = { kind = "bool", sensor = "online", expected = true }
              }
            ]
        "#;
        let err = load_str(source).expect_err("a config with no fallback rule must fail validation");
        assert!(matches!(err, ConfigError::MissingFallbackRule));
    }
}
