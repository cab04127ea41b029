use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate location name: {0}")]
    DuplicateLocation(String),

    #[error("duplicate rule name: {0}")]
    DuplicateRule(String),

    #[error("duplicate tunnel alias: {0}")]
    DuplicateTunnel(String),

    #[error("rule {rule:?} references unknown location {location:?}")]
    UnknownLocation { rule: String, location: String },

    #[error("rule {rule:?} references unknown tunnel alias {alias:?} in {direction}")]
    UnknownTunnel { rule: String, alias: String, direction: &'static str },

    #[error("no fallback rule defined (a rule with no locations and no condition)")]
    MissingFallbackRule,

    #[error("failed to parse HCL configuration: {0}")]
    Hcl(#[from] hcl::Error),

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}
