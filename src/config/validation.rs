//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that a destination is configured and resolvable
//! - Check bind addresses and TLS material
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure apart from TLS file existence checks

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("`{}` is not a socket address", config.listener.bind_address),
        ));
    }

    if let Err(e) = config.proxy.resolve() {
        errors.push(ValidationError::new("proxy", e.to_string()));
    }

    if let Some(tls) = &config.proxy.ssl {
        if !Path::new(&tls.cert_path).exists() {
            errors.push(ValidationError::new(
                "proxy.ssl.cert_path",
                format!("certificate file `{}` not found", tls.cert_path),
            ));
        }
        if !Path::new(&tls.key_path).exists() {
            errors.push(ValidationError::new(
                "proxy.ssl.key_path",
                format!("private key file `{}` not found", tls.key_path),
            ));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("`{}` is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::options::ProxyOptions;
    use crate::config::schema::TlsConfig;

    #[test]
    fn valid_config_passes() {
        let config = ProxyConfig {
            proxy: ProxyOptions::with_target("http://127.0.0.1:3000"),
            ..Default::default()
        };
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.proxy.ssl = Some(TlsConfig {
            cert_path: "/definitely/missing/cert.pem".into(),
            key_path: "/definitely/missing/key.pem".into(),
        });

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "listener.bind_address",
                "proxy",
                "proxy.ssl.cert_path",
                "proxy.ssl.key_path"
            ]
        );
    }
}
