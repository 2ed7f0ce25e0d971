//! Configuration validation.

use crate::config::{Config, ValidationPolicy};

/// Validate the configuration.
///
/// Checks for:
/// - Proxy and backend listen addresses are distinct
/// - The proxy does not point at itself
/// - Certificate material is either fully file-based or fully generated
/// - Strict validation names a root CA bundle
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing the problems.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.proxy.listen == config.backend.listen {
        errors.push(format!(
            "proxy and backend cannot share listen address {}",
            config.proxy.listen
        ));
    }

    if config.proxy.listen == config.proxy.upstream {
        errors.push(format!(
            "proxy upstream {} loops back to its own listen address",
            config.proxy.upstream
        ));
    }

    if config.proxy.connect_timeout.is_zero() {
        errors.push("proxy connect_timeout must be non-zero".to_string());
    }

    match (&config.tls.cert, &config.tls.key) {
        (Some(_), None) => errors.push("tls.cert is set but tls.key is missing".to_string()),
        (None, Some(_)) => errors.push("tls.key is set but tls.cert is missing".to_string()),
        _ => {}
    }

    if config.tls.validation == ValidationPolicy::Strict && config.tls.ca.is_none() {
        errors.push("strict certificate validation requires tls.ca".to_string());
    }

    if config.tls.common_name.is_empty() {
        errors.push("tls.common_name cannot be empty".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
