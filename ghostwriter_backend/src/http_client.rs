use std::time::Duration;

use crate::error::ConfigError;

/// Shared reqwest client. System proxy discovery is opt-in through
/// `GHOSTWRITER_ENABLE_SYSTEM_PROXY` because it can panic on some platforms.
pub fn build_http_client() -> Result<reqwest::Client, ConfigError> {
    build_http_client_with_timeout(None)
}

pub fn build_http_client_with_timeout(
    timeout: Option<Duration>,
) -> Result<reqwest::Client, ConfigError> {
    let allow_system_proxy = std::env::var("GHOSTWRITER_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        if let Ok(Ok(client)) = std::panic::catch_unwind(|| attempt_build(timeout, false)) {
            return Ok(client);
        }

        tracing::warn!(
            "HTTP client initialization with system proxy discovery failed; retrying with no_proxy"
        );
    }

    match std::panic::catch_unwind(|| attempt_build(timeout, true)) {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(error)) => Err(ConfigError::InvalidValue {
            field: "http_client",
            reason: error.to_string(),
        }),
        Err(_) => Err(ConfigError::InvalidValue {
            field: "http_client",
            reason: "client builder panicked".to_string(),
        }),
    }
}

fn attempt_build(
    timeout: Option<Duration>,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_timeout() {
        assert!(build_http_client_with_timeout(Some(Duration::from_secs(5))).is_ok());
    }
}
