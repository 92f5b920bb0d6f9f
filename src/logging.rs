use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber, formatting to stderr with an
/// `RUST_LOG`-driven filter.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

const SENSITIVE_HEADERS: &[&str] = &["authorization", "api-key", "x-api-key", "cookie"];

/// Redacts the value of a header for log output. Never applied to headers
/// actually forwarded upstream -- only to copies formatted for logging.
pub fn redact_header(name: &str, value: &str) -> String {
    if !SENSITIVE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
        return value.to_string();
    }
    if let Some(rest) = value.strip_prefix("Bearer ") {
        let _ = rest;
        return "Bearer ****".to_string();
    }
    if value.len() <= 4 {
        return "****".to_string();
    }
    format!("{}****", &value[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_bearer_token() {
        assert_eq!(
            redact_header("Authorization", "Bearer sk-1234567890"),
            "Bearer ****"
        );
    }

    #[test]
    fn redacts_cookie_prefix() {
        assert_eq!(redact_header("Cookie", "session=abc123def456"), "sess****");
    }

    #[test]
    fn leaves_ordinary_headers_untouched() {
        assert_eq!(redact_header("Content-Type", "application/json"), "application/json");
    }
}
