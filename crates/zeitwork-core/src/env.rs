use anyhow::{Context, Result};

/// Read a required environment variable.
///
/// Missing or empty values are configuration errors and fatal at startup;
/// the message names the variable so the operator knows what to set.
pub fn required(name: &str) -> Result<String> {
    let value = std::env::var(name)
        .with_context(|| format!("Required environment variable {} is not set", name))?;
    if value.trim().is_empty() {
        anyhow::bail!("Required environment variable {} is empty", name);
    }
    Ok(value)
}

/// Read an optional environment variable with a default.
pub fn optional(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

/// Read an optional environment variable and parse it.
pub fn optional_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Environment variable {} has invalid value: {}", name, v)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_present() {
        // SAFETY: test-local variable name, no concurrent reader cares.
        unsafe { std::env::set_var("ZEITWORK_TEST_REQ", "value") };
        assert_eq!(required("ZEITWORK_TEST_REQ").unwrap(), "value");
        unsafe { std::env::remove_var("ZEITWORK_TEST_REQ") };
    }

    #[test]
    fn test_required_missing_names_variable() {
        let err = required("ZEITWORK_TEST_DEFINITELY_UNSET").unwrap_err();
        assert!(format!("{}", err).contains("ZEITWORK_TEST_DEFINITELY_UNSET"));
    }

    #[test]
    fn test_optional_default() {
        assert_eq!(optional("ZEITWORK_TEST_OPT_UNSET", "fallback"), "fallback");
    }

    #[test]
    fn test_optional_parsed_default() {
        let v: u16 = optional_parsed("ZEITWORK_TEST_PARSE_UNSET", 8080).unwrap();
        assert_eq!(v, 8080);
    }

    #[test]
    fn test_optional_parsed_invalid() {
        unsafe { std::env::set_var("ZEITWORK_TEST_PARSE_BAD", "not-a-number") };
        let result: Result<u16> = optional_parsed("ZEITWORK_TEST_PARSE_BAD", 1);
        assert!(result.is_err());
        unsafe { std::env::remove_var("ZEITWORK_TEST_PARSE_BAD") };
    }
}
