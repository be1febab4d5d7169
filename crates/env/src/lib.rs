/// Parse a positive (`> 0`) u64 env var.
#[must_use]
pub fn positive_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

/// Expand `${VAR}` occurrences in a string using environment variables.
///
/// Returns an error if a referenced env var is missing.
///
/// # Errors
///
/// Returns `Err(...)` when a referenced environment variable is not set.
pub fn expand_env_string(s: &str) -> Result<String, String> {
    let mut result = s.to_string();
    let mut start = 0usize;

    while let Some(dollar_pos) = result[start..].find("${") {
        let abs_pos = start + dollar_pos;
        if let Some(end_pos) = result[abs_pos..].find('}') {
            let var_name = &result[abs_pos + 2..abs_pos + end_pos];
            let var_value = std::env::var(var_name).map_err(|_| {
                format!("Environment variable '{var_name}' not found (referenced in config)")
            })?;
            result = format!(
                "{}{}{}",
                &result[..abs_pos],
                var_value,
                &result[abs_pos + end_pos + 1..]
            );
            start = abs_pos + var_value.len();
        } else {
            start = abs_pos + 2;
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_replaces_vars() {
        unsafe { std::env::set_var("MANIFOLD_ENV_TEST_VAR", "hello") };
        assert_eq!(
            expand_env_string("${MANIFOLD_ENV_TEST_VAR}").unwrap(),
            "hello"
        );
        assert_eq!(
            expand_env_string("a_${MANIFOLD_ENV_TEST_VAR}_b").unwrap(),
            "a_hello_b"
        );
        assert_eq!(expand_env_string("no_vars").unwrap(), "no_vars");
        unsafe { std::env::remove_var("MANIFOLD_ENV_TEST_VAR") };
    }

    #[test]
    fn expand_missing_var_errors() {
        assert!(expand_env_string("${MANIFOLD_ENV_DEFINITELY_UNSET}").is_err());
    }

    #[test]
    fn expand_leaves_unterminated_braces() {
        assert_eq!(expand_env_string("${not_closed").unwrap(), "${not_closed");
    }

    #[test]
    fn positive_u64_rejects_zero_and_garbage() {
        unsafe { std::env::set_var("MANIFOLD_ENV_TEST_U64", "0") };
        assert_eq!(positive_u64("MANIFOLD_ENV_TEST_U64"), None);
        unsafe { std::env::set_var("MANIFOLD_ENV_TEST_U64", "12") };
        assert_eq!(positive_u64("MANIFOLD_ENV_TEST_U64"), Some(12));
        unsafe { std::env::set_var("MANIFOLD_ENV_TEST_U64", "nope") };
        assert_eq!(positive_u64("MANIFOLD_ENV_TEST_U64"), None);
        unsafe { std::env::remove_var("MANIFOLD_ENV_TEST_U64") };
    }
}
