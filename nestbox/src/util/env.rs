//! `NAME=VALUE` environment variable parsing.

/// Split an environment entry into its name, or `None` when the entry is
/// malformed (no `=`, or empty name).
pub fn env_var_name(entry: &str) -> Option<&str> {
    let (name, _) = entry.split_once('=')?;
    if name.is_empty() { None } else { Some(name) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_name() {
        assert_eq!(env_var_name("container=private-users"), Some("container"));
        assert_eq!(env_var_name("PATH=/bin:/usr/bin"), Some("PATH"));
        assert_eq!(env_var_name("EMPTY="), Some("EMPTY"));
    }

    #[test]
    fn test_env_var_name_malformed() {
        assert_eq!(env_var_name("no-equals"), None);
        assert_eq!(env_var_name("=value"), None);
        assert_eq!(env_var_name(""), None);
    }
}
