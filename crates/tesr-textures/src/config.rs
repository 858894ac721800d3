//! Producer configuration read from the environment.

pub const ENABLE_INTEROP_ENV: &str = "TESR_ENABLE_VK_INTEROP";
pub const VALIDATE_INTEROP_ENV: &str = "TESR_VALIDATE_VK_INTEROP";

/// Interop switches consumed once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InteropEnv {
    pub enable_interop: bool,
    /// Read each sibling back on the CPU right after creation.
    pub validate_interop: bool,
}

impl InteropEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).is_some_and(|value| is_truthy(&value));
        Self {
            enable_interop: flag(ENABLE_INTEROP_ENV),
            validate_interop: flag(VALIDATE_INTEROP_ENV),
        }
    }
}

/// Non-empty and not starting with `0`, `f` or `n` (either case).
pub fn is_truthy(value: &str) -> bool {
    match value.chars().next() {
        None => false,
        Some(c) => !matches!(c, '0' | 'f' | 'F' | 'n' | 'N'),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn truthiness() {
        for yes in ["1", "true", "yes", "on", "Y"] {
            assert!(is_truthy(yes), "{yes}");
        }
        for no in ["", "0", "false", "False", "no", "N"] {
            assert!(!is_truthy(no), "{no}");
        }
    }

    #[test]
    fn lookup_reads_both_flags() {
        let vars: HashMap<&str, &str> = [(ENABLE_INTEROP_ENV, "1"), (VALIDATE_INTEROP_ENV, "no")].into();
        let env = InteropEnv::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert!(env.enable_interop);
        assert!(!env.validate_interop);
    }
}
