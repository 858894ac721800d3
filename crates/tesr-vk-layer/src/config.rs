//! Layer configuration read from the environment.

use std::path::PathBuf;

pub const SHADER_DIR_ENV: &str = "TESR_LAYER_SHADER_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LayerEnv {
    /// Replaces the shader directory search when set and non-empty.
    pub shader_dir: Option<PathBuf>,
}

impl LayerEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key).map(PathBuf::from))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<PathBuf>) -> Self {
        Self {
            shader_dir: lookup(SHADER_DIR_ENV).filter(|dir| !dir.as_os_str().is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_override_is_ignored() {
        let env = LayerEnv::from_lookup(|_| Some(PathBuf::new()));
        assert_eq!(env.shader_dir, None);
    }

    #[test]
    fn override_is_read() {
        let env = LayerEnv::from_lookup(|key| (key == SHADER_DIR_ENV).then(|| PathBuf::from("/opt/shaders")));
        assert_eq!(env.shader_dir.as_deref(), Some(std::path::Path::new("/opt/shaders")));
    }
}
