use std::borrow::Cow;
use std::env;
use std::path::{Path, PathBuf};

use regex::{Captures, Regex};
use tracing::debug;

use crate::tenant_core::common::{Error, Result};

/// Search for `config_name`, in order:
/// 1) the path passed as the first command line argument
/// 2) the current directory
/// 3) any parent directory of the current directory, up to root
/// 4) ~/.config/tenant-core/
/// 5) ~/
/// 6) /etc/tenant-core/
pub fn find_config_file(config_name: &str) -> Result<PathBuf> {
    if let Some(path) = env::args().nth(1) {
        debug!("using config_path passed on command line");
        return Ok(PathBuf::from(path));
    }

    if let Ok(start) = env::current_dir() {
        let mut dir = start.as_path();
        while !dir.as_os_str().is_empty() {
            debug!("checking for config file in {}", dir.to_string_lossy());
            let fp = Path::join(dir, config_name);
            if fp.exists() {
                return Ok(fp);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    let home = env::var("HOME").unwrap_or_else(|_| "~/".to_string());

    let mut conf_path = Path::join(Path::new(&home), Path::join(Path::new(".config/tenant-core"), config_name));
    debug!("checking for config file in {}", conf_path.to_string_lossy());
    if conf_path.exists() {
        return Ok(conf_path);
    }

    conf_path = Path::join(Path::new(&home), ".".to_string() + config_name);
    debug!("checking for config file in {}", conf_path.to_string_lossy());
    if conf_path.exists() {
        return Ok(conf_path);
    }

    conf_path = Path::join(Path::new("/etc/tenant-core"), config_name);
    debug!("checking for config file in {}", conf_path.to_string_lossy());
    if conf_path.exists() {
        return Ok(conf_path);
    }

    Err(Error::startup(format!("config file {} not found", config_name)))
}

/// Replaces `${ENV_VAR[:DEFAULT]}` placeholders in `raw_yaml` with values from the
/// environment, or the given default after the `:` if the variable isn't set. A default
/// starting with `?` is instead treated as a required-variable error message.
pub fn replace_env_vars(raw_yaml: &str) -> Result<Cow<str>> {
    let re_var = Regex::new(r"\$\{([a-zA-Z_][0-9a-zA-Z_]*)(?::([^}]+?))?\}").unwrap();

    let mut errors = Vec::<String>::new();

    let replaced_text = re_var.replace_all(raw_yaml, |caps: &Captures| {
        match env::var(&caps[1]) {
            Ok(val) => val,
            Err(_) => {
                if let Some(default) = caps.get(2) {
                    let s = default.as_str();
                    if let Some(msg) = s.strip_prefix('?') {
                        errors.push(msg.to_string());
                        String::new()
                    } else {
                        s.to_string()
                    }
                } else {
                    errors.push(format!("environment variable {} is required but not defined", &caps[1]));
                    String::new()
                }
            }
        }
    });

    if errors.is_empty() {
        Ok(replaced_text)
    } else {
        Err(Error::startup(errors.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_present_env_var() {
        std::env::set_var("TENANT_CORE_TEST_VAR", "hello");
        let out = replace_env_vars("value: ${TENANT_CORE_TEST_VAR}").unwrap();
        assert_eq!(out, "value: hello");
        std::env::remove_var("TENANT_CORE_TEST_VAR");
    }

    #[test]
    fn falls_back_to_default() {
        let out = replace_env_vars("value: ${TENANT_CORE_DOES_NOT_EXIST:fallback}").unwrap();
        assert_eq!(out, "value: fallback");
    }

    #[test]
    fn required_missing_var_errors() {
        let err = replace_env_vars("value: ${TENANT_CORE_DOES_NOT_EXIST:?must set this}");
        assert!(err.is_err());
    }
}
