use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

use crate::client::{ClientConfig, Credentials};

#[derive(Debug, Default)]
struct IniConfig {
    url: Option<String>,
    api_key: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

pub(crate) fn load_config(
    url: Option<String>,
    credentials: Option<Credentials>,
    verify: Option<bool>,
) -> Result<ClientConfig> {
    let mut url = url.or_else(|| std::env::var("CRUNCH_URL").ok());
    let mut credentials = credentials.or_else(credentials_from_env);

    let ini_candidates = ini_candidates();

    if url.is_none() || credentials.is_none() {
        for ini_path in &ini_candidates {
            if ini_path.exists() {
                let cfg = read_ini(ini_path).with_context(|| {
                    format!("failed to read configuration file {}", ini_path.display())
                })?;

                if url.is_none() {
                    url = cfg.url;
                }
                if credentials.is_none() {
                    // An API key wins over username/password, as it does in
                    // the environment.
                    credentials = match (cfg.api_key, cfg.username, cfg.password) {
                        (Some(key), _, _) => Some(Credentials::ApiKey(key)),
                        (None, Some(username), Some(password)) => {
                            Some(Credentials::Login { username, password })
                        }
                        _ => None,
                    };
                }
                break;
            }
        }
    }

    let candidate_list = || {
        ini_candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let url = match url {
        Some(v) => v,
        None => bail!(
            "Missing configuration: url (set CRUNCH_URL or put `CRUNCH_URL =` in one of: {})",
            candidate_list()
        ),
    };

    let credentials = match credentials {
        Some(v) => v,
        None => bail!(
            "Missing configuration: credentials (set CRUNCH_API_KEY or \
             CRUNCH_USERNAME/CRUNCH_PASSWORD, or put them in one of: {})",
            candidate_list()
        ),
    };

    Ok(ClientConfig {
        url,
        credentials,
        verify: verify.unwrap_or(true),
    })
}

fn credentials_from_env() -> Option<Credentials> {
    if let Ok(key) = std::env::var("CRUNCH_API_KEY") {
        return Some(Credentials::ApiKey(key));
    }
    match (
        std::env::var("CRUNCH_USERNAME"),
        std::env::var("CRUNCH_PASSWORD"),
    ) {
        (Ok(username), Ok(password)) => Some(Credentials::Login { username, password }),
        _ => None,
    }
}

/// Parses the `[DEFAULT]` section of a `crunch.ini` file. Keys outside that
/// section are ignored, as are comments and blank lines.
fn read_ini(path: &Path) -> Result<IniConfig> {
    let text = std::fs::read_to_string(path)?;
    let mut cfg = IniConfig::default();
    let mut in_default = true;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            in_default = line[1..line.len() - 1].trim().eq_ignore_ascii_case("DEFAULT");
            continue;
        }
        if !in_default {
            continue;
        }

        if let Some((k, v)) = line.split_once('=') {
            let v = strip_quotes(v.trim());
            if v.is_empty() {
                continue;
            }
            match k.trim().to_ascii_uppercase().as_str() {
                "CRUNCH_URL" => cfg.url = Some(v.to_string()),
                "CRUNCH_API_KEY" => cfg.api_key = Some(v.to_string()),
                "CRUNCH_USERNAME" => cfg.username = Some(v.to_string()),
                "CRUNCH_PASSWORD" => cfg.password = Some(v.to_string()),
                _ => {}
            }
        }
    }

    Ok(cfg)
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn ini_candidates() -> Vec<PathBuf> {
    // Search order:
    // 1) CRUNCH_INI (explicit)
    // 2) ./crunch.ini (execution directory / current working directory)
    // 3) ~/.crunch.ini
    if let Ok(p) = std::env::var("CRUNCH_INI") {
        return vec![PathBuf::from(p)];
    }

    let mut v = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        v.push(cwd.join("crunch.ini"));
    }
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(".crunch.ini"));
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_ini(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_default_section() {
        let f = write_ini(
            "[DEFAULT]\n\
             CRUNCH_URL = https://company.crunch.io/api\n\
             CRUNCH_API_KEY = abcdef123\n",
        );
        let cfg = read_ini(f.path()).unwrap();
        assert_eq!(cfg.url.as_deref(), Some("https://company.crunch.io/api"));
        assert_eq!(cfg.api_key.as_deref(), Some("abcdef123"));
    }

    #[test]
    fn ignores_other_sections_and_comments() {
        let f = write_ini(
            "# credentials\n\
             CRUNCH_USERNAME = me@example.com\n\
             [other]\n\
             CRUNCH_URL = https://wrong.example.com\n\
             [DEFAULT]\n\
             CRUNCH_PASSWORD = 'hunter2'\n",
        );
        let cfg = read_ini(f.path()).unwrap();
        assert_eq!(cfg.url, None);
        assert_eq!(cfg.username.as_deref(), Some("me@example.com"));
        assert_eq!(cfg.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn explicit_arguments_win() {
        // With both url and credentials given, no environment or file source
        // is consulted at all.
        let cfg = load_config(
            Some("https://arg.example.com/api".into()),
            Some(Credentials::ApiKey("argkey".into())),
            None,
        )
        .unwrap();
        assert_eq!(cfg.url, "https://arg.example.com/api");
        match cfg.credentials {
            Credentials::ApiKey(key) => assert_eq!(key, "argkey"),
            other => panic!("unexpected credentials: {:?}", other),
        }
        assert!(cfg.verify);
    }

    #[test]
    fn api_key_wins_over_login_in_file() {
        let f = write_ini(
            "[DEFAULT]\n\
             CRUNCH_API_KEY = filekey\n\
             CRUNCH_USERNAME = me@example.com\n\
             CRUNCH_PASSWORD = hunter2\n",
        );
        let cfg = read_ini(f.path()).unwrap();
        assert_eq!(cfg.api_key.as_deref(), Some("filekey"));
        assert_eq!(cfg.username.as_deref(), Some("me@example.com"));
    }
}
