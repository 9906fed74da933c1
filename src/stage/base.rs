//! Base runtime selection.
//!
//! The pin must name at least `MAJOR.MINOR`; a floating tag such as `latest`
//! or a bare major version would let two builds of the same inputs pick
//! different interpreters.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{BuildContext, Stage, StageRecord};
use crate::config::RuntimeEnv;
use crate::error::BuildError;
use crate::image::ResolvedBase;
use crate::process::{self, Cmd};

const VERSION_PROBE: &str = "import sys; print('%d.%d.%d' % sys.version_info[:3])";
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// A pinned interpreter version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PythonPin {
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

impl PythonPin {
    pub fn parse(pin: &str) -> std::result::Result<Self, String> {
        let pin = pin.trim();
        if pin.is_empty() {
            return Err("base.python is not set; pin an interpreter version such as \"3.11\"".into());
        }
        let parts: Vec<&str> = pin.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(format!(
                "base.python '{}' is not pinned; use MAJOR.MINOR or MAJOR.MINOR.PATCH",
                pin
            ));
        }
        let num = |s: &str| -> std::result::Result<u32, String> {
            if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
                return Err(format!("base.python '{}' is not a version number", pin));
            }
            s.parse().map_err(|_| format!("base.python '{}' is out of range", pin))
        };
        Ok(Self {
            major: num(parts[0])?,
            minor: num(parts[1])?,
            patch: parts.get(2).map(|p| num(*p)).transpose()?,
        })
    }

    /// Whether a full `X.Y.Z` version satisfies this pin.
    pub fn matches(&self, version: &str) -> bool {
        let mut parts = version.trim().split('.').map(|p| p.parse::<u32>().ok());
        let major = parts.next().flatten();
        let minor = parts.next().flatten();
        let patch = parts.next().flatten();
        major == Some(self.major)
            && minor == Some(self.minor)
            && match self.patch {
                Some(p) => patch == Some(p),
                None => true,
            }
    }

    /// Interpreter names searched on PATH, most specific first.
    pub fn candidates(&self) -> Vec<String> {
        vec![
            format!("python{}.{}", self.major, self.minor),
            format!("python{}", self.major),
            "python".to_string(),
        ]
    }
}

impl std::fmt::Display for PythonPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.patch {
            Some(p) => write!(f, "{}.{}.{}", self.major, self.minor, p),
            None => write!(f, "{}.{}", self.major, self.minor),
        }
    }
}

/// Ask an interpreter for its full version.
pub async fn probe_version(interpreter: &Path, env: &RuntimeEnv) -> Result<String> {
    let result = Cmd::new(interpreter)
        .args(["-c", VERSION_PROBE])
        .runtime_env(env)
        .timeout(PROBE_TIMEOUT)
        .run()
        .await?;
    Ok(result.stdout_trimmed().to_string())
}

/// Find an interpreter satisfying `pin`.
///
/// An explicit interpreter is the only candidate when given.
pub async fn resolve(
    pin_text: &str,
    explicit: Option<&Path>,
    env: &RuntimeEnv,
) -> Result<ResolvedBase> {
    let unavailable = |reason: String| BuildError::BaseImageUnavailable {
        version: pin_text.to_string(),
        reason,
    };
    let pin = PythonPin::parse(pin_text).map_err(unavailable)?;

    let candidates: Vec<PathBuf> = match explicit {
        Some(path) => vec![path.to_path_buf()],
        None => pin
            .candidates()
            .iter()
            .filter_map(|name| process::which(name))
            .collect(),
    };

    let mut seen = Vec::new();
    for candidate in candidates {
        match probe_version(&candidate, env).await {
            Ok(version) if pin.matches(&version) => {
                tracing::info!(
                    interpreter = %candidate.display(),
                    version = %version,
                    "resolved base runtime"
                );
                return Ok(ResolvedBase {
                    requested: pin_text.to_string(),
                    version,
                    interpreter: candidate,
                });
            }
            Ok(version) => seen.push(format!("{} is {}", candidate.display(), version)),
            Err(e) => seen.push(format!("{}: {:#}", candidate.display(), e)),
        }
    }

    let reason = if seen.is_empty() {
        format!("no interpreter found (searched {})", pin.candidates().join(", "))
    } else {
        format!("no interpreter matches {} ({})", pin, seen.join("; "))
    };
    Err(unavailable(reason).into())
}

/// Stage 1: select base runtime.
pub async fn select_base(ctx: &mut BuildContext) -> Result<StageRecord> {
    let resolved = resolve(
        &ctx.config.base.python,
        ctx.config.base.interpreter.as_deref(),
        &ctx.env,
    )
    .await?;
    let detail = format!("python {} at {}", resolved.version, resolved.interpreter.display());
    ctx.base = Some(resolved);
    Ok(StageRecord::done(Stage::Base, detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn parses_pins() {
        let pin = PythonPin::parse("3.11").unwrap();
        assert_eq!((pin.major, pin.minor, pin.patch), (3, 11, None));
        let pin = PythonPin::parse("3.11.9").unwrap();
        assert_eq!(pin.patch, Some(9));
        assert_eq!(pin.to_string(), "3.11.9");
    }

    #[test]
    fn rejects_floating_pins() {
        for pin in ["", "latest", "3", "3.11.9.1", "3.x", "3..1", "v3.11"] {
            assert!(PythonPin::parse(pin).is_err(), "accepted '{}'", pin);
        }
    }

    #[test]
    fn matches_on_component_boundaries() {
        let pin = PythonPin::parse("3.1").unwrap();
        assert!(pin.matches("3.1.4"));
        assert!(!pin.matches("3.11.4"));

        let pin = PythonPin::parse("3.11.9").unwrap();
        assert!(pin.matches("3.11.9"));
        assert!(!pin.matches("3.11.10"));
        assert!(!pin.matches("garbage"));
    }

    #[test]
    fn candidates_most_specific_first() {
        let pin = PythonPin::parse("3.12").unwrap();
        assert_eq!(pin.candidates(), vec!["python3.12", "python3", "python"]);
    }

    fn fake_interpreter(dir: &Path, version: &str) -> PathBuf {
        let path = dir.join("python-fake");
        fs::write(&path, format!("#!/bin/sh\necho {}\n", version)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn explicit_interpreter_must_match() {
        let dir = TempDir::new().unwrap();
        let python = fake_interpreter(dir.path(), "3.11.9");
        let env = RuntimeEnv::from_overrides(&BTreeMap::new());

        let resolved = resolve("3.11", Some(&python), &env).await.unwrap();
        assert_eq!(resolved.version, "3.11.9");
        assert_eq!(resolved.interpreter, python);

        let err = resolve("3.12", Some(&python), &env).await.unwrap_err();
        assert_eq!(BuildError::find(&err).unwrap().kind(), "BaseImageUnavailable");
    }

    #[tokio::test]
    async fn missing_interpreter_is_unavailable() {
        let env = RuntimeEnv::from_overrides(&BTreeMap::new());
        let err = resolve("3.11", Some(Path::new("/nonexistent/python3.11")), &env)
            .await
            .unwrap_err();
        assert_eq!(BuildError::find(&err).unwrap().kind(), "BaseImageUnavailable");
    }
}
