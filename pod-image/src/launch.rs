use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use std::{
    collections::BTreeMap as Map,
    convert::Infallible,
    env, fmt, fs, io,
    path::Path,
    process::Command,
};
use thiserror::Error;

use crate::models::LaunchSpec;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("{var}={value:?} is not a port number")]
    NotANumber { var: String, value: String },

    #[error("{var}={value} is outside the TCP port range 1-65535")]
    OutOfRange { var: String, value: String },
}

/// Resolves the listening port from the raw value of `var`. Unset and empty
/// values fall back to `default`.
pub fn resolve_port(var: &str, value: Option<&str>, default: u16) -> Result<u16, PortError> {
    let value = match value.map(str::trim) {
        None | Some("") => return Ok(default),
        Some(value) => value,
    };

    if !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(PortError::NotANumber {
            var: var.into(),
            value: value.into(),
        });
    }

    match value.parse::<u64>() {
        Ok(port) if port >= 1 && port <= u64::from(u16::MAX) => Ok(port as u16),
        _ => Err(PortError::OutOfRange {
            var: var.into(),
            value: value.into(),
        }),
    }
}

/// Reads `var` from the process environment and resolves it with
/// [`resolve_port`].
pub fn port_from_env(var: &str, default: u16) -> Result<u16, PortError> {
    match env::var(var) {
        Ok(value) => resolve_port(var, Some(&value), default),
        Err(env::VarError::NotPresent) => resolve_port(var, None, default),
        Err(env::VarError::NotUnicode(value)) => Err(PortError::NotANumber {
            var: var.into(),
            value: value.to_string_lossy().into_owned(),
        }),
    }
}

/// Makes sure `path` exists as a directory. Returns whether it had to be
/// created; existing contents are never touched.
pub fn provision_runtime_dir<P: AsRef<Path>>(path: P) -> Result<bool> {
    let path = path.as_ref();

    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => {
            debug!("runtime directory {:?} already exists", path);
            Ok(false)
        }
        Ok(_) => Err(anyhow!(
            "runtime directory {:?} exists but is not a directory",
            path
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(path)
                .with_context(|| format!("couldn't create runtime directory {:?}", path))?;
            info!("created runtime directory {:?}", path);
            Ok(true)
        }
        Err(err) => Err(err).with_context(|| format!("couldn't inspect {:?}", path)),
    }
}

/// The fully resolved server invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub env: Map<String, String>,
    pub host: String,
    pub port: u16,
}

impl LaunchPlan {
    pub fn new(spec: &LaunchSpec, port: u16) -> LaunchPlan {
        let args = vec![
            spec.entrypoint.clone(),
            "--host".into(),
            spec.host.clone(),
            "--port".into(),
            port.to_string(),
        ];

        LaunchPlan {
            program: spec.server.clone(),
            args,
            env: spec.env.clone(),
            host: spec.host.clone(),
            port,
        }
    }

    /// Resolves the port from the environment and builds the plan.
    pub fn from_env(spec: &LaunchSpec) -> Result<LaunchPlan> {
        let port = port_from_env(&spec.port_env, spec.default_port)?;
        Ok(LaunchPlan::new(spec, port))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env);
        command
    }

    /// Hands the current process over to the server. Only returns on failure.
    #[cfg(unix)]
    pub fn exec(self) -> Result<Infallible> {
        use std::os::unix::process::CommandExt;

        info!("launching {} on {}", self.program, self.bind_address());
        let err = self.command().exec();
        Err(anyhow!("couldn't launch {:?}: {}", self.program, err))
    }

    #[cfg(not(unix))]
    pub fn exec(self) -> Result<Infallible> {
        info!("launching {} on {}", self.program, self.bind_address());
        let status = self
            .command()
            .status()
            .with_context(|| format!("couldn't launch {:?}", self.program))?;
        std::process::exit(status.code().unwrap_or(1));
    }
}

impl fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.env.iter() {
            write!(f, "{}={} ", key, value)?;
        }
        write!(f, "{}", self.program)?;
        for arg in self.args.iter() {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontends::RecipeFile;

    fn spec() -> LaunchSpec {
        RecipeFile::default().resolve("medlink").unwrap().launch
    }

    #[test]
    fn unset_port_uses_default() {
        assert_eq!(resolve_port("PORT", None, 8000), Ok(8000));
    }

    #[test]
    fn empty_port_uses_default() {
        assert_eq!(resolve_port("PORT", Some(""), 8000), Ok(8000));
        assert_eq!(resolve_port("PORT", Some("  "), 8000), Ok(8000));
    }

    #[test]
    fn valid_ports_are_used_verbatim() {
        for port in &[1u16, 80, 3000, 8000, 65535] {
            let value = port.to_string();
            assert_eq!(resolve_port("PORT", Some(&value), 8000), Ok(*port));
        }
    }

    #[test]
    fn non_numeric_port_is_rejected() {
        assert_eq!(
            resolve_port("PORT", Some("http"), 8000),
            Err(PortError::NotANumber {
                var: "PORT".into(),
                value: "http".into()
            })
        );
        assert!(resolve_port("PORT", Some("-1"), 8000).is_err());
        assert!(resolve_port("PORT", Some("80.5"), 8000).is_err());
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        for value in &["0", "65536", "99999999999999999999999"] {
            assert_eq!(
                resolve_port("PORT", Some(value), 8000),
                Err(PortError::OutOfRange {
                    var: "PORT".into(),
                    value: (*value).into()
                })
            );
        }
    }

    #[test]
    fn plan_binds_all_interfaces_on_default_port() {
        let plan = LaunchPlan::new(&spec(), resolve_port("PORT", None, 8000).unwrap());

        assert_eq!(plan.bind_address(), "0.0.0.0:8000");
        assert_eq!(
            plan.to_string(),
            "uvicorn app.main:app --host 0.0.0.0 --port 8000"
        );
    }

    #[test]
    fn plan_binds_requested_port() {
        let plan = LaunchPlan::new(&spec(), resolve_port("PORT", Some("3000"), 8000).unwrap());

        assert_eq!(plan.bind_address(), "0.0.0.0:3000");
        assert_eq!(plan.args.last().unwrap(), "3000");
    }

    #[test]
    fn plan_from_env_reads_configured_variable() {
        let mut spec = spec();
        spec.port_env = "POD_IMAGE_TEST_LISTEN_PORT".into();
        env::set_var("POD_IMAGE_TEST_LISTEN_PORT", "4242");

        let plan = LaunchPlan::from_env(&spec).unwrap();
        env::remove_var("POD_IMAGE_TEST_LISTEN_PORT");

        assert_eq!(plan.port, 4242);
    }

    #[test]
    fn provisioning_creates_missing_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("app/uploads");

        assert!(provision_runtime_dir(&dir).unwrap());
        assert!(dir.is_dir());
    }

    #[test]
    fn provisioning_keeps_existing_contents() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("uploads");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("scan.png"), b"png").unwrap();

        assert!(!provision_runtime_dir(&dir).unwrap());
        assert!(!provision_runtime_dir(&dir).unwrap());
        assert_eq!(fs::read(dir.join("scan.png")).unwrap(), b"png");
    }

    #[test]
    fn provisioning_rejects_a_file() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("uploads");
        fs::write(&path, b"").unwrap();

        assert!(provision_runtime_dir(&path).is_err());
    }
}
