use anyhow::{anyhow, Result};
use regex::Regex;
use std::{fmt::Write, path::Path};

use crate::{models::LaunchSpec, pipeline::Step, services::StepExecutor};

const APT_LISTS: &str = "/var/lib/apt/lists/*";

/// Renders pipeline steps as Containerfile instructions.
pub struct ContainerfileWriter {
    contents: String,
    package_re: Regex,
}

impl ContainerfileWriter {
    pub fn new() -> ContainerfileWriter {
        ContainerfileWriter {
            contents: String::new(),
            // Debian package names, optionally pinned with `=version`.
            package_re: Regex::new(r"^[a-z0-9][a-z0-9+.-]+(=[A-Za-z0-9.+:~-]+)?$")
                .expect("package pattern is valid"),
        }
    }

    pub fn finish(self) -> String {
        self.contents
    }

    fn line(&mut self, line: impl AsRef<str>) {
        self.contents.push_str(line.as_ref());
        self.contents.push('\n');
    }
}

/// `CMD` in exec form. `${VAR:-default}` covers both an unset and an empty
/// variable; the server validates whatever value comes through.
pub fn launch_instruction(launch: &LaunchSpec) -> Result<String> {
    let command = format!(
        "exec {} {} --host {} --port ${{{}:-{}}}",
        launch.server, launch.entrypoint, launch.host, launch.port_env, launch.default_port
    );
    let argv = serde_json::to_string(&["sh", "-c", command.as_str()])?;

    Ok(format!("CMD {}", argv))
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("path {:?} is not valid utf-8", path))
}

impl StepExecutor for ContainerfileWriter {
    fn execute(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::SelectBase(base) => {
                self.line(format!("FROM {}", base));
            }
            Step::InstallNativePackages(packages) => {
                if let Some(package) = packages.iter().find(|p| !self.package_re.is_match(p)) {
                    return Err(anyhow!("invalid package name {:?}", package));
                }
                if packages.is_empty() {
                    return Ok(());
                }

                let mut run = String::from("RUN apt-get update \\\n    && apt-get install -y --no-install-recommends");
                for package in packages {
                    write!(run, " \\\n        {}", package)?;
                }
                write!(run, " \\\n    && rm -rf {}", APT_LISTS)?;
                self.line(run);
            }
            Step::BootstrapInstaller => {
                self.line("RUN pip install --no-cache-dir --upgrade pip");
            }
            Step::InstallDependencies { manifest, app_root } => {
                let file_name = manifest
                    .file_name()
                    .ok_or_else(|| anyhow!("manifest {:?} has no file name", manifest))?;
                let file_name = path_str(Path::new(file_name))?;
                self.line(format!("WORKDIR {}", path_str(app_root)?));
                self.line(format!("COPY {} .", path_str(manifest)?));
                self.line(format!("RUN pip install --no-cache-dir -r {}", file_name));
            }
            Step::CopySource { .. } => {
                self.line("COPY . .");
            }
            Step::ProvisionRuntimeDir(path) => {
                self.line(format!("RUN mkdir -p {}", path_str(path)?));
            }
            Step::DeclarePort(port) => {
                self.line(format!("EXPOSE {}", port));
            }
            Step::Launch(launch) => {
                for (key, value) in launch.env.iter() {
                    let line = format!("ENV {}={}", key, serde_json::to_string(value)?);
                    self.line(line);
                }
                let instruction = launch_instruction(launch)?;
                self.line(instruction);
            }
        }

        Ok(())
    }
}
