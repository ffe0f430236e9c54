use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use serde::Deserialize;
use std::{
    collections::BTreeMap as Map,
    fs,
    process::{Command, Output, Stdio},
};
use tempfile::TempDir;

use crate::{
    context::{BuildContext, CONTAINERFILE_NAME},
    models::{
        Container, ContainerId, ContainerName, ContainerSpec, ContainerStatus, Image,
        ImageBuildSpec, ImageId, ImageName,
    },
    services::ContainerBackend,
};

pub const DEFAULT_ENGINE: &str = "podman";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<Map<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectImage {
    id: String,
    config: Option<InspectConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectContainer {
    id: String,
    name: String,
    #[serde(default)]
    image: Option<String>,
    state: InspectState,
    config: Option<InspectConfig>,
}

/// Drives a docker-compatible engine CLI (`podman` or `docker`).
pub struct EngineBackend {
    program: String,
}

impl EngineBackend {
    pub fn connect(program: &str) -> Result<EngineBackend> {
        let backend = EngineBackend {
            program: program.into(),
        };

        let version = backend.output(&["version", "--format", "{{.Client.Version}}"])?;
        debug!("using {} {}", backend.program, version.trim());

        Ok(backend)
    }

    fn command(&self) -> Command {
        Command::new(&self.program)
    }

    fn check(&self, args: &[&str], output: Output) -> Result<String> {
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        Err(anyhow!(
            "`{} {}` failed ({}): {}",
            self.program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }

    fn output(&self, args: &[&str]) -> Result<String> {
        debug!("running {} {:?}", self.program, args);
        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("couldn't run {:?}", self.program))?;

        self.check(args, output)
    }

    /// Runs with the engine's own progress output on the terminal.
    fn run_attached(&self, args: &[&str], stdin: Stdio) -> Result<()> {
        debug!("running {} {:?}", self.program, args);
        let status = self
            .command()
            .args(args)
            .stdin(stdin)
            .status()
            .with_context(|| format!("couldn't run {:?}", self.program))?;

        if status.success() {
            Ok(())
        } else {
            Err(anyhow!(
                "`{} {}` failed ({})",
                self.program,
                args.join(" "),
                status
            ))
        }
    }
}

fn is_not_found(stderr: &[u8]) -> bool {
    let stderr = String::from_utf8_lossy(stderr).to_lowercase();
    stderr.contains("no such") || stderr.contains("not known") || stderr.contains("not found")
}

fn parse_status(status: &str) -> ContainerStatus {
    match status {
        "configured" | "created" => ContainerStatus::Configured,
        "running" => ContainerStatus::Running,
        "exited" | "stopped" => ContainerStatus::Exited,
        status => {
            warn!("unknown container status: {:?}", status);
            ContainerStatus::Unknown
        }
    }
}

fn parse_containers(json: &str) -> Result<Vec<Container>> {
    let containers: Vec<InspectContainer> =
        serde_json::from_str(json).context("couldn't parse container inspect output")?;

    let containers = containers
        .into_iter()
        .map(|container| Container {
            id: ContainerId(container.id),
            name: ContainerName(container.name.trim_start_matches('/').into()),
            image: container.image.map(ImageId),
            status: parse_status(&container.state.status.to_lowercase()),
            labels: container
                .config
                .and_then(|config| config.labels)
                .unwrap_or_default(),
        })
        .collect();

    Ok(containers)
}

impl ContainerBackend for EngineBackend {
    fn get_image(&mut self, name: &ImageName) -> Result<Option<Image>> {
        let args = ["image", "inspect", name.0.as_str()];
        let output = self
            .command()
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("couldn't run {:?}", self.program))?;

        if !output.status.success() && is_not_found(&output.stderr) {
            return Ok(None);
        }
        let json = self.check(&args, output)?;

        let images: Vec<InspectImage> =
            serde_json::from_str(&json).context("couldn't parse image inspect output")?;

        Ok(images.into_iter().next().map(|image| Image {
            id: ImageId(image.id),
            labels: image
                .config
                .and_then(|config| config.labels)
                .unwrap_or_default(),
        }))
    }

    fn pull_image(&mut self, name: &ImageName) -> Result<ImageId> {
        self.run_attached(&["pull", name.0.as_str()], Stdio::null())
            .with_context(|| format!("couldn't pull base image {}", name.0))?;

        let image = self
            .get_image(name)?
            .ok_or_else(|| anyhow!("image {} is missing right after pulling it", name.0))?;

        Ok(image.id)
    }

    fn build_image(&mut self, spec: ImageBuildSpec, context: &BuildContext) -> Result<ImageId> {
        let temp_dir = TempDir::new()?;
        let iid_path = temp_dir.path().join("iid");
        let iid_file = iid_path
            .to_str()
            .ok_or_else(|| anyhow!("the image id file path is not valid utf-8"))?
            .to_owned();

        let labels = spec
            .labels
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>();

        let mut args = vec![
            "build",
            "--file",
            CONTAINERFILE_NAME,
            "--tag",
            spec.name.0.as_str(),
            "--iidfile",
            iid_file.as_str(),
        ];
        for label in labels.iter() {
            args.push("--label");
            args.push(label.as_str());
        }
        // The context archive is read from stdin.
        args.push("-");

        self.run_attached(&args, Stdio::from(context.open()?))?;

        let image_id = fs::read_to_string(&iid_path)
            .context("the engine did not report an image id")?;
        temp_dir.close()?;

        Ok(ImageId(image_id.trim().into()))
    }

    fn list_containers(
        &mut self,
        labels: Vec<(&str, &str)>,
    ) -> Result<Map<ContainerName, Container>> {
        let filters = labels
            .iter()
            .map(|(label, value)| format!("label={}={}", label, value))
            .collect::<Vec<_>>();

        let mut args = vec!["ps", "--all", "--no-trunc", "--format", "{{.ID}}"];
        for filter in filters.iter() {
            args.push("--filter");
            args.push(filter.as_str());
        }

        let ids = self.output(&args)?;
        let ids = ids
            .lines()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .collect::<Vec<_>>();

        let mut containers = Map::new();
        if ids.is_empty() {
            return Ok(containers);
        }

        let mut args = vec!["container", "inspect"];
        args.extend(ids);
        let json = self.output(&args)?;

        for container in parse_containers(&json)? {
            containers.insert(container.name.clone(), container);
        }

        Ok(containers)
    }

    fn create_container(&mut self, spec: ContainerSpec) -> Result<ContainerId> {
        let mut args = vec!["create".to_owned(), "--name".into(), spec.name.0];
        for (key, value) in spec.labels.into_iter() {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in spec.env.into_iter() {
            args.push("--env".into());
            args.push(format!("{}={}", key, value));
        }
        for publish in spec.publish.into_iter() {
            args.push("--publish".into());
            args.push(publish);
        }
        args.push(spec.image_name.0);

        let args = args.iter().map(String::as_str).collect::<Vec<_>>();
        let id = self.output(&args)?;

        Ok(ContainerId(id.trim().into()))
    }

    fn start_container(&mut self, name: &str) -> Result<ContainerId> {
        self.output(&["start", name])?;
        Ok(ContainerId(name.into()))
    }

    fn stop_container(&mut self, name: &str, timeout: u32) -> Result<ContainerId> {
        let timeout = timeout.to_string();
        self.output(&["stop", "--time", timeout.as_str(), name])?;
        Ok(ContainerId(name.into()))
    }

    fn remove_container(&mut self, name: &str, remove_volumes: bool) -> Result<ContainerId> {
        if remove_volumes {
            self.output(&["rm", "--volumes", name])?;
        } else {
            self.output(&["rm", name])?;
        }
        Ok(ContainerId(name.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_and_podman_inspect_output() {
        let json = r#"[
            {
                "Id": "4f1c",
                "Name": "/medlink_app",
                "Image": "sha256:1d2c",
                "State": { "Status": "running" },
                "Config": { "Labels": { "io.pod-image.project": "medlink" } }
            },
            {
                "Id": "9a2b",
                "Name": "medlink_old",
                "State": { "Status": "exited" },
                "Config": { "Labels": null }
            },
            {
                "Id": "77aa",
                "Name": "medlink_paused",
                "State": { "Status": "paused" }
            }
        ]"#;

        let containers = parse_containers(json).unwrap();

        assert_eq!(containers[0].name, ContainerName("medlink_app".into()));
        assert_eq!(containers[0].status, ContainerStatus::Running);
        assert!(containers[0]
            .image
            .as_ref()
            .unwrap()
            .same_image(&ImageId("1d2c".into())));
        assert_eq!(containers[1].image, None);
        assert_eq!(
            containers[0].labels.get("io.pod-image.project").unwrap(),
            "medlink"
        );
        assert_eq!(containers[1].status, ContainerStatus::Exited);
        assert!(containers[1].labels.is_empty());
        assert_eq!(containers[2].status, ContainerStatus::Unknown);
    }

    #[test]
    fn recognizes_missing_images() {
        assert!(is_not_found(b"Error: No such image: medlink_app"));
        assert!(is_not_found(
            b"Error: medlink_app: image not known"
        ));
        assert!(!is_not_found(b"permission denied while trying to connect"));
    }
}
