use anyhow::{anyhow, Result};
use log::info;
use std::{
    collections::BTreeMap as Map,
    path::{Path, PathBuf},
};

use crate::{
    context::BuildContext,
    hasher,
    manifest::Manifest,
    models::{
        BuildPolicy, Container, ContainerId, ContainerName, ContainerSpec, ContainerStatus,
        ImageBuildSpec, ImageId, PullPolicy, Recipe,
    },
    services::ContainerBackend,
};

pub const LABEL_PROJECT: &str = "io.pod-image.project";
pub const LABEL_HASH: &str = "io.pod-image.hash";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContainerOperation {
    Create,
    Recreate,
    Start,
    Stop,
    Remove,
}

pub struct Controller {
    backend: Box<dyn ContainerBackend>,
    recipe: Recipe,
    context: PathBuf,
    image_id: Option<ImageId>,
    containers: Map<ContainerName, Container>,
}

impl Controller {
    pub fn init<B, P>(recipe: Recipe, context: P, backend: B) -> Result<Controller>
    where
        B: 'static + ContainerBackend,
        P: AsRef<Path>,
    {
        let mut backend = Box::new(backend);
        let containers =
            backend.list_containers(vec![(LABEL_PROJECT, recipe.project_name.as_str())])?;

        Ok(Controller {
            backend,
            recipe,
            context: context.as_ref().to_path_buf(),
            image_id: None,
            containers,
        })
    }

    /// Fingerprint of everything the image is built from: the recipe, the
    /// manifest and the archived context, source tree included.
    pub fn image_hash(&self, manifest: &Manifest, context: &BuildContext) -> String {
        hasher::digest((&self.recipe, &manifest.contents, context.digest()))
    }

    /// The image the service container should run, known once
    /// [`Controller::build_image`] has run.
    pub fn image_id(&self) -> Option<&ImageId> {
        self.image_id.as_ref()
    }

    pub fn pull_base_image(&mut self, pull_policy: PullPolicy) -> Result<()> {
        let name = self.recipe.base.reference();
        let image = self.backend.get_image(&name)?;

        match (pull_policy, image) {
            (PullPolicy::IfNotPresent, None) | (PullPolicy::Always, _) => {
                info!("pulling base image {}", name.0);
                self.backend.pull_image(&name)?;
            }
            _ => info!("base image {} is present", name.0),
        }

        Ok(())
    }

    /// Builds the image unless the policy allows reusing an image with the
    /// same fingerprint. Returns the id of the image that was built.
    pub fn build_image(
        &mut self,
        build_policy: BuildPolicy,
        containerfile: &str,
        manifest: &Manifest,
    ) -> Result<Option<ImageId>> {
        let context = BuildContext::archive(&self.context, containerfile)?;
        let image_hash = self.image_hash(manifest, &context);

        if build_policy == BuildPolicy::IfChanged {
            let image = self
                .backend
                .get_image(&self.recipe.image)?
                .filter(|image| image.labels.get(LABEL_HASH) == Some(&image_hash));

            if let Some(image) = image {
                info!("image {} is up to date", self.recipe.image.0);
                self.image_id = Some(image.id);
                context.close()?;
                return Ok(None);
            }
        }

        let mut labels = Map::new();
        labels.insert(LABEL_PROJECT.to_owned(), self.recipe.project_name.clone());
        labels.insert(LABEL_HASH.to_owned(), image_hash);

        let spec = ImageBuildSpec {
            name: self.recipe.image.clone(),
            context: self.context.clone(),
            containerfile: containerfile.to_owned(),
            labels,
        };

        let image_id = self.backend.build_image(spec, &context)?;
        context.close()?;

        info!("built image {} ({})", self.recipe.image.0, image_id.0);
        self.image_id = Some(image_id.clone());
        Ok(Some(image_id))
    }

    /// The service container. `port` overrides the recipe's listening port
    /// through the port variable instead of changing the image.
    pub fn container_spec(&self, port: Option<u16>) -> ContainerSpec {
        let mut env = Map::new();
        let listen_port = match port {
            Some(port) => {
                env.insert(self.recipe.launch.port_env.clone(), port.to_string());
                port
            }
            None => self.recipe.port,
        };

        ContainerSpec {
            name: ContainerName(format!("{}_app", self.recipe.project_name)),
            image_name: self.recipe.image.clone(),
            env,
            publish: vec![format!("{}:{}", listen_port, listen_port)],
            labels: Map::new(),
        }
    }

    fn spec_hash(&self, spec: &ContainerSpec) -> String {
        let image_id = self
            .image_id
            .as_ref()
            .map(|id| id.0.trim_start_matches("sha256:"));
        hasher::digest((spec, image_id))
    }

    /// Finds containers labelled with this project that aren't the service
    /// container, e.g. left over after the project was renamed.
    pub fn find_orphans(&self, spec: &ContainerSpec) -> Vec<ContainerName> {
        let orphans = self
            .containers
            .keys()
            .filter(|name| **name != spec.name)
            .cloned()
            .collect();

        info!("found orphans: {:?}", orphans);
        orphans
    }

    pub fn start_containers_diff(
        &self,
        spec: &ContainerSpec,
    ) -> Vec<(ContainerName, ContainerOperation)> {
        let container = match self.containers.get(&spec.name) {
            Some(container) => container,
            None => return vec![(spec.name.clone(), ContainerOperation::Create)],
        };

        let spec_hash = self.spec_hash(spec);
        let image_changed = match (&self.image_id, &container.image) {
            (Some(current), Some(running)) => !current.same_image(running),
            _ => false,
        };
        let unchanged = !image_changed
            && container
                .labels
                .get(LABEL_HASH)
                .map(|hash| *hash == spec_hash)
                .unwrap_or(false);

        let operation = if unchanged {
            match container.status {
                ContainerStatus::Configured => Some(ContainerOperation::Start),
                ContainerStatus::Running => None,
                ContainerStatus::Exited => Some(ContainerOperation::Start),
                ContainerStatus::Unknown => Some(ContainerOperation::Recreate),
            }
        } else {
            Some(ContainerOperation::Recreate)
        };

        operation
            .map(|operation| vec![(spec.name.clone(), operation)])
            .unwrap_or_default()
    }

    pub fn stop_containers_diff(
        &self,
        spec: &ContainerSpec,
    ) -> Vec<(ContainerName, ContainerOperation)> {
        match self.containers.get(&spec.name) {
            Some(container) if container.status == ContainerStatus::Running => {
                vec![(spec.name.clone(), ContainerOperation::Stop)]
            }
            _ => vec![],
        }
    }

    pub fn remove_containers_diff(
        &self,
        spec: &ContainerSpec,
    ) -> Vec<(ContainerName, ContainerOperation)> {
        match self.containers.get(&spec.name) {
            Some(_container) => vec![(spec.name.clone(), ContainerOperation::Remove)],
            None => vec![],
        }
    }

    pub fn container_apply(
        &mut self,
        spec: &ContainerSpec,
        name: &ContainerName,
        operation: ContainerOperation,
        timeout: u32,
    ) -> Result<()> {
        let existing = |containers: &Map<ContainerName, Container>| -> Result<Container> {
            containers
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("could not find container {:?}", name))
        };

        match operation {
            ContainerOperation::Create => {
                let container_id = self.container_create(spec.clone())?;
                self.backend.start_container(&container_id.0)?;
            }
            ContainerOperation::Recreate => {
                let container = existing(&self.containers)?;
                if container.status == ContainerStatus::Running {
                    self.backend.stop_container(&container.id.0, timeout)?;
                }
                self.backend.remove_container(&container.id.0, false)?;
                let container_id = self.container_create(spec.clone())?;
                self.backend.start_container(&container_id.0)?;
            }
            ContainerOperation::Start => {
                let container = existing(&self.containers)?;
                self.backend.start_container(&container.id.0)?;
            }
            ContainerOperation::Stop => {
                let container = existing(&self.containers)?;
                self.backend.stop_container(&container.id.0, timeout)?;
            }
            ContainerOperation::Remove => {
                let container = existing(&self.containers)?;
                if container.status == ContainerStatus::Running {
                    self.backend.stop_container(&container.id.0, timeout)?;
                }
                self.backend.remove_container(&container.id.0, false)?;
            }
        }

        Ok(())
    }

    fn container_create(&mut self, mut spec: ContainerSpec) -> Result<ContainerId> {
        let hash = self.spec_hash(&spec);

        spec.labels
            .insert(LABEL_PROJECT.into(), self.recipe.project_name.clone());
        spec.labels.insert(LABEL_HASH.into(), hash);

        let id = self.backend.create_container(spec)?;

        Ok(id)
    }
}
