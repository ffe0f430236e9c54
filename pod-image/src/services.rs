use anyhow::Result;
use std::{collections::BTreeMap as Map, path::Path};

use crate::{
    context::BuildContext,
    models::{
        Container, ContainerId, ContainerName, ContainerSpec, Image, ImageBuildSpec, ImageId,
        ImageName, Recipe,
    },
    pipeline::Step,
};

pub trait RecipeFrontend {
    fn recipe(&mut self, project_name: &str, recipe_file_path: &Path) -> Result<Recipe>;
}

/// Carries out a single pipeline step. Returning an error aborts the pipeline.
pub trait StepExecutor {
    fn execute(&mut self, step: &Step) -> Result<()>;
}

pub trait ContainerBackend {
    fn get_image(&mut self, name: &ImageName) -> Result<Option<Image>>;

    fn pull_image(&mut self, name: &ImageName) -> Result<ImageId>;

    fn build_image(&mut self, spec: ImageBuildSpec, context: &BuildContext) -> Result<ImageId>;

    fn list_containers(
        &mut self,
        labels: Vec<(&str, &str)>,
    ) -> Result<Map<ContainerName, Container>>;

    fn create_container(&mut self, spec: ContainerSpec) -> Result<ContainerId>;

    fn start_container(&mut self, name: &str) -> Result<ContainerId>;

    fn stop_container(&mut self, name: &str, timeout: u32) -> Result<ContainerId>;

    fn remove_container(&mut self, name: &str, remove_volumes: bool) -> Result<ContainerId>;
}
