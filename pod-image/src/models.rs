use std::{collections::BTreeMap as Map, fmt, path::PathBuf};

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageId(pub String);

impl ImageId {
    /// Engines disagree on whether ids carry the `sha256:` prefix.
    pub fn same_image(&self, other: &ImageId) -> bool {
        let strip = |id: &str| id.trim_start_matches("sha256:").to_owned();
        strip(&self.0) == strip(&other.0)
    }
}

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageName(pub String);

#[derive(Clone, Debug)]
pub struct Image {
    pub id: ImageId,
    pub labels: Map<String, String>,
}

/// Immutable identity of the starting filesystem layer.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct BaseImage {
    pub runtime: String,
    pub tag: String,
}

impl BaseImage {
    pub fn reference(&self) -> ImageName {
        ImageName(format!("{}:{}", self.runtime, self.tag))
    }
}

impl fmt::Display for BaseImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.runtime, self.tag)
    }
}

/// The process the image hands control to once it is started.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct LaunchSpec {
    pub server: String,
    pub entrypoint: String,
    pub host: String,
    pub port_env: String,
    pub default_port: u16,
    pub env: Map<String, String>,
}

/// A fully resolved build recipe. Every path inside the image is absolute.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Recipe {
    pub project_name: String,
    pub image: ImageName,
    pub base: BaseImage,
    pub native_packages: Vec<String>,
    pub manifest: PathBuf,
    pub app_root: PathBuf,
    pub runtime_dir: PathBuf,
    pub port: u16,
    pub launch: LaunchSpec,
}

#[derive(Clone, Debug, Hash)]
pub struct ImageBuildSpec {
    pub name: ImageName,
    pub context: PathBuf,
    pub containerfile: String,
    pub labels: Map<String, String>,
}

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerName(pub String);

#[derive(Clone, Debug, Hash)]
pub struct Container {
    pub id: ContainerId,
    pub name: ContainerName,
    pub image: Option<ImageId>,
    pub status: ContainerStatus,
    pub labels: Map<String, String>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum ContainerStatus {
    Configured,
    Running,
    Exited,
    Unknown,
}

#[derive(Clone, Debug, Hash)]
pub struct ContainerSpec {
    pub name: ContainerName,
    pub image_name: ImageName,
    pub env: Map<String, String>,
    pub publish: Vec<String>,
    pub labels: Map<String, String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildPolicy {
    Always,
    IfChanged,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
}
