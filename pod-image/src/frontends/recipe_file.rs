use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml;
use std::{
    collections::BTreeMap as Map,
    fs,
    path::{Component, Path, PathBuf},
};
use regex::Regex;
use thiserror::Error;

use crate::{
    models::{BaseImage, ImageName, LaunchSpec, Recipe},
    services::RecipeFrontend,
};

const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecipeError {
    #[error("entrypoint {0:?} must have the form `module:object`")]
    InvalidEntrypoint(String),

    #[error("app_root {0:?} must be an absolute path")]
    RelativeAppRoot(PathBuf),

    #[error("runtime_dir {0:?} must stay inside app_root")]
    RuntimeDirEscapes(PathBuf),

    #[error("port must be between 1 and 65535")]
    InvalidPort,

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0:?} is not a valid environment variable name")]
    InvalidVariableName(String),

    #[error("{field} {value:?} may only contain letters, digits and `_./:@%+=,-`")]
    InvalidShellWord { field: &'static str, value: String },
}

fn is_variable_name(name: &str) -> bool {
    let variable_re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("variable pattern is valid");
    variable_re.is_match(name)
}

/// Values pasted into the `sh -c` launch command must be a single plain word.
fn check_shell_word(field: &'static str, value: &str) -> Result<(), RecipeError> {
    let word_re = Regex::new(r"^[A-Za-z0-9_./:@%+=,-]+$").expect("word pattern is valid");
    if word_re.is_match(value) {
        Ok(())
    } else {
        Err(RecipeError::InvalidShellWord {
            field,
            value: value.into(),
        })
    }
}

/// On-disk shape of `pod-image.yml`. Every key is optional.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecipeFile {
    pub image: Option<String>,

    pub base: Base,

    pub native_packages: Vec<String>,

    pub manifest: String,

    pub app_root: String,

    pub runtime_dir: String,

    pub port: u16,

    pub port_env: String,

    pub server: String,

    pub entrypoint: String,

    pub host: String,

    pub env: MapList,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Base {
    pub runtime: String,
    pub tag: String,
}

impl Default for Base {
    fn default() -> Self {
        Base {
            runtime: "python".into(),
            tag: "3.11-slim".into(),
        }
    }
}

impl Default for RecipeFile {
    fn default() -> Self {
        RecipeFile {
            image: None,
            base: Base::default(),
            native_packages: vec![
                "gcc".into(),
                "libc6-dev".into(),
                "libpq-dev".into(),
                "postgresql-client".into(),
                "linux-libc-dev".into(),
            ],
            manifest: "requirements.txt".into(),
            app_root: "/app".into(),
            runtime_dir: "uploads".into(),
            port: DEFAULT_PORT,
            port_env: "PORT".into(),
            server: "uvicorn".into(),
            entrypoint: "app.main:app".into(),
            host: "0.0.0.0".into(),
            env: MapList::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MapList {
    Map(Map<String, String>),
    List(Vec<String>),
}

impl Default for MapList {
    fn default() -> Self {
        MapList::List(Vec::new())
    }
}

impl MapList {
    pub fn to_map(self) -> Map<String, String> {
        match self {
            MapList::Map(map) => map,
            MapList::List(list) => list.into_iter().map(MapList::split_value).collect(),
        }
    }

    fn split_value(value: String) -> (String, String) {
        match value.find('=') {
            Some(split_index) => {
                let (key, value) = value.split_at(split_index);
                (key.into(), value[1..].into())
            }
            None => (value, "".into()),
        }
    }
}

impl RecipeFile {
    /// Validates the file and fills in everything derived from the project.
    pub fn resolve(self, project_name: &str) -> Result<Recipe, RecipeError> {
        if self.base.runtime.is_empty() || self.base.tag.is_empty() {
            return Err(RecipeError::Empty("base"));
        }
        if self.manifest.is_empty() {
            return Err(RecipeError::Empty("manifest"));
        }
        if self.server.is_empty() {
            return Err(RecipeError::Empty("server"));
        }
        if self.port_env.is_empty() {
            return Err(RecipeError::Empty("port_env"));
        }
        if !is_variable_name(&self.port_env) {
            return Err(RecipeError::InvalidVariableName(self.port_env));
        }
        check_shell_word("server", &self.server)?;
        check_shell_word("host", &self.host)?;
        check_shell_word("entrypoint", &self.entrypoint)?;
        if self.port == 0 {
            return Err(RecipeError::InvalidPort);
        }

        match self.entrypoint.split_once(':') {
            Some((module, object)) if !module.is_empty() && !object.is_empty() => (),
            _ => return Err(RecipeError::InvalidEntrypoint(self.entrypoint)),
        }

        let app_root = PathBuf::from(&self.app_root);
        if !app_root.is_absolute() {
            return Err(RecipeError::RelativeAppRoot(app_root));
        }

        let runtime_dir = PathBuf::from(&self.runtime_dir);
        let escapes = runtime_dir
            .components()
            .any(|component| component == Component::ParentDir);
        if escapes || (runtime_dir.is_absolute() && !runtime_dir.starts_with(&app_root)) {
            return Err(RecipeError::RuntimeDirEscapes(runtime_dir));
        }
        let runtime_dir = app_root.join(runtime_dir);

        let env = self.env.to_map();
        if let Some(key) = env.keys().find(|key| !is_variable_name(key)) {
            return Err(RecipeError::InvalidVariableName(key.clone()));
        }

        let image = match self.image {
            Some(image) => ImageName(image),
            None => ImageName(format!("{}_app", project_name)),
        };

        Ok(Recipe {
            project_name: project_name.into(),
            image,
            base: BaseImage {
                runtime: self.base.runtime,
                tag: self.base.tag,
            },
            native_packages: self.native_packages,
            manifest: PathBuf::from(self.manifest),
            app_root,
            runtime_dir,
            port: self.port,
            launch: LaunchSpec {
                server: self.server,
                entrypoint: self.entrypoint,
                host: self.host,
                port_env: self.port_env,
                default_port: self.port,
                env,
            },
        })
    }
}

pub struct RecipeFileFrontend;

impl RecipeFileFrontend {
    pub fn new() -> RecipeFileFrontend {
        RecipeFileFrontend
    }
}

impl RecipeFrontend for RecipeFileFrontend {
    fn recipe(&mut self, project_name: &str, recipe_file_path: &Path) -> Result<Recipe> {
        let contents = fs::read_to_string(recipe_file_path)
            .with_context(|| format!("couldn't read recipe file {:?}", recipe_file_path))?;

        // An empty recipe means "all defaults".
        let file: RecipeFile = if contents.trim().is_empty() {
            RecipeFile::default()
        } else {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("couldn't parse recipe file {:?}", recipe_file_path))?
        };
        let recipe = file.resolve(project_name)?;

        Ok(recipe)
    }
}
