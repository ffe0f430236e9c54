use anyhow::{anyhow, Context, Result};
use crossterm::{
    cursor,
    style::{self, Colorize, Styler},
    QueueableCommand,
};
use log::{info, warn};
use std::{
    env,
    io::{stdout, Write},
    path::{Path, PathBuf},
};
use structopt::StructOpt;

use backends::{EngineBackend, DEFAULT_ENGINE};
use containerfile::ContainerfileWriter;
use controller::{ContainerOperation, Controller};
use frontends::{RecipeFile, RecipeFileFrontend};
use launch::{provision_runtime_dir, LaunchPlan};
use manifest::Manifest;
use models::{BuildPolicy, ContainerName, ContainerSpec, PullPolicy, Recipe};
use pipeline::{FailureKind, Pipeline};
use services::RecipeFrontend;

mod backends;
mod containerfile;
mod context;
mod controller;
mod frontends;
mod hasher;
mod launch;
mod manifest;
mod models;
mod pipeline;
mod services;

const RECIPE_FILE_NAMES: [&str; 2] = ["pod-image.yml", "pod-image.yaml"];

#[derive(Debug, StructOpt)]
#[structopt(
    name = "pod-image",
    about = "Builds and launches a containerized Python web service."
)]
struct Opt {
    #[structopt(short, long, env = "POD_IMAGE_FILE", parse(from_os_str))]
    /// Recipe file to use instead of searching for pod-image.yml.
    file: Option<PathBuf>,

    #[structopt(long, env = "POD_IMAGE_ENGINE", default_value = DEFAULT_ENGINE)]
    /// Container engine executable, podman or docker.
    engine: String,

    #[structopt(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, StructOpt)]
enum Cmd {
    /// Prints the Containerfile rendered from the recipe.
    Render,
    /// Builds the image.
    Build {
        #[structopt(short, long)]
        /// Always pull a newer version of the base image.
        pull: bool,
    },
    /// Builds the image if it changed and starts the service container.
    Up {
        #[structopt(long)]
        /// Build the image even if it is up to date.
        build: bool,

        #[structopt(long)]
        /// Listen on this port instead of the recipe's port.
        port: Option<u16>,

        #[structopt(long, default_value = "5")]
        timeout: u32,

        #[structopt(long)]
        remove_orphans: bool,
    },
    Down {
        #[structopt(long, default_value = "5")]
        timeout: u32,

        #[structopt(long)]
        remove_orphans: bool,
    },
    Stop {
        #[structopt(long, default_value = "5")]
        timeout: u32,

        #[structopt(long)]
        remove_orphans: bool,
    },
    /// Starts the server inside the image, listening on $PORT.
    Launch {
        #[structopt(long)]
        /// Print the command instead of running it.
        print: bool,
    },
}

fn find_recipe_file<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    for path in path.as_ref().ancestors() {
        for file_name in RECIPE_FILE_NAMES.iter() {
            let recipe_file_path = path.join(file_name);
            if recipe_file_path.exists() {
                return Some(recipe_file_path);
            }
        }
    }

    None
}

fn project_name(work_directory: &Path) -> Result<String> {
    work_directory
        .file_name()
        .and_then(|path| path.to_str())
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("Couldn't determine the project name."))
}

fn render(recipe: &Recipe) -> Result<String> {
    let mut writer = ContainerfileWriter::new();
    Pipeline::from_recipe(recipe).run(&mut writer)?;
    Ok(writer.finish())
}

fn read_manifest(path: &Path) -> Result<Manifest> {
    Manifest::read(path).context(FailureKind::DependencyResolution)
}

fn main() -> Result<()> {
    pretty_env_logger::init_custom_env("LOG");

    let opt = Opt::from_args();

    let current_dir = env::current_dir()?;
    let recipe_file_path = opt.file.clone().or_else(|| find_recipe_file(&current_dir));

    if let Cmd::Launch { print } = opt.cmd {
        return launch(recipe_file_path, &current_dir, print);
    }

    let recipe_file_path = recipe_file_path
        .ok_or_else(|| anyhow!("Couldn't find a pod-image.yml file in the current working directory or any of its parents."))?;
    info!("found recipe file {:?}", recipe_file_path);

    let work_directory = recipe_file_path
        .parent()
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .canonicalize()?;
    info!("found work directory {:?}", work_directory);

    env::set_current_dir(&work_directory)?;

    let project_name = project_name(&work_directory)?;
    info!("project name {:?}", project_name);

    let mut frontend = RecipeFileFrontend::new();
    let recipe = frontend.recipe(&project_name, &recipe_file_path)?;
    info!("parsed recipe");

    let containerfile = render(&recipe)?;

    if let Cmd::Render = opt.cmd {
        print!("{}", containerfile);
        return Ok(());
    }

    // Only building reads the manifest; tearing down must work without it.
    let manifest_path = work_directory.join(&recipe.manifest);

    let backend = EngineBackend::connect(&opt.engine)?;
    info!("connected to {}", opt.engine);

    let mut controller = Controller::init(recipe, &work_directory, backend)?;
    info!("created controller");

    let mut stdout = stdout();

    match opt.cmd {
        Cmd::Build { pull } => {
            let pull_policy = if pull {
                PullPolicy::Always
            } else {
                PullPolicy::IfNotPresent
            };

            let manifest = read_manifest(&manifest_path)?;

            controller.pull_base_image(pull_policy)?;
            controller.build_image(BuildPolicy::Always, &containerfile, &manifest)?;
        }
        Cmd::Up {
            build,
            port,
            timeout,
            remove_orphans,
        } => {
            let manifest = read_manifest(&manifest_path)?;
            let spec = controller.container_spec(port);
            check_orphans(&mut controller, &spec, &mut stdout, remove_orphans, timeout)?;

            controller.pull_base_image(PullPolicy::IfNotPresent)?;

            let build_policy = if build {
                BuildPolicy::Always
            } else {
                BuildPolicy::IfChanged
            };

            controller.build_image(build_policy, &containerfile, &manifest)?;

            let diff = controller.start_containers_diff(&spec);
            container_apply(&mut controller, &spec, &mut stdout, diff, timeout)?;
        }
        Cmd::Down {
            timeout,
            remove_orphans,
        } => {
            let spec = controller.container_spec(None);
            check_orphans(&mut controller, &spec, &mut stdout, remove_orphans, timeout)?;

            let diff = controller.remove_containers_diff(&spec);
            container_apply(&mut controller, &spec, &mut stdout, diff, timeout)?;
        }
        Cmd::Stop {
            timeout,
            remove_orphans,
        } => {
            let spec = controller.container_spec(None);
            check_orphans(&mut controller, &spec, &mut stdout, remove_orphans, timeout)?;

            let diff = controller.stop_containers_diff(&spec);
            container_apply(&mut controller, &spec, &mut stdout, diff, timeout)?;
        }
        Cmd::Render | Cmd::Launch { .. } => unreachable!("handled before connecting"),
    }

    Ok(())
}

/// Runs inside the image: resolves the port, makes sure the runtime
/// directory exists and replaces this process with the server.
fn launch(recipe_file_path: Option<PathBuf>, current_dir: &Path, print: bool) -> Result<()> {
    let recipe = match recipe_file_path {
        Some(recipe_file_path) => {
            let work_directory = recipe_file_path
                .parent()
                .filter(|path| !path.as_os_str().is_empty())
                .unwrap_or(current_dir);
            let project_name = project_name(&work_directory.canonicalize()?)?;
            RecipeFileFrontend::new().recipe(&project_name, &recipe_file_path)?
        }
        None => {
            warn!("no recipe file found, launching with defaults");
            RecipeFile::default().resolve(&project_name(current_dir)?)?
        }
    };

    let plan = LaunchPlan::from_env(&recipe.launch).context(FailureKind::LaunchMisconfiguration)?;

    if print {
        println!("{}", plan);
        return Ok(());
    }

    provision_runtime_dir(&recipe.runtime_dir).context(FailureKind::RuntimeDirectory)?;

    match plan.exec()? {}
}

/// Looks for orphans, if there are any and `remove_orphans` is set to true
/// they will be removed. Otherwise a message will be printed.
fn check_orphans(
    controller: &mut Controller,
    spec: &ContainerSpec,
    stdout: &mut impl Write,
    remove_orphans: bool,
    timeout: u32,
) -> Result<()> {
    let orphans = controller.find_orphans(spec);

    if !orphans.is_empty() {
        if remove_orphans {
            let diff = orphans
                .into_iter()
                .map(|name| (name, ContainerOperation::Remove))
                .collect();
            container_apply(controller, spec, stdout, diff, timeout)?;
        } else {
            stdout
                .queue(style::PrintStyledContent("INFO: ".cyan().bold()))?
                .queue(style::Print(
                    "found orphans, rerun with --remove-orphans to remove them.\n",
                ))?
                .flush()?;
        }
    } else {
        info!("found no orphans");
    }

    Ok(())
}

fn container_apply(
    controller: &mut Controller,
    spec: &ContainerSpec,
    stdout: &mut impl Write,
    operations: Vec<(ContainerName, ContainerOperation)>,
    timeout: u32,
) -> Result<()> {
    fn operation_verb(operation: ContainerOperation) -> &'static str {
        match operation {
            ContainerOperation::Create => "Creating",
            ContainerOperation::Recreate => "Recreating",
            ContainerOperation::Start => "Starting",
            ContainerOperation::Stop => "Stopping",
            ContainerOperation::Remove => "Removing",
        }
    }

    let lines = operations
        .iter()
        .map(|(container_name, operation)| {
            let verb = operation_verb(*operation);
            format!("{} {}", verb, container_name.0)
        })
        .collect::<Vec<_>>();

    let longest_line = lines.iter().map(|line| line.len()).max().unwrap_or(0);

    for line in lines.iter() {
        stdout.queue(style::Print(line))?;

        let padding = longest_line - line.len() + 1;
        stdout
            .queue(cursor::MoveRight(padding as u16))?
            .queue(style::Print("...\n"))?;
    }

    stdout.flush()?;

    for (line, (container_name, operation)) in operations.into_iter().enumerate() {
        controller.container_apply(spec, &container_name, operation, timeout)?;

        stdout
            .queue(cursor::SavePosition)?
            .queue(cursor::MoveToPreviousLine((lines.len() - line) as u16))?
            .queue(cursor::MoveRight(longest_line as u16 + 5))?
            .queue(style::PrintStyledContent("done".green().bold()))?
            .queue(cursor::RestorePosition)?
            .flush()?;
    }

    Ok(())
}
