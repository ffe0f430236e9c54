use log::{debug, info};
use std::{fmt, path::PathBuf};
use thiserror::Error;

use crate::{
    models::{BaseImage, LaunchSpec, Recipe},
    services::StepExecutor,
};

/// Where the image stands after a step has completed. The order is strict:
/// each stage can only be entered from the one before it.
#[derive(Copy, Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub enum Stage {
    BaseSelected,
    NativeDepsInstalled,
    PackageManagerBootstrapped,
    DepsInstalled,
    SourceCopied,
    RuntimeDirReady,
    PortDeclared,
    Launched,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::BaseSelected,
        Stage::NativeDepsInstalled,
        Stage::PackageManagerBootstrapped,
        Stage::DepsInstalled,
        Stage::SourceCopied,
        Stage::RuntimeDirReady,
        Stage::PortDeclared,
        Stage::Launched,
    ];

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::BaseSelected => Some(Stage::NativeDepsInstalled),
            Stage::NativeDepsInstalled => Some(Stage::PackageManagerBootstrapped),
            Stage::PackageManagerBootstrapped => Some(Stage::DepsInstalled),
            Stage::DepsInstalled => Some(Stage::SourceCopied),
            Stage::SourceCopied => Some(Stage::RuntimeDirReady),
            Stage::RuntimeDirReady => Some(Stage::PortDeclared),
            Stage::PortDeclared => Some(Stage::Launched),
            Stage::Launched => None,
        }
    }

    /// The class of failure raised when entering this stage fails.
    pub fn failure_kind(self) -> FailureKind {
        match self {
            Stage::BaseSelected => FailureKind::BaseImageResolution,
            Stage::NativeDepsInstalled => FailureKind::NativePackageInstallation,
            Stage::PackageManagerBootstrapped | Stage::DepsInstalled => {
                FailureKind::DependencyResolution
            }
            Stage::SourceCopied => FailureKind::SourceCopy,
            Stage::RuntimeDirReady => FailureKind::RuntimeDirectory,
            Stage::PortDeclared | Stage::Launched => FailureKind::LaunchMisconfiguration,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::BaseSelected => "base selected",
            Stage::NativeDepsInstalled => "native dependencies installed",
            Stage::PackageManagerBootstrapped => "package manager bootstrapped",
            Stage::DepsInstalled => "dependencies installed",
            Stage::SourceCopied => "source copied",
            Stage::RuntimeDirReady => "runtime directory ready",
            Stage::PortDeclared => "port declared",
            Stage::Launched => "launched",
        };
        f.write_str(name)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailureKind {
    BaseImageResolution,
    NativePackageInstallation,
    DependencyResolution,
    SourceCopy,
    RuntimeDirectory,
    LaunchMisconfiguration,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::BaseImageResolution => "base image resolution failure",
            FailureKind::NativePackageInstallation => "native package installation failure",
            FailureKind::DependencyResolution => "dependency resolution failure",
            FailureKind::SourceCopy => "source copy failure",
            FailureKind::RuntimeDirectory => "runtime directory creation failure",
            FailureKind::LaunchMisconfiguration => "launch misconfiguration",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{kind} while entering stage `{stage}`: {source}")]
    StepFailed {
        stage: Stage,
        kind: FailureKind,
        reached: Option<Stage>,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Step {
    SelectBase(BaseImage),
    InstallNativePackages(Vec<String>),
    BootstrapInstaller,
    InstallDependencies { manifest: PathBuf, app_root: PathBuf },
    CopySource { app_root: PathBuf },
    ProvisionRuntimeDir(PathBuf),
    DeclarePort(u16),
    Launch(LaunchSpec),
}

impl Step {
    /// The stage the image is in once this step succeeds.
    pub fn stage(&self) -> Stage {
        match self {
            Step::SelectBase(_) => Stage::BaseSelected,
            Step::InstallNativePackages(_) => Stage::NativeDepsInstalled,
            Step::BootstrapInstaller => Stage::PackageManagerBootstrapped,
            Step::InstallDependencies { .. } => Stage::DepsInstalled,
            Step::CopySource { .. } => Stage::SourceCopied,
            Step::ProvisionRuntimeDir(_) => Stage::RuntimeDirReady,
            Step::DeclarePort(_) => Stage::PortDeclared,
            Step::Launch(_) => Stage::Launched,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn from_recipe(recipe: &Recipe) -> Pipeline {
        let steps = vec![
            Step::SelectBase(recipe.base.clone()),
            Step::InstallNativePackages(recipe.native_packages.clone()),
            Step::BootstrapInstaller,
            Step::InstallDependencies {
                manifest: recipe.manifest.clone(),
                app_root: recipe.app_root.clone(),
            },
            Step::CopySource {
                app_root: recipe.app_root.clone(),
            },
            Step::ProvisionRuntimeDir(recipe.runtime_dir.clone()),
            Step::DeclarePort(recipe.port),
            Step::Launch(recipe.launch.clone()),
        ];

        Pipeline { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Runs every step in order and returns the terminal stage. The first
    /// failing step stops the run; nothing after it is executed.
    pub fn run<E: StepExecutor>(&self, executor: &mut E) -> Result<Stage, PipelineError> {
        let mut reached: Option<Stage> = None;

        for step in self.steps.iter() {
            let stage = step.stage();
            if let Some(previous) = reached {
                debug_assert_eq!(previous.next(), Some(stage));
            }
            debug!("entering stage {}", stage);

            executor
                .execute(step)
                .map_err(|source| PipelineError::StepFailed {
                    stage,
                    kind: stage.failure_kind(),
                    reached,
                    source,
                })?;

            reached = Some(stage);
        }

        let reached = reached.unwrap_or(Stage::Launched);
        info!("pipeline reached stage {}", reached);
        Ok(reached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontends::RecipeFile;
    use anyhow::anyhow;

    #[derive(Default)]
    struct RecordingExecutor {
        executed: Vec<Stage>,
        fail_at: Option<Stage>,
    }

    impl StepExecutor for RecordingExecutor {
        fn execute(&mut self, step: &Step) -> anyhow::Result<()> {
            if self.fail_at == Some(step.stage()) {
                return Err(anyhow!("no matching distribution found for not-a-real-package"));
            }
            self.executed.push(step.stage());
            Ok(())
        }
    }

    fn recipe() -> Recipe {
        RecipeFile::default().resolve("medlink").unwrap()
    }

    #[test]
    fn stages_form_a_single_chain() {
        let mut stage = Stage::BaseSelected;
        let mut visited = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            visited.push(next);
            stage = next;
        }

        assert_eq!(visited, Stage::ALL.to_vec());
    }

    #[test]
    fn steps_follow_stage_order() {
        let pipeline = Pipeline::from_recipe(&recipe());
        let stages = pipeline.steps().iter().map(Step::stage).collect::<Vec<_>>();

        assert_eq!(stages, Stage::ALL.to_vec());
    }

    #[test]
    fn run_reaches_launched() {
        let pipeline = Pipeline::from_recipe(&recipe());
        let mut executor = RecordingExecutor::default();

        let stage = pipeline.run(&mut executor).unwrap();

        assert_eq!(stage, Stage::Launched);
        assert_eq!(executor.executed, Stage::ALL.to_vec());
    }

    #[test]
    fn dependency_failure_stops_before_source_copy() {
        let pipeline = Pipeline::from_recipe(&recipe());
        let mut executor = RecordingExecutor {
            fail_at: Some(Stage::DepsInstalled),
            ..Default::default()
        };

        let err = pipeline.run(&mut executor).unwrap_err();

        let PipelineError::StepFailed {
            stage,
            kind,
            reached,
            ..
        } = err;
        assert_eq!(stage, Stage::DepsInstalled);
        assert_eq!(kind, FailureKind::DependencyResolution);
        assert_eq!(reached, Some(Stage::PackageManagerBootstrapped));
        assert!(!executor.executed.contains(&Stage::SourceCopied));
        assert_eq!(executor.executed.len(), 3);
    }

    #[test]
    fn base_failure_runs_nothing() {
        let pipeline = Pipeline::from_recipe(&recipe());
        let mut executor = RecordingExecutor {
            fail_at: Some(Stage::BaseSelected),
            ..Default::default()
        };

        let err = pipeline.run(&mut executor).unwrap_err();

        assert!(executor.executed.is_empty());
        assert!(err.to_string().starts_with("base image resolution failure"));
    }
}
