use anyhow::{Context, Result};
use log::{info, warn};
use regex::Regex;
use std::{fs, path::Path};

/// One requirement line. The constraint is kept verbatim; resolving it is
/// the package installer's business.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub constraint: String,
}

impl Requirement {
    pub fn is_pinned(&self) -> bool {
        self.constraint.starts_with("==") && !self.constraint.contains('*')
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Manifest {
    pub contents: String,
    pub requirements: Vec<Requirement>,
}

impl Manifest {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Manifest> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("couldn't read dependency manifest {:?}", path))?;
        let manifest = Manifest::parse(contents);

        info!(
            "read {} requirements from {:?}",
            manifest.requirements.len(),
            path
        );
        for requirement in manifest.unpinned() {
            warn!(
                "requirement {:?} is not pinned, rebuilds may resolve a different version",
                requirement.name
            );
        }

        Ok(manifest)
    }

    pub fn parse(contents: String) -> Manifest {
        let line_re = Regex::new(r"^([A-Za-z0-9][A-Za-z0-9._-]*)(\[[^\]]*\])?\s*([^;#]*)")
            .expect("requirement pattern is valid");

        let requirements = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('-'))
            .filter_map(|line| line_re.captures(line))
            .map(|captures| Requirement {
                name: captures[1].to_string(),
                constraint: captures
                    .get(3)
                    .map(|m| m.as_str().trim().replace(' ', ""))
                    .unwrap_or_default(),
            })
            .collect();

        Manifest {
            contents,
            requirements,
        }
    }

    pub fn unpinned(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter().filter(|r| !r.is_pinned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIREMENTS: &str = r#"
# web
fastapi==0.104.1
uvicorn[standard]==0.24.0
psycopg2-binary == 2.9.9
sqlalchemy>=2.0
pydantic-settings
-r extra.txt
--index-url https://pypi.org/simple
python-jose[cryptography]==3.3.0 ; python_version >= "3.8"
"#;

    #[test]
    fn parses_requirement_lines() {
        let manifest = Manifest::parse(REQUIREMENTS.into());
        let names = manifest
            .requirements
            .iter()
            .map(|r| r.name.as_str())
            .collect::<Vec<_>>();

        assert_eq!(
            names,
            vec![
                "fastapi",
                "uvicorn",
                "psycopg2-binary",
                "sqlalchemy",
                "pydantic-settings",
                "python-jose"
            ]
        );
        assert_eq!(manifest.requirements[2].constraint, "==2.9.9");
        assert_eq!(manifest.requirements[5].constraint, "==3.3.0");
    }

    #[test]
    fn reports_unpinned_requirements() {
        let manifest = Manifest::parse(REQUIREMENTS.into());
        let unpinned = manifest.unpinned().map(|r| r.name.as_str()).collect::<Vec<_>>();

        assert_eq!(unpinned, vec!["sqlalchemy", "pydantic-settings"]);
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();

        let err = Manifest::read(dir.path().join("requirements.txt")).unwrap_err();

        assert!(err.to_string().contains("dependency manifest"));
    }
}
