use anyhow::{anyhow, Context, Result};
use ignore::{
    gitignore::{Gitignore, GitignoreBuilder},
    WalkBuilder,
};
use log::{debug, info};
use number_prefix::NumberPrefix;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};
use tar::{Builder as TarBuilder, Header};
use tempfile::TempDir;

use crate::hasher::DigestHasher;

pub const CONTAINERFILE_NAME: &str = "Containerfile";

/// Only the first of these found at the context root is read.
const IGNORE_FILES: [&str; 2] = [".containerignore", ".dockerignore"];

/// The archived build context. The archive lives as long as this value.
pub struct BuildContext {
    temp_dir: TempDir,
    archive_path: PathBuf,
    size: u64,
    digest: String,
    entries: Vec<PathBuf>,
}

/// Ignore patterns are relative to the context root, so every pattern is
/// anchored there; nested ignore files are not read.
fn anchor_pattern(pattern: &str) -> String {
    let (negation, pattern) = match pattern.strip_prefix('!') {
        Some(pattern) => ("!", pattern.trim()),
        None => ("", pattern),
    };
    let pattern = pattern.trim_start_matches("./").trim_start_matches('/');

    format!("{}/{}", negation, pattern)
}

fn ignore_matcher(context: &Path) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(context);

    let ignore_file = IGNORE_FILES
        .iter()
        .map(|file_name| context.join(file_name))
        .find(|path| path.is_file());

    if let Some(ignore_file) = ignore_file {
        debug!("reading ignore patterns from {:?}", ignore_file);
        let contents = fs::read_to_string(&ignore_file)
            .with_context(|| format!("couldn't read {:?}", ignore_file))?;

        for line in contents.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            builder.add_line(Some(ignore_file.clone()), &anchor_pattern(line))?;
        }
    }

    Ok(builder.build()?)
}

impl BuildContext {
    /// Archives `context` verbatim, except for what the ignore file excludes,
    /// and adds the rendered `containerfile` at the archive root. The digest
    /// covers every archived path and its contents.
    pub fn archive<P: AsRef<Path>>(context: P, containerfile: &str) -> Result<BuildContext> {
        let context = context.as_ref();
        let matcher = ignore_matcher(context)?;
        let temp_dir = TempDir::new()?;
        let archive_path = temp_dir.path().join("context.tar");
        let archive = {
            let mut options = OpenOptions::new();
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            options.write(true).create(true).open(&archive_path)?
        };

        let mut tar = TarBuilder::new(archive);
        tar.follow_symlinks(false);

        let walk = WalkBuilder::new(context)
            .standard_filters(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();

        let mut hasher = blake3::Hasher::new();
        let mut size = 0;
        let mut entries = Vec::new();
        for result in walk {
            let result = result?;
            let relative = result.path().strip_prefix(context)?;
            if relative.as_os_str().is_empty() || relative == Path::new(CONTAINERFILE_NAME) {
                continue;
            }

            let file_type = result
                .file_type()
                .ok_or_else(|| anyhow!("couldn't determine the file type of {:?}", result.path()))?;
            if matcher
                .matched_path_or_any_parents(relative, file_type.is_dir())
                .is_ignore()
            {
                debug!("ignoring {:?}", relative);
                continue;
            }

            debug!("adding {:?} to build context", relative);
            tar.append_path_with_name(result.path(), relative)
                .with_context(|| format!("couldn't archive {:?}", result.path()))?;

            hasher.input(relative);
            if file_type.is_file() {
                let mut file = File::open(result.path())?;
                size += io::copy(&mut file, &mut hasher)?;
            } else if file_type.is_symlink() {
                hasher.input(fs::read_link(result.path())?);
            }
            entries.push(relative.to_path_buf());
        }

        let mut header = Header::new_gnu();
        header.set_size(containerfile.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, CONTAINERFILE_NAME, containerfile.as_bytes())?;
        hasher.input(CONTAINERFILE_NAME);
        hasher.update(containerfile.as_bytes());
        size += containerfile.len() as u64;
        entries.push(PathBuf::from(CONTAINERFILE_NAME));

        tar.into_inner()?.sync_all()?;

        match NumberPrefix::binary(size as f32) {
            NumberPrefix::Standalone(bytes) => info!("archived build context ({} bytes)", bytes),
            NumberPrefix::Prefixed(prefix, n) => {
                info!("archived build context ({:.1} {}B)", n, prefix)
            }
        };

        Ok(BuildContext {
            temp_dir,
            archive_path,
            size,
            digest: hasher.finalize().to_hex().to_string(),
            entries,
        })
    }

    pub fn open(&self) -> Result<File> {
        File::open(&self.archive_path)
            .map_err(|err| anyhow!("couldn't open build context {:?}: {}", self.archive_path, err))
    }

    /// Bytes of file content in the archive.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Paths in the archive, relative to the context root.
    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn close(self) -> Result<()> {
        self.temp_dir.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, io::Read};

    fn project() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("app/api")).unwrap();
        fs::create_dir_all(dir.path().join(".venv/lib")).unwrap();
        fs::write(dir.path().join("app/main.py"), "app = None\n").unwrap();
        fs::write(dir.path().join("app/api/media.py"), "").unwrap();
        fs::write(dir.path().join(".venv/lib/site.py"), "").unwrap();
        fs::write(dir.path().join(".env"), "SECRET_KEY=x\n").unwrap();
        fs::write(dir.path().join("requirements.txt"), "fastapi==0.104.1\n").unwrap();
        dir
    }

    #[test]
    fn archives_whole_tree_with_containerfile() {
        let dir = project();

        let context = BuildContext::archive(dir.path(), "FROM python:3.11-slim\n").unwrap();

        let entries = context.entries();
        assert!(entries.contains(&PathBuf::from("app/main.py")));
        assert!(entries.contains(&PathBuf::from("app/api/media.py")));
        assert!(entries.contains(&PathBuf::from(".venv/lib/site.py")));
        assert!(entries.contains(&PathBuf::from(".env")));
        assert!(entries.contains(&PathBuf::from(CONTAINERFILE_NAME)));
    }

    #[test]
    fn honors_dockerignore() {
        let dir = project();
        fs::write(dir.path().join(".dockerignore"), ".venv/\n.env\n").unwrap();

        let context = BuildContext::archive(dir.path(), "FROM scratch\n").unwrap();

        let entries = context.entries();
        assert!(entries.contains(&PathBuf::from("app/main.py")));
        assert!(!entries.iter().any(|e| e.starts_with(".venv")));
        assert!(!entries.contains(&PathBuf::from(".env")));
    }

    #[test]
    fn archive_contains_rendered_containerfile() {
        let dir = project();
        fs::write(dir.path().join(CONTAINERFILE_NAME), "FROM stale\n").unwrap();

        let context = BuildContext::archive(dir.path(), "FROM python:3.11-slim\n").unwrap();

        let mut archive = tar::Archive::new(context.open().unwrap());
        let mut found = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap() == Path::new(CONTAINERFILE_NAME) {
                let mut contents = String::new();
                entry.read_to_string(&mut contents).unwrap();
                found.push(contents);
            }
        }

        assert_eq!(found, vec!["FROM python:3.11-slim\n".to_string()]);
    }

    #[test]
    fn ignore_patterns_are_anchored_at_the_root() {
        let dir = project();
        fs::write(dir.path().join("main.py"), "").unwrap();
        fs::write(dir.path().join(".dockerignore"), "main.py\n").unwrap();

        let context = BuildContext::archive(dir.path(), "FROM scratch\n").unwrap();

        let entries = context.entries();
        assert!(!entries.contains(&PathBuf::from("main.py")));
        assert!(entries.contains(&PathBuf::from("app/main.py")));
    }

    #[test]
    fn nested_ignore_files_are_not_read() {
        let dir = project();
        fs::write(dir.path().join("app/.dockerignore"), "main.py\n").unwrap();

        let context = BuildContext::archive(dir.path(), "FROM scratch\n").unwrap();

        assert!(context.entries().contains(&PathBuf::from("app/main.py")));
        assert!(context
            .entries()
            .contains(&PathBuf::from("app/.dockerignore")));
    }

    #[test]
    fn containerignore_takes_precedence() {
        let dir = project();
        fs::write(dir.path().join(".containerignore"), ".env\n").unwrap();
        fs::write(dir.path().join(".dockerignore"), "app/\n").unwrap();

        let context = BuildContext::archive(dir.path(), "FROM scratch\n").unwrap();

        let entries = context.entries();
        assert!(!entries.contains(&PathBuf::from(".env")));
        assert!(entries.contains(&PathBuf::from("app/main.py")));
    }

    #[test]
    fn negated_patterns_keep_files() {
        let dir = project();
        fs::write(dir.path().join(".dockerignore"), "app/api\n!app/api/media.py\n").unwrap();

        let context = BuildContext::archive(dir.path(), "FROM scratch\n").unwrap();

        assert!(context
            .entries()
            .contains(&PathBuf::from("app/api/media.py")));
    }

    #[test]
    fn size_counts_file_contents_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("app/api")).unwrap();
        fs::write(dir.path().join("app/main.py"), "app = None\n").unwrap();

        let containerfile = "FROM scratch\n";
        let context = BuildContext::archive(dir.path(), containerfile).unwrap();

        assert_eq!(
            context.size(),
            ("app = None\n".len() + containerfile.len()) as u64
        );
    }

    #[test]
    fn digest_follows_source_contents() {
        let dir = project();

        let first = BuildContext::archive(dir.path(), "FROM scratch\n").unwrap();
        let second = BuildContext::archive(dir.path(), "FROM scratch\n").unwrap();
        assert_eq!(first.digest(), second.digest());

        fs::write(dir.path().join("app/main.py"), "app = object()\n").unwrap();
        let edited = BuildContext::archive(dir.path(), "FROM scratch\n").unwrap();
        assert_ne!(first.digest(), edited.digest());

        let other_containerfile = BuildContext::archive(dir.path(), "FROM python\n").unwrap();
        assert_ne!(edited.digest(), other_containerfile.digest());
    }
}
