//! Modules and their sources

use super::{base_dir_of, check_extensions, invalid, BuildOptions, MAX_INCLUDE_DEPTH};
use crate::checksum::Checksum;
use crate::error::{BuildError, BuildResult};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// One buildable module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Module {
    pub name: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,

    /// Shell commands run in the module's build directory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_commands: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,

    /// Paths removed from `files/` in the cleanup stage
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup: Vec<String>,

    #[serde(default, skip_serializing_if = "BuildOptions::is_empty")]
    pub build_options: BuildOptions,

    /// Subdirectory of the extracted sources to build in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,

    /// Nested modules, built before this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<ModuleEntry>,

    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,

    /// Directory relative source paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Module {
    /// Name of this module's build stage
    pub fn stage_name(&self) -> String {
        format!("build-{}", self.name)
    }

    /// Material for this module's build stage
    ///
    /// Fold order: name, build commands, build options, source count, each
    /// source, then the compat `subdir`.
    pub fn checksum(&self, c: &mut Checksum) -> BuildResult<()> {
        c.update_str(Some(self.name.as_str()));
        c.update_strv(Some(self.build_commands.as_slice()));
        self.build_options.checksum(c);
        c.update_u32(u32::try_from(self.sources.len()).unwrap_or(u32::MAX));
        for source in &self.sources {
            source.checksum(c, &self.base_dir)?;
        }
        c.update_compat_str("subdir", self.subdir.as_deref());
        Ok(())
    }

    /// Place every source into `build_dir`
    pub fn extract_sources(&self, build_dir: &Path) -> BuildResult<()> {
        for source in &self.sources {
            source.extract(&self.base_dir, build_dir)?;
        }
        Ok(())
    }
}

/// A module as written in a manifest: inline, or a path to a module file
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ModuleEntry {
    Include(String),
    Inline(Box<Module>),
}

impl<'de> Deserialize<'de> for ModuleEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(path) => Ok(Self::Include(path)),
            serde_json::Value::Object(_) => serde_json::from_value(value)
                .map(|m| Self::Inline(Box::new(m)))
                .map_err(D::Error::custom),
            _ => Err(D::Error::custom(
                "module must be an object or a path to a module file",
            )),
        }
    }
}

/// Load includes and record each module's base directory, recursively
pub(super) fn resolve_entries(
    entries: &mut [ModuleEntry],
    base_dir: &Path,
    depth: usize,
) -> BuildResult<()> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(invalid(base_dir, "module includes nested too deeply"));
    }

    for entry in entries.iter_mut() {
        let module = match entry {
            ModuleEntry::Include(rel) => {
                let path = base_dir.join(rel.as_str());
                debug!("Loading module file {}", path.display());
                let content = fs::read_to_string(&path).map_err(|e| {
                    BuildError::io(format!("reading module file {}", path.display()), e)
                })?;
                let mut module: Module = serde_json::from_str(&content)
                    .map_err(|e| invalid(&path, e.to_string()))?;
                check_extensions(&module.extensions, &path)?;
                module.base_dir = base_dir_of(&path);
                module
            }
            ModuleEntry::Inline(module) => {
                check_extensions(&module.extensions, base_dir)?;
                let mut module = (**module).clone();
                module.base_dir = base_dir.to_path_buf();
                module
            }
        };

        if let Some(subdir) = module.subdir.as_deref() {
            if !is_relative_inside(subdir) {
                return Err(invalid(&module.base_dir, format!("invalid subdir {:?}", subdir)));
            }
        }
        for source in &module.sources {
            source.validate(&module.base_dir)?;
        }

        let mut module = module;
        let nested_base = module.base_dir.clone();
        resolve_entries(&mut module.modules, &nested_base, depth + 1)?;
        *entry = ModuleEntry::Inline(Box::new(module));
    }
    Ok(())
}

/// Depth-first collection, nested modules before their parent
pub(super) fn collect<'a>(entries: &'a [ModuleEntry], enabled_only: bool, out: &mut Vec<&'a Module>) {
    for entry in entries {
        if let ModuleEntry::Inline(module) = entry {
            if enabled_only && module.disabled {
                continue;
            }
            collect(&module.modules, enabled_only, out);
            out.push(module);
        }
    }
}

/// Where a module's input files come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Source {
    /// A local file, relative to the declaring document
    File {
        path: String,
        #[serde(
            rename = "dest-filename",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        dest_filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
    },
    /// Literal file contents
    Inline {
        contents: String,
        #[serde(rename = "dest-filename")]
        dest_filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
    },
}

impl Source {
    fn validate(&self, base_dir: &Path) -> BuildResult<()> {
        let (dest_filename, dest) = match self {
            Self::File {
                dest_filename, dest, ..
            } => (dest_filename.as_deref(), dest.as_deref()),
            Self::Inline {
                dest_filename,
                dest,
                ..
            } => (Some(dest_filename.as_str()), dest.as_deref()),
        };

        if let Some(name) = dest_filename {
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                return Err(invalid(base_dir, format!("invalid dest-filename {:?}", name)));
            }
        }
        if let Some(dest) = dest {
            if !is_relative_inside(dest) {
                return Err(invalid(base_dir, format!("invalid dest {:?}", dest)));
            }
        }
        Ok(())
    }

    /// Fold order: type tag, then the fields as declared, `dest` last as compat
    pub fn checksum(&self, c: &mut Checksum, base_dir: &Path) -> BuildResult<()> {
        match self {
            Self::File {
                path,
                dest_filename,
                dest,
            } => {
                c.update_str(Some("file"));
                c.update_str(Some(path.as_str()));
                c.update_file(&base_dir.join(path))?;
                c.update_str(dest_filename.as_deref());
                c.update_compat_str("dest", dest.as_deref());
            }
            Self::Inline {
                contents,
                dest_filename,
                dest,
            } => {
                c.update_str(Some("inline"));
                c.update_str(Some(contents.as_str()));
                c.update_str(Some(dest_filename.as_str()));
                c.update_compat_str("dest", dest.as_deref());
            }
        }
        Ok(())
    }

    /// Copy or write this source into `build_dir`
    pub fn extract(&self, base_dir: &Path, build_dir: &Path) -> BuildResult<()> {
        match self {
            Self::File {
                path,
                dest_filename,
                dest,
            } => {
                let src = base_dir.join(path);
                let name = match dest_filename {
                    Some(name) => name.clone(),
                    None => src
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .ok_or_else(|| invalid(&src, "file source has no file name"))?,
                };
                let target = target_dir(build_dir, dest.as_deref())?.join(name);
                fs::copy(&src, &target).map_err(|e| {
                    BuildError::io(format!("copying {} to {}", src.display(), target.display()), e)
                })?;
            }
            Self::Inline {
                contents,
                dest_filename,
                dest,
            } => {
                let target = target_dir(build_dir, dest.as_deref())?.join(dest_filename);
                fs::write(&target, contents)
                    .map_err(|e| BuildError::io(format!("writing {}", target.display()), e))?;
            }
        }
        Ok(())
    }
}

fn target_dir(build_dir: &Path, dest: Option<&str>) -> BuildResult<PathBuf> {
    let dir = match dest {
        Some(dest) => build_dir.join(dest),
        None => build_dir.to_path_buf(),
    };
    fs::create_dir_all(&dir)
        .map_err(|e| BuildError::io(format!("creating {}", dir.display()), e))?;
    Ok(dir)
}

/// Relative path that cannot escape its base
fn is_relative_inside(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn module(json: &str, base_dir: &Path) -> Module {
        let mut entries = vec![serde_json::from_str::<ModuleEntry>(json).unwrap()];
        resolve_entries(&mut entries, base_dir, 0).unwrap();
        match entries.pop() {
            Some(ModuleEntry::Inline(m)) => *m,
            other => panic!("unexpected entry {:?}", other),
        }
    }

    fn digest(m: &Module) -> String {
        let mut c = Checksum::new();
        m.checksum(&mut c).unwrap();
        c.digest()
    }

    #[test]
    fn entry_accepts_path_or_object() {
        let e: ModuleEntry = serde_json::from_str(r#""mods/a.json""#).unwrap();
        assert_eq!(e, ModuleEntry::Include("mods/a.json".to_string()));
        let e: ModuleEntry = serde_json::from_str(r#"{"name": "a"}"#).unwrap();
        assert!(matches!(e, ModuleEntry::Inline(_)));
        assert!(serde_json::from_str::<ModuleEntry>("42").is_err());
    }

    #[test]
    fn stage_name_prefix() {
        let temp = TempDir::new().unwrap();
        assert_eq!(module(r#"{"name": "zlib"}"#, temp.path()).stage_name(), "build-zlib");
    }

    #[test]
    fn source_file_contents_affect_checksum() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("main.c"), "int main(){}").unwrap();
        let m = module(
            r#"{"name": "a", "sources": [{"type": "file", "path": "main.c"}]}"#,
            temp.path(),
        );
        let before = digest(&m);
        std::fs::write(temp.path().join("main.c"), "int main(){return 1;}").unwrap();
        assert_ne!(before, digest(&m));
    }

    #[test]
    fn missing_source_file_fails_checksum() {
        let temp = TempDir::new().unwrap();
        let m = module(
            r#"{"name": "a", "sources": [{"type": "file", "path": "gone.c"}]}"#,
            temp.path(),
        );
        let mut c = Checksum::new();
        assert!(m.checksum(&mut c).is_err());
    }

    #[test]
    fn build_commands_affect_checksum() {
        let temp = TempDir::new().unwrap();
        let a = module(r#"{"name": "a", "build-commands": ["make"]}"#, temp.path());
        let b = module(r#"{"name": "a", "build-commands": ["make", "make install"]}"#, temp.path());
        assert_ne!(digest(&a), digest(&b));
    }

    #[test]
    fn unset_subdir_keeps_digest_and_set_subdir_changes_it() {
        let temp = TempDir::new().unwrap();
        let plain = module(r#"{"name": "a"}"#, temp.path());
        let empty = module(r#"{"name": "a", "subdir": ""}"#, temp.path());
        let set = module(r#"{"name": "a", "subdir": "src"}"#, temp.path());
        assert_eq!(digest(&plain), digest(&empty));
        assert_ne!(digest(&plain), digest(&set));
    }

    #[test]
    fn source_dest_and_module_subdir_are_distinct() {
        let temp = TempDir::new().unwrap();
        let dest = module(
            r#"{"name": "a", "sources": [
                {"type": "inline", "contents": "x", "dest-filename": "f", "dest": "src"}
            ]}"#,
            temp.path(),
        );
        let subdir = module(
            r#"{"name": "a", "subdir": "src", "sources": [
                {"type": "inline", "contents": "x", "dest-filename": "f"}
            ]}"#,
            temp.path(),
        );
        assert_ne!(digest(&dest), digest(&subdir));
    }

    #[test]
    fn cleanup_does_not_affect_build_checksum() {
        let temp = TempDir::new().unwrap();
        let a = module(r#"{"name": "a"}"#, temp.path());
        let b = module(r#"{"name": "a", "cleanup": ["/lib/*.la"]}"#, temp.path());
        assert_eq!(digest(&a), digest(&b));
    }

    #[test]
    fn extract_places_sources() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("hello.sh"), "echo hi").unwrap();
        let m = module(
            r#"{"name": "a", "sources": [
                {"type": "file", "path": "hello.sh"},
                {"type": "file", "path": "hello.sh", "dest-filename": "copy.sh", "dest": "sub"},
                {"type": "inline", "contents": "x=1", "dest-filename": "config"}
            ]}"#,
            temp.path(),
        );
        let build = temp.path().join("build");
        std::fs::create_dir_all(&build).unwrap();
        m.extract_sources(&build).unwrap();

        assert_eq!(std::fs::read_to_string(build.join("hello.sh")).unwrap(), "echo hi");
        assert_eq!(std::fs::read_to_string(build.join("sub/copy.sh")).unwrap(), "echo hi");
        assert_eq!(std::fs::read_to_string(build.join("config")).unwrap(), "x=1");
    }

    #[test]
    fn escaping_destinations_are_rejected() {
        let temp = TempDir::new().unwrap();
        let mut entries = vec![serde_json::from_str::<ModuleEntry>(
            r#"{"name": "a", "sources": [{"type": "inline", "contents": "", "dest-filename": "f", "dest": "../up"}]}"#,
        )
        .unwrap()];
        assert!(resolve_entries(&mut entries, temp.path(), 0).is_err());

        let mut entries = vec![serde_json::from_str::<ModuleEntry>(
            r#"{"name": "a", "sources": [{"type": "inline", "contents": "", "dest-filename": "a/b"}]}"#,
        )
        .unwrap()];
        assert!(resolve_entries(&mut entries, temp.path(), 0).is_err());
    }

    #[test]
    fn unknown_module_key_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mut entries = vec![serde_json::from_str::<ModuleEntry>(
            r#"{"name": "a", "config-opts": ["--x"]}"#,
        )
        .unwrap()];
        assert!(resolve_entries(&mut entries, temp.path(), 0).is_err());
    }

    #[test]
    fn include_cycle_is_bounded() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("loop.json"),
            r#"{"name": "loop", "modules": ["loop.json"]}"#,
        )
        .unwrap();
        let mut entries = vec![ModuleEntry::Include("loop.json".to_string())];
        assert!(resolve_entries(&mut entries, temp.path(), 0).is_err());
    }
}
