//! Build manifest parsing
//!
//! A manifest is a JSON document describing the application and the
//! modules to build into it. Module entries may be inline objects or paths
//! to module files; paths are resolved against the directory of the
//! document that names them, which is passed down explicitly while loading.
//!
//! Keys starting with `x-` are kept verbatim in an extension table and
//! written back on serialization. Any other unknown key is an error.

pub mod module;

pub use module::{Module, ModuleEntry, Source};

use crate::checksum::Checksum;
use crate::error::{BuildError, BuildResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Maximum include nesting, guards against include cycles
const MAX_INCLUDE_DEPTH: usize = 32;

/// Options that shape the build environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BuildOptions {
    /// Extra environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Exported as `CFLAGS`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cflags: Option<String>,

    /// Prepended to `PATH`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepend_path: Option<String>,

    /// Appended to `PATH`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_path: Option<String>,
}

impl BuildOptions {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Options from `self` overridden by anything set in `other`
    pub fn merged_with(&self, other: &BuildOptions) -> BuildOptions {
        let mut env = self.env.clone();
        env.extend(other.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        BuildOptions {
            env,
            cflags: other.cflags.clone().or_else(|| self.cflags.clone()),
            prepend_path: other
                .prepend_path
                .clone()
                .or_else(|| self.prepend_path.clone()),
            append_path: other
                .append_path
                .clone()
                .or_else(|| self.append_path.clone()),
        }
    }

    /// Fold order: env (sorted `K=V` list), cflags, then the compat path fields
    pub fn checksum(&self, c: &mut Checksum) {
        let env: Vec<String> = self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        c.update_strv(Some(env.as_slice()));
        c.update_str(self.cflags.as_deref());
        c.update_compat_str("prepend-path", self.prepend_path.as_deref());
        c.update_compat_str("append-path", self.append_path.as_deref());
    }
}

/// Top-level application manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Manifest {
    /// Application id, e.g. `org.example.App`
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk: Option<String>,

    /// Command recorded as the application entry point
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "BuildOptions::is_empty")]
    pub build_options: BuildOptions,

    #[serde(default)]
    pub modules: Vec<ModuleEntry>,

    /// Paths removed from `files/` in the cleanup stage
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup: Vec<String>,

    /// Commands run in `files/` after cleanup patterns are applied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup_commands: Vec<String>,

    /// Arguments recorded in the finish stage
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finish_args: Vec<String>,

    /// `x-` prefixed extension keys, preserved as-is
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl Manifest {
    /// Load a manifest file and every module file it includes
    pub fn load(path: &Path) -> BuildResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BuildError::io(format!("reading manifest {}", path.display()), e))?;
        Self::parse(&content, path)
    }

    /// Parse manifest text as if it were read from `path`
    ///
    /// Module includes are resolved against the parent directory of `path`.
    pub fn parse(content: &str, path: &Path) -> BuildResult<Self> {
        let mut manifest: Manifest =
            serde_json::from_str(content).map_err(|e| invalid(path, e.to_string()))?;

        if manifest.id.trim().is_empty() {
            return Err(invalid(path, "'id' must not be empty"));
        }
        check_extensions(&manifest.extensions, path)?;

        let base_dir = base_dir_of(path);
        module::resolve_entries(&mut manifest.modules, &base_dir, 0)?;
        manifest.check_module_names(path)?;
        Ok(manifest)
    }

    fn check_module_names(&self, path: &Path) -> BuildResult<()> {
        let mut seen = HashSet::new();
        for module in self.all_modules() {
            let name = module.name.as_str();
            if name.is_empty() || name.contains('/') || name.starts_with('.') {
                return Err(invalid(path, format!("invalid module name {:?}", name)));
            }
            if !seen.insert(name) {
                return Err(invalid(path, format!("duplicate module name {:?}", name)));
            }
        }
        Ok(())
    }

    /// Every resolved module, nested modules before their parent
    fn all_modules(&self) -> Vec<&Module> {
        let mut out = Vec::new();
        module::collect(&self.modules, false, &mut out);
        out
    }

    /// Modules to build, in build order: nested modules first, disabled ones skipped
    pub fn enabled_modules(&self) -> Vec<&Module> {
        let mut out = Vec::new();
        module::collect(&self.modules, true, &mut out);
        out
    }

    /// Branch key for this manifest on `arch`
    pub fn branch_key(&self, arch: &str) -> String {
        format!("{}-{}", arch, escape_ref_component(&self.id))
    }

    /// Material for the `init` stage
    pub fn checksum_init(&self, c: &mut Checksum) {
        c.update_str(Some(self.id.as_str()));
        c.update_str(self.runtime.as_deref());
        c.update_str(self.runtime_version.as_deref());
        c.update_str(self.sdk.as_deref());
        self.build_options.checksum(c);
    }

    /// Material for the `cleanup` stage
    pub fn checksum_cleanup(&self, c: &mut Checksum) {
        c.update_strv(Some(self.cleanup.as_slice()));
        c.update_strv(Some(self.cleanup_commands.as_slice()));
        for module in self.enabled_modules() {
            c.update_str(Some(module.name.as_str()));
            c.update_strv(Some(module.cleanup.as_slice()));
        }
    }

    /// Material for the `finish` stage
    pub fn checksum_finish(&self, c: &mut Checksum) {
        c.update_str(self.command.as_deref());
        c.update_strv(Some(self.finish_args.as_slice()));
    }

    /// Serialize with includes inlined
    pub fn to_json_pretty(&self) -> BuildResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Escape a string for use as one ref path component
///
/// Bytes outside `[A-Za-z0-9._-]` are percent-escaped, then `%` becomes `_`.
pub fn escape_ref_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "_{:02X}", b);
        }
    }
    out
}

pub(crate) fn invalid(path: &Path, reason: impl Into<String>) -> BuildError {
    BuildError::ManifestInvalid {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

pub(crate) fn check_extensions(
    extensions: &BTreeMap<String, serde_json::Value>,
    path: &Path,
) -> BuildResult<()> {
    match extensions.keys().find(|k| !k.starts_with("x-")) {
        Some(key) => Err(invalid(path, format!("unknown field {:?}", key))),
        None => Ok(()),
    }
}

pub(crate) fn base_dir_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO: &str = r#"{
        "id": "org.example.Hello",
        "runtime": "org.example.Platform",
        "runtime-version": "24.08",
        "sdk": "org.example.Sdk",
        "command": "hello",
        "build-options": { "env": { "V": "1" }, "cflags": "-O2" },
        "modules": [
            { "name": "hello", "build-commands": ["install -D hello.sh $PREFIX/bin/hello"] }
        ],
        "cleanup": ["/include", "*.a"],
        "finish-args": ["--share=network"],
        "x-maintainer": { "name": "someone" }
    }"#;

    fn parse(content: &str) -> BuildResult<Manifest> {
        Manifest::parse(content, Path::new("/nonexistent/app.json"))
    }

    fn digest(f: impl FnOnce(&mut Checksum)) -> String {
        let mut c = Checksum::new();
        f(&mut c);
        c.digest()
    }

    #[test]
    fn parse_full_manifest() {
        let m = parse(HELLO).unwrap();
        assert_eq!(m.id, "org.example.Hello");
        assert_eq!(m.runtime_version.as_deref(), Some("24.08"));
        assert_eq!(m.build_options.env["V"], "1");
        assert_eq!(m.cleanup, vec!["/include", "*.a"]);
        assert_eq!(m.enabled_modules().len(), 1);
        assert_eq!(m.extensions.len(), 1);
    }

    #[test]
    fn extensions_survive_round_trip() {
        let m = parse(HELLO).unwrap();
        let json = m.to_json_pretty().unwrap();
        assert!(json.contains("x-maintainer"));
        let back = parse(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn unknown_non_extension_key_is_rejected() {
        let err = parse(r#"{"id": "a.b", "colour": "red"}"#).unwrap_err();
        assert!(err.to_string().contains("colour"));
    }

    #[test]
    fn empty_id_is_rejected() {
        assert!(parse(r#"{"id": " "}"#).is_err());
        assert!(parse(r#"{"modules": []}"#).is_err());
    }

    #[test]
    fn duplicate_module_names_are_rejected() {
        let err = parse(r#"{"id": "a.b", "modules": [{"name": "m"}, {"name": "m"}]}"#).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn module_name_with_slash_is_rejected() {
        assert!(parse(r#"{"id": "a.b", "modules": [{"name": "a/b"}]}"#).is_err());
    }

    #[test]
    fn includes_resolve_relative_to_including_file() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("modules/deps")).unwrap();
        std::fs::write(
            root.join("app.json"),
            r#"{"id": "org.example.App", "modules": ["modules/lib.json", {"name": "app"}]}"#,
        )
        .unwrap();
        // Nested include is relative to modules/, not to the manifest
        std::fs::write(
            root.join("modules/lib.json"),
            r#"{"name": "lib", "modules": ["deps/zlib.json"], "sources": [{"type": "file", "path": "lib.patch"}]}"#,
        )
        .unwrap();
        std::fs::write(root.join("modules/deps/zlib.json"), r#"{"name": "zlib"}"#).unwrap();

        let m = Manifest::load(&root.join("app.json")).unwrap();
        let names: Vec<&str> = m.enabled_modules().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["zlib", "lib", "app"]);

        let lib = m.enabled_modules()[1];
        assert_eq!(lib.base_dir, root.join("modules"));
        let zlib = m.enabled_modules()[0];
        assert_eq!(zlib.base_dir, root.join("modules/deps"));
    }

    #[test]
    fn missing_include_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("app.json");
        std::fs::write(&path, r#"{"id": "a.b", "modules": ["nope.json"]}"#).unwrap();
        assert!(Manifest::load(&path).is_err());
    }

    #[test]
    fn disabled_modules_and_their_children_are_skipped() {
        let m = parse(
            r#"{"id": "a.b", "modules": [
                {"name": "off", "disabled": true, "modules": [{"name": "child"}]},
                {"name": "on"}
            ]}"#,
        )
        .unwrap();
        let names: Vec<&str> = m.enabled_modules().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["on"]);
    }

    #[test]
    fn branch_key_escapes_unsafe_bytes() {
        let m = parse(r#"{"id": "org.example/App x"}"#).unwrap();
        assert_eq!(m.branch_key("x86_64"), "x86_64-org.example_2FApp_20x");
        assert_eq!(escape_ref_component("a-b_c.D9"), "a-b_c.D9");
        assert_eq!(escape_ref_component("é"), "_C3_A9");
    }

    #[test]
    fn init_checksum_tracks_runtime_and_options() {
        let base = parse(HELLO).unwrap();
        let mut changed = base.clone();
        changed.runtime_version = Some("25.08".to_string());
        assert_ne!(
            digest(|c| base.checksum_init(c)),
            digest(|c| changed.checksum_init(c))
        );

        let mut env = base.clone();
        env.build_options.env.insert("W".to_string(), "2".to_string());
        assert_ne!(
            digest(|c| base.checksum_init(c)),
            digest(|c| env.checksum_init(c))
        );
    }

    #[test]
    fn unset_compat_build_options_keep_digest() {
        let opts = BuildOptions {
            cflags: Some("-O2".to_string()),
            ..Default::default()
        };
        let old = digest(|c| {
            c.update_strv::<String>(Some(&[][..]));
            c.update_str(Some("-O2"));
        });
        assert_eq!(digest(|c| opts.checksum(c)), old);

        let with_path = BuildOptions {
            append_path: Some("/opt/bin".to_string()),
            ..opts
        };
        assert_ne!(digest(|c| with_path.checksum(c)), old);
    }

    #[test]
    fn prepend_and_append_path_are_distinct() {
        let prepend = BuildOptions {
            prepend_path: Some("/opt/tools/bin".to_string()),
            ..Default::default()
        };
        let append = BuildOptions {
            append_path: Some("/opt/tools/bin".to_string()),
            ..Default::default()
        };
        assert_ne!(digest(|c| prepend.checksum(c)), digest(|c| append.checksum(c)));
    }

    #[test]
    fn extensions_do_not_affect_checksums() {
        let a = parse(r#"{"id": "a.b"}"#).unwrap();
        let b = parse(r#"{"id": "a.b", "x-note": "hi"}"#).unwrap();
        assert_eq!(digest(|c| a.checksum_init(c)), digest(|c| b.checksum_init(c)));
        assert_eq!(
            digest(|c| a.checksum_finish(c)),
            digest(|c| b.checksum_finish(c))
        );
    }

    #[test]
    fn cleanup_checksum_includes_module_cleanup() {
        let a = parse(r#"{"id": "a.b", "modules": [{"name": "m"}]}"#).unwrap();
        let b = parse(r#"{"id": "a.b", "modules": [{"name": "m", "cleanup": ["/share/doc"]}]}"#)
            .unwrap();
        assert_ne!(
            digest(|c| a.checksum_cleanup(c)),
            digest(|c| b.checksum_cleanup(c))
        );
    }

    #[test]
    fn merged_options_prefer_module_values() {
        let global = BuildOptions {
            env: BTreeMap::from([("A".to_string(), "1".to_string()), ("B".to_string(), "1".to_string())]),
            cflags: Some("-O2".to_string()),
            ..Default::default()
        };
        let module = BuildOptions {
            env: BTreeMap::from([("B".to_string(), "2".to_string())]),
            append_path: Some("/x".to_string()),
            ..Default::default()
        };
        let merged = global.merged_with(&module);
        assert_eq!(merged.env["A"], "1");
        assert_eq!(merged.env["B"], "2");
        assert_eq!(merged.cflags.as_deref(), Some("-O2"));
        assert_eq!(merged.append_path.as_deref(), Some("/x"));
    }
}
