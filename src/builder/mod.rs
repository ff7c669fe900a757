//! Stage driver
//!
//! Runs a manifest through the fixed stage sequence against the cache:
//!
//! 1. `init` writes `metadata` and creates `files/`
//! 2. `build-<module>` for each enabled module, nested modules first
//! 3. `cleanup` applies cleanup patterns and runs cleanup commands
//! 4. `finish` records the command and finish arguments
//!
//! Every stage folds its material, looks it up, and only on a miss brings
//! the app directory up to date, does the work and commits. After the last
//! stage the app directory is materialized and garbage collection runs; a
//! collection failure is logged and reported but never fails the build.

pub mod cleanup;
pub mod runner;

pub use runner::{CommandRunner, CommandSpec, HostRunner};

use crate::cache::gc::{self, GcReport};
use crate::cache::BuildCache;
use crate::error::{BuildError, BuildResult};
use crate::manifest::{Manifest, Module};
use crate::store::{Change, CommitStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const INIT_STAGE: &str = "init";
pub const CLEANUP_STAGE: &str = "cleanup";
pub const FINISH_STAGE: &str = "finish";

/// Store directory under the state dir
pub const CACHE_DIR: &str = "cache";
/// Per-module build directories under the state dir
pub const BUILD_DIR: &str = "build";

/// Architecture of the running host
pub fn default_arch() -> &'static str {
    std::env::consts::ARCH
}

/// Everything about a build that does not come from the manifest
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub app_dir: PathBuf,
    pub state_dir: PathBuf,
    pub arch: String,
    /// Force every stage to miss while still populating the cache
    pub disable_cache: bool,
    /// Empty a non-empty app directory instead of refusing to build
    pub force_clean: bool,
    /// Stop before building this module
    pub stop_at: Option<String>,
    pub run_gc: bool,
    pub prune_other_branches: bool,
    pub keep_build_dirs: bool,
}

impl BuildRequest {
    pub fn new(app_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_dir: app_dir.into(),
            state_dir: state_dir.into(),
            arch: default_arch().to_string(),
            disable_cache: false,
            force_clean: false,
            stop_at: None,
            run_gc: true,
            prune_other_branches: true,
            keep_build_dirs: false,
        }
    }
}

/// Result of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageOutcome {
    pub stage: String,
    pub cached: bool,
}

/// What a finished build did
#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub branch: String,
    pub stages: Vec<StageOutcome>,
    /// Module the build stopped before, if any
    pub stopped_at: Option<String>,
    /// Changes between the branch tip at start and the final state
    pub changes: Vec<Change>,
    pub gc: Option<GcReport>,
    /// Collection error, downgraded to a warning
    pub gc_error: Option<String>,
}

type StageCallback<'a> = Box<dyn Fn(&str) + Send + Sync + 'a>;

/// Drives one build
pub struct Builder<'a> {
    manifest: &'a Manifest,
    runner: &'a dyn CommandRunner,
    request: BuildRequest,
    store: Option<Box<dyn CommitStore>>,
    on_stage: Option<StageCallback<'a>>,
}

impl<'a> Builder<'a> {
    pub fn new(manifest: &'a Manifest, runner: &'a dyn CommandRunner, request: BuildRequest) -> Self {
        Self {
            manifest,
            runner,
            request,
            store: None,
            on_stage: None,
        }
    }

    /// Use this store instead of opening one under the state dir
    pub fn with_store(mut self, store: Box<dyn CommitStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Called with each stage name before it is looked up
    pub fn on_stage(mut self, f: impl Fn(&str) + Send + Sync + 'a) -> Self {
        self.on_stage = Some(Box::new(f));
        self
    }

    pub async fn run(mut self) -> BuildResult<BuildSummary> {
        self.request.app_dir = absolute(&self.request.app_dir)?;
        self.request.state_dir = absolute(&self.request.state_dir)?;

        let modules = self.manifest.enabled_modules();
        if let Some(stop) = &self.request.stop_at {
            if !modules.iter().any(|m| &m.name == stop) {
                return Err(BuildError::ModuleNotFound(stop.clone()));
            }
        }

        self.prepare_app_dir()?;

        let branch = self.manifest.branch_key(&self.request.arch);
        let mut cache = match self.store.take() {
            Some(store) => BuildCache::with_store(store, &branch, &self.request.app_dir)?,
            None => BuildCache::open(
                &self.request.state_dir.join(CACHE_DIR),
                &branch,
                &self.request.app_dir,
            )?,
        };
        if self.request.disable_cache {
            info!("Cache lookups disabled, rebuilding every stage");
            cache.disable_lookups();
        }

        let mut stages = Vec::new();

        self.manifest.checksum_init(cache.checksum());
        if self.begin(&mut cache, INIT_STAGE, &mut stages)? {
            self.init_app_dir()?;
            cache.commit(INIT_STAGE, &format!("Initialize {}", self.manifest.id))?;
        }

        let mut stopped_at = None;
        for module in &modules {
            if self.request.stop_at.as_deref() == Some(module.name.as_str()) {
                info!("Stopping before module {}", module.name);
                stopped_at = Some(module.name.clone());
                break;
            }

            let stage = module.stage_name();
            module.checksum(cache.checksum())?;
            if self.begin(&mut cache, &stage, &mut stages)? {
                self.build_module(module).await?;
                cache.commit(&stage, &format!("Build {}", module.name))?;
                let changed = cache.changes_since_last_stage()?;
                debug!("{} changed {} path(s)", stage, changed.len());
            }
        }

        if stopped_at.is_none() {
            self.manifest.checksum_cleanup(cache.checksum());
            if self.begin(&mut cache, CLEANUP_STAGE, &mut stages)? {
                self.cleanup_app_dir(&modules).await?;
                cache.commit(CLEANUP_STAGE, "Cleanup")?;
            }

            self.manifest.checksum_finish(cache.checksum());
            if self.begin(&mut cache, FINISH_STAGE, &mut stages)? {
                self.write_metadata(true)?;
                cache.commit(FINISH_STAGE, "Finish")?;
            }
        }

        cache.ensure_checkout()?;
        let changes = cache.changes_since_session_start()?;

        let (gc, gc_error) = if self.request.run_gc {
            match gc::run(&mut cache, self.request.prune_other_branches) {
                Ok(report) => (Some(report), None),
                Err(e) => {
                    warn!("Cache garbage collection failed: {}", e);
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        Ok(BuildSummary {
            branch,
            stages,
            stopped_at,
            changes,
            gc,
            gc_error,
        })
    }

    /// Look up a stage; on a miss, bring the app dir up to date and return true
    fn begin(
        &self,
        cache: &mut BuildCache,
        stage: &str,
        stages: &mut Vec<StageOutcome>,
    ) -> BuildResult<bool> {
        if let Some(f) = &self.on_stage {
            f(stage);
        }

        let status = cache.lookup(stage)?;
        stages.push(StageOutcome {
            stage: stage.to_string(),
            cached: status.is_hit(),
        });
        if status.is_hit() {
            info!("Cache hit for {}, skipping", stage);
            return Ok(false);
        }

        cache.ensure_checkout()?;
        info!("Running stage {}", stage);
        Ok(true)
    }

    fn prepare_app_dir(&self) -> BuildResult<()> {
        let app_dir = &self.request.app_dir;
        let non_empty = match fs::read_dir(app_dir) {
            Ok(mut entries) => entries.next().is_some(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(BuildError::io(format!("reading {}", app_dir.display()), e));
            }
        };

        if non_empty {
            if !self.request.force_clean {
                return Err(BuildError::CheckoutNotEmpty(app_dir.clone()));
            }
            info!("Emptying app directory {}", app_dir.display());
            fs::remove_dir_all(app_dir)
                .map_err(|e| BuildError::io(format!("removing {}", app_dir.display()), e))?;
        }
        Ok(())
    }

    fn init_app_dir(&self) -> BuildResult<()> {
        let files = self.request.app_dir.join("files");
        fs::create_dir_all(&files)
            .map_err(|e| BuildError::io(format!("creating {}", files.display()), e))?;
        self.write_metadata(false)
    }

    fn write_metadata(&self, finished: bool) -> BuildResult<()> {
        let path = self.request.app_dir.join("metadata");
        let content = render_metadata(self.manifest, &self.request.arch, finished);
        fs::write(&path, content)
            .map_err(|e| BuildError::io(format!("writing {}", path.display()), e))
    }

    /// Build one module in a fresh directory; the directory is kept on failure
    async fn build_module(&self, module: &Module) -> BuildResult<()> {
        let build_dir = self.request.state_dir.join(BUILD_DIR).join(&module.name);
        if build_dir.exists() {
            fs::remove_dir_all(&build_dir)
                .map_err(|e| BuildError::io(format!("removing {}", build_dir.display()), e))?;
        }
        fs::create_dir_all(&build_dir)
            .map_err(|e| BuildError::io(format!("creating {}", build_dir.display()), e))?;

        module.extract_sources(&build_dir)?;

        let cwd = match module.subdir.as_deref() {
            Some(subdir) if !subdir.is_empty() => build_dir.join(subdir),
            _ => build_dir.clone(),
        };
        let env = self.command_env(Some(module));
        for command in &module.build_commands {
            self.runner
                .run(&CommandSpec {
                    command: command.clone(),
                    cwd: cwd.clone(),
                    env: env.clone(),
                })
                .await?;
        }

        if !self.request.keep_build_dirs {
            fs::remove_dir_all(&build_dir)
                .map_err(|e| BuildError::io(format!("removing {}", build_dir.display()), e))?;
        }
        Ok(())
    }

    async fn cleanup_app_dir(&self, modules: &[&Module]) -> BuildResult<()> {
        let files = self.request.app_dir.join("files");

        let mut patterns = self.manifest.cleanup.clone();
        for module in modules {
            patterns.extend(module.cleanup.iter().cloned());
        }
        let removed = cleanup::remove_matching(&files, &patterns)?;
        if !removed.is_empty() {
            info!("Cleanup removed {} path(s)", removed.len());
        }

        let env = self.command_env(None);
        for command in &self.manifest.cleanup_commands {
            self.runner
                .run(&CommandSpec {
                    command: command.clone(),
                    cwd: files.clone(),
                    env: env.clone(),
                })
                .await?;
        }
        Ok(())
    }

    /// Environment for build and cleanup commands
    fn command_env(&self, module: Option<&Module>) -> BTreeMap<String, String> {
        let options = match module {
            Some(m) => self.manifest.build_options.merged_with(&m.build_options),
            None => self.manifest.build_options.clone(),
        };

        let mut env = options.env;
        let prefix = self.request.app_dir.join("files");
        env.insert("PREFIX".to_string(), prefix.display().to_string());
        env.insert(
            "APP_DIR".to_string(),
            self.request.app_dir.display().to_string(),
        );
        env.insert("STAGEBUILD_ARCH".to_string(), self.request.arch.clone());
        if let Some(m) = module {
            env.insert("STAGEBUILD_MODULE".to_string(), m.name.clone());
        }
        if let Some(cflags) = options.cflags {
            env.insert("CFLAGS".to_string(), cflags);
        }

        if options.prepend_path.is_some() || options.append_path.is_some() {
            let mut parts: Vec<String> = Vec::new();
            parts.extend(options.prepend_path);
            let inherited = std::env::var("PATH").unwrap_or_default();
            if !inherited.is_empty() {
                parts.push(inherited);
            }
            parts.extend(options.append_path);
            env.insert("PATH".to_string(), parts.join(":"));
        }
        env
    }
}

/// Key-file style application metadata
fn render_metadata(manifest: &Manifest, arch: &str, finished: bool) -> String {
    let mut out = String::from("[Application]\n");
    out.push_str(&format!("name={}\n", manifest.id));
    let version = manifest.runtime_version.as_deref().unwrap_or("master");
    if let Some(runtime) = &manifest.runtime {
        out.push_str(&format!("runtime={}/{}/{}\n", runtime, arch, version));
    }
    if let Some(sdk) = &manifest.sdk {
        out.push_str(&format!("sdk={}/{}/{}\n", sdk, arch, version));
    }
    if finished {
        if let Some(command) = &manifest.command {
            out.push_str(&format!("command={}\n", command));
        }
        if !manifest.finish_args.is_empty() {
            out.push_str("\n[Finish]\n");
            out.push_str(&format!("args={};\n", manifest.finish_args.join(";")));
        }
    }
    out
}

fn absolute(path: &Path) -> BuildResult<PathBuf> {
    std::path::absolute(path)
        .map_err(|e| BuildError::io(format!("resolving {}", path.display()), e))
}
