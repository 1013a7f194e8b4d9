use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::acm::AuthDefaults;
use crate::repo::BuildProfile;

#[derive(Serialize, Deserialize, Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Configuration {
    #[clap(long, default_value_os_t = default_content_repo_home())]
    #[serde(default = "default_content_repo_home")]
    /// Root directory holding the bare content repos as `account/repo.git`
    pub content_repo_home: PathBuf,

    #[clap(long, default_value_os_t = default_cache_dir())]
    #[serde(default = "default_cache_dir")]
    /// Directory for pipeline artifacts; safe to wipe
    pub cache_dir: PathBuf,

    #[clap(long, default_value_os_t = default_workspace_home())]
    #[serde(default = "default_workspace_home")]
    /// Per-account build workspaces and logs
    pub workspace_home: PathBuf,

    #[clap(long, default_value_os_t = default_search_db())]
    #[serde(default = "default_search_db")]
    /// Path of the full-text search database
    pub search_db: PathBuf,

    #[clap(long, default_value_t = default_host())]
    #[serde(default = "default_host")]
    /// Bind the webserver to `<host>`
    pub host: String,

    #[clap(long, default_value_t = default_port())]
    #[serde(default = "default_port")]
    /// Bind the webserver to `<port>`
    pub port: u16,

    #[clap(long, default_value_t = default_mount_path())]
    #[serde(default = "default_mount_path")]
    /// Path prefix the content API is mounted under
    pub mount_path: String,

    #[clap(long, default_value_t = default_updates_host())]
    #[serde(default = "default_updates_host")]
    /// Bind the post-receive hook listener to `<host>`
    pub updates_host: String,

    #[clap(long, default_value_t = default_updates_port())]
    #[serde(default = "default_updates_port")]
    /// Bind the post-receive hook listener to `<port>`
    pub updates_port: u16,

    #[clap(long, default_value_t = default_cache_control())]
    #[serde(default = "default_cache_control")]
    /// Cache-Control sent when no fileset overrides it
    pub default_cache_control: String,

    #[clap(long)]
    #[serde(default)]
    /// Repo used when an address names only the account
    pub default_repo: Option<String>,

    #[clap(long)]
    #[serde(default)]
    /// External build tool; builds are disabled when unset
    pub build_command: Option<String>,

    #[clap(long, default_value_t = default_search_cache_quota())]
    #[serde(default = "default_search_cache_quota")]
    /// Per-branch byte quota for cached search results
    pub search_cache_quota: u64,

    #[clap(long, default_value_t = default_gc_interval_secs())]
    #[serde(default = "default_gc_interval_secs")]
    /// Seconds between cache sweeps
    pub gc_interval_secs: u64,

    #[clap(long, default_value_t = default_gc_max_age_days())]
    #[serde(default = "default_gc_max_age_days")]
    /// Cache entries unread for this many days are swept
    pub gc_max_age_days: u64,

    #[clap(long = "gc-preserve", num_args = 0.., default_values_t = default_gc_preserve())]
    #[serde(default = "default_gc_preserve")]
    /// Cache globs the sweeper never touches
    pub gc_preserve: Vec<String>,

    #[clap(skip)]
    #[serde(default)]
    pub auth: AuthDefaults,

    #[clap(skip)]
    #[serde(default)]
    /// Named build profiles referenced by repo manifests
    pub build_profiles: HashMap<String, BuildProfile>,
}

impl Configuration {
    /// Directory where logs are written to
    pub fn log_dir(&self) -> PathBuf {
        self.cache_dir.join("logs")
    }

    pub fn search_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("publish_cache").join("search")
    }

    /// Persistent per-request file DBs for the query API
    pub fn idb_dir(&self) -> PathBuf {
        self.cache_dir.join("idb")
    }
}

fn project_dir(leaf: &str) -> PathBuf {
    match directories::ProjectDirs::from("sh", "locomote", "locomote") {
        Some(dirs) => dirs.data_dir().join(leaf),
        None => PathBuf::from("locomote").join(leaf),
    }
}

fn default_content_repo_home() -> PathBuf {
    project_dir("content")
}

fn default_cache_dir() -> PathBuf {
    project_dir("cache")
}

fn default_workspace_home() -> PathBuf {
    project_dir("workspace")
}

fn default_search_db() -> PathBuf {
    project_dir("search.sqlite")
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    8871
}

fn default_mount_path() -> String {
    "/".to_owned()
}

fn default_updates_host() -> String {
    "localhost".to_owned()
}

fn default_updates_port() -> u16 {
    8870
}

fn default_cache_control() -> String {
    "public, must-revalidate, max-age=60".to_owned()
}

fn default_search_cache_quota() -> u64 {
    250 * 1024
}

fn default_gc_interval_secs() -> u64 {
    3600
}

fn default_gc_max_age_days() -> u64 {
    7
}

fn default_gc_preserve() -> Vec<String> {
    vec!["idb/**/*".to_owned(), "publish_cache/**/*".to_owned(), "logs/**/*".to_owned()]
}
