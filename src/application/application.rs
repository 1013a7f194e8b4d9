// This is where the application wires up: shared services, caches and the
// event subscriptions that keep them honest.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{info, warn};

use super::config::configuration::Configuration;
use super::events::{Event, UpdateBus};
use super::logging::tracing::tracing_subscribe;
use super::sync::SyncSet;
use crate::acm::{AuthSettings, AuthSettingsCache};
use crate::builder::Builder;
use crate::context::Context;
use crate::filedb::FileDb;
use crate::negotiator::{Resources, ResourcesCache};
use crate::pipeline::{transform::Hooks, Runner};
use crate::repo::{BranchDb, ManifestCache};
use crate::search::{schema, Indexer, SearchDb, SqlDb};
use crate::tasks::TaskQueues;

static LOGGER_INSTALLED: OnceCell<bool> = OnceCell::new();

#[derive(Clone)]
pub struct Application {
    pub config: Arc<Configuration>,
    pub sql: SqlDb,
    pub bus: Arc<UpdateBus>,
    pub queues: Arc<TaskQueues>,
    pub runner: Arc<Runner>,
    pub hooks: Arc<Hooks>,
    pub manifests: Arc<ManifestCache>,
    pub branch_db: Arc<BranchDb>,
    pub filedb: Arc<FileDb>,
    pub auth_settings: Arc<AuthSettingsCache>,
    pub resources: Arc<ResourcesCache>,
    pub search: Arc<SearchDb>,
    pub indexer: Arc<Indexer>,
    pub builder: Arc<Builder>,
    pub sync_set: Arc<SyncSet>,
}

impl Application {
    pub async fn initialize(config: Configuration) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let sql = schema::init(&config.search_db).await?;
        let bus = Arc::new(UpdateBus::new());
        let queues = TaskQueues::new();
        let runner = Arc::new(Runner::new(config.cache_dir.clone()));
        let hooks = Arc::new(Hooks::new());
        let manifests = Arc::new(ManifestCache::new(256));

        let branch_db = Arc::new(BranchDb::new(
            config.content_repo_home.clone(),
            config.build_profiles.clone(),
            Arc::clone(&manifests),
        ));
        branch_db.scan().await?;

        let filedb = Arc::new(FileDb::new(
            Arc::clone(&runner),
            Arc::clone(&manifests),
            Arc::clone(&hooks),
        ));
        let auth_settings = Arc::new(AuthSettingsCache::new(256));
        let resources = Arc::new(ResourcesCache::new(64));
        let search = Arc::new(SearchDb::new(
            Arc::clone(&sql),
            config.search_cache_dir(),
            config.search_cache_quota,
        ));
        let indexer = Indexer::new(Arc::clone(&sql), Arc::clone(&queues));
        let builder = Builder::new(
            Arc::clone(&sql),
            Arc::clone(&queues),
            Arc::clone(&branch_db),
            Arc::clone(&manifests),
            config.build_profiles.clone(),
            config.workspace_home.clone(),
            config.build_command.clone(),
            Arc::clone(&bus),
        );

        let app = Self {
            config,
            sql,
            bus,
            queues,
            runner,
            hooks,
            manifests,
            branch_db,
            filedb,
            auth_settings,
            resources,
            search,
            indexer,
            builder,
            sync_set: Arc::new(SyncSet::new()),
        };
        app.wire_events();
        info!("application initialized");
        Ok(app)
    }

    /// Register every cache and the indexer on the update bus. Each
    /// subscriber drops its entry for the key during dispatch; the next
    /// request repopulates lazily.
    fn wire_events(&self) {
        let filedb = Arc::clone(&self.filedb);
        self.bus.subscribe("file-info", move |event| {
            if let Event::ContentRepoUpdate(update) = event {
                filedb.invalidate(&update.key);
            }
        });

        let manifests = Arc::clone(&self.manifests);
        let branch_db = Arc::clone(&self.branch_db);
        self.bus.subscribe("manifests", move |event| {
            if let Event::ContentRepoUpdate(update) = event {
                manifests.invalidate_repo(&branch_db.repo_path(&update.account, &update.repo));
            }
        });

        let auth_settings = Arc::clone(&self.auth_settings);
        self.bus.subscribe("auth-settings", move |event| {
            if let Event::ContentRepoUpdate(update) = event {
                auth_settings.invalidate(&update.key);
            }
        });

        let resources = Arc::clone(&self.resources);
        self.bus.subscribe("resources", move |event| {
            if let Event::ContentRepoUpdate(update) = event {
                resources.invalidate(&update.key);
            }
        });

        let sync_set = Arc::clone(&self.sync_set);
        self.bus.subscribe("sync-set", move |event| {
            if let Event::ContentRepoUpdate(update) = event {
                sync_set.clear(&update.key);
            }
        });

        let indexer = Arc::clone(&self.indexer);
        let branch_db = Arc::clone(&self.branch_db);
        self.bus.subscribe("search-indexer", move |event| {
            if let Event::ContentRepoUpdate(update) = event {
                if branch_db.is_public_branch(&update.account, &update.repo, &update.branch) {
                    if let Some(entry) = branch_db.get(&update.account, &update.repo) {
                        indexer.schedule(
                            &update.account,
                            &update.repo,
                            &update.branch,
                            &entry.repo_path,
                        );
                    }
                }
            }
        });
    }

    pub fn install_logging(config: &Configuration) {
        if let Some(true) = LOGGER_INSTALLED.get() {
            return;
        }

        if !tracing_subscribe(config) {
            warn!("Failed to install tracing_subscriber. There's probably one already...");
        };

        if color_eyre::install().is_err() {
            warn!("Failed to install color-eyre. Oh well...");
        };

        _ = LOGGER_INSTALLED.set(true);
    }

    /// Per-repo auth settings for a request context.
    pub async fn auth_settings_for(&self, ctx: &Context) -> anyhow::Result<Arc<AuthSettings>> {
        let manifests = Arc::clone(&self.manifests);
        let repo_path = ctx.repo_path.clone();
        let branch = ctx.branch.clone();
        let defaults = self.config.auth.clone();
        self.auth_settings
            .get(&ctx.key, async move {
                let manifest = manifests.get(&repo_path, &branch).await?;
                Ok(AuthSettings::build(&manifest, &defaults))
            })
            .await
    }

    /// The branch's representation bundles for content negotiation.
    pub async fn resources_for(&self, ctx: &Context) -> anyhow::Result<Arc<Resources>> {
        self.resources
            .get(&ctx.key, &ctx.repo_path, &ctx.branch)
            .await
    }

    /// Startup kick: index every public branch.
    pub fn schedule_initial_indexing(&self) {
        for (entry, branch) in self.branch_db.list_public() {
            self.indexer
                .schedule(&entry.account, &entry.repo, &branch, &entry.repo_path);
        }
    }
}
