use std::collections::BTreeSet;
use std::sync::Arc;

use clap::Parser;
use notesync_core::{
    FixedResolver, NoteStore, NotebookManager, NotebookView, SyncClient, SyncError, SyncManager,
    SyncServiceAddin, TagRegistry,
};
use notesync_local::config::{Command, Config, NoteCommand, NotebookCommand, VolumeMonitorKind};
use notesync_local::{
    FileSyncClient, FolderSyncAddin, GioVolumeMonitor, LocalNoteStore, LocalVolumeMonitor,
    MountManager, Preferences, VolumeMonitor,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct App {
    config: Config,
    store: Arc<LocalNoteStore>,
    client: Arc<FileSyncClient>,
    addin: FolderSyncAddin,
    notebooks: NotebookManager,
}

impl App {
    async fn build(config: Config) -> anyhow::Result<Self> {
        let data_dir = config.effective_data_dir();
        info!("  Data dir: {}", data_dir.display());

        let store = Arc::new(LocalNoteStore::open(config.notes_dir()).await?);
        let client = Arc::new(FileSyncClient::new(config.sync_state_path()));
        let preferences = Arc::new(Preferences::load(config.effective_preferences()).await?);

        let monitor: Arc<dyn VolumeMonitor> = match config.volume_monitor {
            VolumeMonitorKind::Gio => Arc::new(GioVolumeMonitor::default()),
            VolumeMonitorKind::Local => Arc::new(LocalVolumeMonitor),
        };
        let mounts = Arc::new(MountManager::new(monitor, config.mount_timeout()));
        let addin = FolderSyncAddin::new(preferences, mounts);

        let notebooks = NotebookManager::new(store.clone(), Arc::new(TagRegistry::new()));
        notebooks.load_notebooks().await?;

        Ok(Self {
            config,
            store,
            client,
            addin,
            notebooks,
        })
    }

    async fn sync(&self) -> anyhow::Result<()> {
        let manager = SyncManager::new(
            self.store.clone(),
            self.client.clone(),
            Arc::new(FixedResolver::new(self.config.on_conflict)),
            self.config.sync_policy(),
        );

        // The session always runs to an end so it can unlock and unmount
        let session = manager.perform_synchronization(&self.addin);
        tokio::pin!(session);
        let result = tokio::select! {
            result = &mut session => result,
            _ = shutdown_signal() => {
                warn!("Interrupt received, stopping the session");
                manager.cancel();
                session.await
            }
        };
        let report = match result {
            Err(SyncError::Cancelled) => {
                anyhow::bail!("synchronization interrupted before commit, the sync location is unchanged")
            }
            other => other?,
        };

        if report.is_noop() {
            println!("Already up to date at revision {}", report.revision);
        } else {
            println!(
                "Synchronized to revision {}: {} uploaded, {} downloaded, {} deleted remotely, {} deleted locally",
                report.revision,
                report.uploaded.len(),
                report.downloaded.len(),
                report.deleted_remotely.len(),
                report.deleted_locally.len()
            );
        }
        for (id, resolution) in &report.conflicts {
            println!("  conflict on {}: {}", id, resolution);
        }
        for id in &report.renamed_copies {
            println!("  kept local version as {}", id);
        }
        Ok(())
    }

    async fn status(&self) -> anyhow::Result<()> {
        let uri = self.addin.sync_uri();
        if uri.is_empty() {
            println!("Sync location: (not configured)");
        } else {
            println!("Sync location: {}", uri);
        }

        let baseline = self.client.load().await?;
        match baseline.last_sync_at {
            Some(at) => println!(
                "Last sync: {} (revision {})",
                at.to_rfc3339(),
                baseline.last_synchronized_revision
            ),
            None => println!("Last sync: never"),
        }

        let notes = self.store.list_notes().await?;
        let pending = notes
            .iter()
            .filter(|n| match baseline.get(&n.id) {
                Some(synced) => synced.local_revision != n.revision,
                None => true,
            })
            .count();
        println!(
            "Notes: {} ({} with unsynced changes)",
            notes.iter().filter(|n| !n.deleted).count(),
            pending
        );
        Ok(())
    }

    async fn note(&self, command: NoteCommand) -> anyhow::Result<()> {
        match command {
            NoteCommand::List => {
                for note in self.store.list_notes().await? {
                    if note.deleted {
                        continue;
                    }
                    let notebook = self
                        .notebooks
                        .get_notebook_from_note(&note)
                        .map(|nb| nb.name().to_string())
                        .unwrap_or_default();
                    println!("{}  {}  [{}]", note.id, note.title, notebook);
                }
            }
            NoteCommand::Show { id } => {
                let note = self.store.require_note(&id).await?;
                println!("{}", note.title);
                for tag in &note.tags {
                    println!("  tag: {}", tag);
                }
                println!("{}", note.content);
            }
            NoteCommand::Create {
                title,
                content,
                notebook,
            } => {
                let note = self.store.create_note(&title, &content).await?;
                if notebook.is_some() {
                    self.notebooks
                        .move_note_to_notebook(&note.id, notebook.as_deref())
                        .await?;
                }
                println!("{}", note.id);
            }
            NoteCommand::Edit { id, content } => {
                let note = self.store.update_content(&id, &content).await?;
                println!("{} now at local revision {}", note.id, note.revision);
            }
            NoteCommand::Delete { id } => {
                if !self.store.delete_note(&id).await? {
                    anyhow::bail!("no note {}", id);
                }
            }
        }
        Ok(())
    }

    async fn notebook(&self, command: NotebookCommand) -> anyhow::Result<()> {
        match command {
            NotebookCommand::List => {
                let notes = self.store.list_notes().await?;
                for view in self.notebooks.views(BTreeSet::new()) {
                    if matches!(view, NotebookView::Active(_)) {
                        continue;
                    }
                    let count = notes.iter().filter(|n| view.contains_note(n)).count();
                    println!("{} ({})", view.name(), count);
                }
            }
            NotebookCommand::Create { name } => {
                let notebook = self.notebooks.get_or_create_notebook(&name).await?;
                println!("{}", notebook.name());
            }
            NotebookCommand::Delete { name } => {
                if !self.notebooks.delete_notebook(&name).await? {
                    anyhow::bail!("no notebook {}", name);
                }
            }
            NotebookCommand::Move { note_id, notebook } => {
                self.notebooks
                    .move_note_to_notebook(&note_id, notebook.as_deref())
                    .await?;
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    info!("Starting notesync");
    info!("  Volume monitor: {}", config.volume_monitor);

    let command = config.command.clone();
    let app = App::build(config).await?;

    match command {
        Command::Sync => app.sync().await?,
        Command::Configure { uri } => {
            app.addin.save_configuration(&uri).await?;
            println!("Sync location saved: {}", uri.trim());
        }
        Command::Reset => app.addin.reset_configuration().await?,
        Command::Status => app.status().await?,
        Command::Note(command) => app.note(command).await?,
        Command::Notebook(command) => app.notebook(command).await?,
    }
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, initiating shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating shutdown");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
