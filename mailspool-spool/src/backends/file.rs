use std::{
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex},
    time::SystemTime,
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use mailspool_common::internal;
use mailspool_tracing::traced;
use notify::{
    EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
    SpoolError,
    entry::{Content, RetryState, SpoolEntry},
    error::ValidationError,
    feed::{ChangeEvent, ChangeFeed, ChangeFilter, ChangeKind, ChangePublisher},
    r#trait::BackingStore,
    types::{EntryId, EntryRef, MESSAGE_RFC822, NodeKind, Origin, SpoolPath},
};

const METADATA_EXT: &str = ".bin";
const DATA_EXT: &str = ".eml";
const TEMP_PREFIX: &str = ".tmp_";
const DELETED_SUFFIX: &str = ".deleted";

/// Which of an entry's two files a path refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoredFile {
    Metadata,
    Data,
}

/// On-disk metadata, stored as bincode in `{id}.bin`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Metadata {
    created_at: SystemTime,
    mime_type: String,
    retry: Option<RetryState>,
}

impl Metadata {
    fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    fn decode(bytes: &[u8]) -> crate::Result<Self> {
        let (metadata, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(metadata)
    }
}

/// State shared between clones of a store and its directory watcher
struct Shared {
    publisher: ChangePublisher,
    /// Entries this process knows about, and whether their payload exists.
    /// In-process mutations update this before touching the disk, so the
    /// watcher can tell them apart from changes made by other processes.
    known: DashMap<EntryRef, bool>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("known", &self.known.len())
            .finish_non_exhaustive()
    }
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            publisher: ChangePublisher::default(),
            known: DashMap::new(),
            watcher: Mutex::new(None),
        }
    }
}

/// File-based backing store implementation
///
/// Each spool folder maps to a directory below `path`
/// (`/var/spool/queue/mail` becomes `{path}/var/spool/queue/mail`), and each
/// entry to two files in it:
/// - Metadata files: `{id}.bin` - creation time, MIME type and retry state as bincode
/// - Data files: `{id}.eml` - the raw payload
///
/// # Atomicity
/// All writes go to a `.tmp_` prefixed file first and are renamed into
/// place, so a crash never leaves a half-written file under its final name.
/// Deletes rename both files to a `.deleted` suffix before removing them;
/// leftovers from a crash are removed by [`FileBackingStore::init`].
///
/// # External changes
/// After `init`, the directory tree is watched. Files dropped in or removed
/// by other processes are published on the change feed with
/// [`Origin::External`]. A dropped-in `{id}.eml` without metadata is a valid
/// entry with no retry state. External writers should write elsewhere and
/// rename into place.
#[derive(Debug, Clone)]
pub struct FileBackingStore {
    path: PathBuf,
    watch: bool,
    shared: Arc<Shared>,
}

impl Default for FileBackingStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/spool/mailspool"),
            watch: true,
            shared: Arc::default(),
        }
    }
}

const fn default_watch() -> bool {
    true
}

impl<'de> Deserialize<'de> for FileBackingStore {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FileBackingStoreHelper {
            path: PathBuf,
            #[serde(default = "default_watch")]
            watch: bool,
        }

        let helper = FileBackingStoreHelper::deserialize(deserializer)?;

        FileBackingStore::builder()
            .path(helper.path)
            .watch(helper.watch)
            .build()
            .map_err(serde::de::Error::custom)
    }
}

impl FileBackingStore {
    /// Validate a spool path for security
    ///
    /// # Security Checks
    /// - Rejects paths containing `..` (directory traversal)
    /// - Rejects paths to sensitive system directories
    /// - Ensures the path is absolute
    fn validate_path(path: &Path) -> Result<(), ValidationError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::InvalidConfiguration(format!(
                "Spool path cannot contain '..' components: {}",
                path.display()
            )));
        }

        if !path.is_absolute() {
            return Err(ValidationError::InvalidConfiguration(format!(
                "Spool path must be absolute: {}",
                path.display()
            )));
        }

        let sensitive_prefixes = [
            "/etc",
            "/bin",
            "/sbin",
            "/usr/bin",
            "/usr/sbin",
            "/boot",
            "/sys",
            "/proc",
            "/dev",
        ];

        if let Some(prefix) = sensitive_prefixes
            .iter()
            .find(|prefix| path.starts_with(prefix))
        {
            return Err(ValidationError::InvalidConfiguration(format!(
                "Spool path cannot be in system directory {prefix}: {}",
                path.display()
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn builder() -> FileBackingStoreBuilder {
        FileBackingStoreBuilder::default()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Initialize the file-backed spool
    ///
    /// Creates the spool directory if it doesn't exist, removes leftovers of
    /// interrupted writes and deletes, indexes the entries already on disk
    /// and starts watching for external changes.
    ///
    /// # Errors
    /// - If the spool path cannot be created
    /// - If the path exists but is not a directory
    /// - If the directory watcher cannot be started
    pub fn init(&mut self) -> crate::Result<()> {
        internal!("Initialising Spool ...");

        if !self.path.try_exists()? {
            internal!("{:#?} does not exist, creating...", self.path);
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            return Err(ValidationError::NotDirectory(self.path.display().to_string()).into());
        }

        let mut files = Vec::new();
        collect_files(&self.path, &mut files)?;

        let mut cleaned = 0;
        for file in files {
            let Some(name) = file.file_name().and_then(|name| name.to_str()) else {
                continue;
            };

            if name.ends_with(DELETED_SUFFIX) || name.starts_with(TEMP_PREFIX) {
                std::fs::remove_file(&file)?;
                cleaned += 1;
            } else if let Some((entry, kind)) = locate(&self.path, &file) {
                let mut has_data = self.shared.known.entry(entry).or_insert(false);
                *has_data |= kind == StoredFile::Data;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned temporary files from spool"
            );
        }

        internal!(
            level = DEBUG,
            "Found {} existing entries in spool",
            self.shared.known.len()
        );

        if self.watch {
            self.start_watching()?;
        }

        Ok(())
    }

    fn start_watching(&self) -> crate::Result<()> {
        let root = std::fs::canonicalize(&self.path)?;
        let shared = Arc::downgrade(&self.shared);
        let watched = root.clone();

        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                let Some(shared) = shared.upgrade() else {
                    return;
                };

                match result {
                    Ok(event) => shared.external_change(&watched, &event),
                    Err(err) => {
                        internal!(level = WARN, "Spool directory watcher error: {err}");
                    }
                }
            })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        internal!("Watching {} for external changes", root.display());
        *self.shared.watcher.lock()? = Some(watcher);

        Ok(())
    }

    fn folder_dir(&self, folder: &SpoolPath) -> PathBuf {
        folder
            .segments()
            .fold(self.path.clone(), |dir, segment| dir.join(segment))
    }

    fn file_path(&self, entry: &EntryRef, kind: StoredFile) -> PathBuf {
        let ext = match kind {
            StoredFile::Metadata => METADATA_EXT,
            StoredFile::Data => DATA_EXT,
        };

        self.folder_dir(&entry.folder).join(format!("{}{ext}", entry.id))
    }

    /// Write `bytes` next to `target` and rename them into place
    async fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
        let name = target
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "spool file has no name"))?;
        let temp = target.with_file_name(format!("{TEMP_PREFIX}{name}"));

        fs::write(&temp, bytes).await?;
        fs::rename(&temp, target).await
    }

    async fn read_metadata(&self, entry: &EntryRef) -> crate::Result<Option<Metadata>> {
        match fs::read(self.file_path(entry, StoredFile::Metadata)).await {
            Ok(bytes) => Ok(Some(Metadata::decode(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_files(&self, entry: &EntryRef, content: &Content, origin: Origin) -> crate::Result<()> {
        let metadata = Metadata {
            created_at: SystemTime::now(),
            mime_type: content.mime_type.clone(),
            retry: None,
        };

        Self::write_atomic(
            &self.file_path(entry, StoredFile::Metadata),
            &metadata.encode()?,
        )
        .await?;
        self.shared.publisher.publish(vec![ChangeEvent::new(
            ChangeKind::Added,
            entry.path(),
            NodeKind::Entry,
            origin,
        )]);

        Self::write_atomic(&self.file_path(entry, StoredFile::Data), &content.data).await?;
        self.shared.publisher.publish(vec![ChangeEvent::new(
            ChangeKind::Added,
            entry.content_path(),
            NodeKind::Content,
            origin,
        )]);

        Ok(())
    }

    /// Remove both of an entry's files, returning whether anything existed
    async fn remove_files(&self, entry: &EntryRef) -> crate::Result<bool> {
        let mut marked = Vec::with_capacity(2);

        // Phase 1: rename to the .deleted suffix, which list() ignores
        for kind in [StoredFile::Data, StoredFile::Metadata] {
            let path = self.file_path(entry, kind);
            let mut deleted = path.clone().into_os_string();
            deleted.push(DELETED_SUFFIX);
            let deleted = PathBuf::from(deleted);

            match fs::rename(&path, &deleted).await {
                Ok(()) => marked.push(deleted),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        // Phase 2: if this fails, init() removes the leftovers
        for deleted in &marked {
            fs::remove_file(deleted).await?;
        }

        Ok(!marked.is_empty())
    }
}

#[async_trait]
impl BackingStore for FileBackingStore {
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self, content)), timing(precision = "ms"))]
    async fn create(
        &self,
        folder: &SpoolPath,
        id: Option<EntryId>,
        content: Content,
        origin: Origin,
    ) -> crate::Result<EntryRef> {
        let entry = folder.entry(id.unwrap_or_else(EntryId::generate));

        match self.shared.known.entry(entry.clone()) {
            Entry::Occupied(_) => return Err(SpoolError::AlreadyExists(entry)),
            Entry::Vacant(vacant) => {
                vacant.insert(true);
            }
        }

        let exists = fs::try_exists(self.file_path(&entry, StoredFile::Metadata)).await?
            || fs::try_exists(self.file_path(&entry, StoredFile::Data)).await?;
        if exists {
            return Err(SpoolError::AlreadyExists(entry));
        }

        fs::create_dir_all(self.folder_dir(folder)).await?;

        if let Err(err) = self.write_files(&entry, &content, origin).await {
            self.shared.known.remove(&entry);
            if let Err(cleanup) = self.remove_files(&entry).await {
                internal!(
                    level = WARN,
                    "Failed to clean up partially spooled entry {entry}: {cleanup}"
                );
            }
            return Err(err);
        }

        internal!(
            level = DEBUG,
            "Spooled entry {entry} to {}",
            self.folder_dir(folder).display()
        );

        Ok(entry)
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(entry = %entry)), timing(precision = "ms"))]
    async fn get(&self, entry: &EntryRef) -> crate::Result<Option<SpoolEntry>> {
        let metadata = self.read_metadata(entry).await?;

        let data_path = self.file_path(entry, StoredFile::Data);
        let data = match fs::read(&data_path).await {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        let created_at = match (&metadata, &data) {
            (Some(metadata), _) => metadata.created_at,
            (None, Some(_)) => fs::metadata(&data_path).await?.modified()?,
            (None, None) => return Ok(None),
        };

        let content = data.map(|bytes| Content {
            mime_type: metadata
                .as_ref()
                .map_or_else(|| String::from(MESSAGE_RFC822), |m| m.mime_type.clone()),
            data: Arc::from(bytes),
        });

        Ok(Some(SpoolEntry {
            entry: entry.clone(),
            created_at,
            content,
            retry: metadata.and_then(|metadata| metadata.retry),
        }))
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(entry = %entry)), timing(precision = "ms"))]
    async fn delete(&self, entry: &EntryRef, origin: Origin) -> crate::Result<bool> {
        self.shared.known.remove(entry);

        let removed = self.remove_files(entry).await?;
        if removed {
            self.shared.publisher.publish(vec![ChangeEvent::new(
                ChangeKind::Removed,
                entry.path(),
                NodeKind::Entry,
                origin,
            )]);
            internal!(level = DEBUG, "Deleted entry {entry} from spool");
        }

        Ok(removed)
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "ms"))]
    async fn list(&self, folder: &SpoolPath) -> crate::Result<Vec<EntryRef>> {
        let mut dir = match fs::read_dir(self.folder_dir(folder)).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = std::collections::BTreeSet::new();
        while let Some(file) = dir.next_entry().await? {
            let name = file.file_name();
            if let Some((id, _)) = name.to_str().and_then(parse_filename) {
                ids.insert(id);
            }
        }

        internal!(level = DEBUG, "Found {} entries in {folder}", ids.len());

        Ok(ids.into_iter().map(|id| folder.entry(id)).collect())
    }

    async fn list_due(&self, folder: &SpoolPath, now: SystemTime) -> crate::Result<Vec<EntryRef>> {
        let mut due = Vec::new();

        for entry in self.list(folder).await? {
            match self.get(&entry).await {
                Ok(Some(stored)) if stored.is_due(now) => due.push(entry),
                Ok(_) => {}
                Err(err) => {
                    internal!(level = WARN, "Skipping unreadable entry {entry}: {err}");
                }
            }
        }

        Ok(due)
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(entry = %entry)), timing(precision = "ms"))]
    async fn set_retry_metadata(
        &self,
        entry: &EntryRef,
        retry: RetryState,
        origin: Origin,
    ) -> crate::Result<()> {
        let metadata = match self.read_metadata(entry).await? {
            Some(metadata) => metadata,
            None => {
                let data = fs::metadata(self.file_path(entry, StoredFile::Data))
                    .await
                    .map_err(|err| match err.kind() {
                        ErrorKind::NotFound => SpoolError::NotFound(entry.clone()),
                        _ => err.into(),
                    })?;

                Metadata {
                    created_at: data.modified()?,
                    mime_type: String::from(MESSAGE_RFC822),
                    retry: None,
                }
            }
        };

        let metadata = Metadata {
            retry: Some(retry),
            ..metadata
        };
        Self::write_atomic(
            &self.file_path(entry, StoredFile::Metadata),
            &metadata.encode()?,
        )
        .await?;

        // A delete racing this write may have removed the payload after the
        // read above, leaving only the metadata we just renamed into place
        if !fs::try_exists(self.file_path(entry, StoredFile::Data)).await? {
            self.shared.known.remove(entry);
            self.remove_files(entry).await?;
            internal!(
                level = DEBUG,
                "Entry {entry} was deleted while its retry state was written"
            );
            return Err(SpoolError::NotFound(entry.clone()));
        }

        self.shared.publisher.publish(vec![ChangeEvent::new(
            ChangeKind::Modified,
            entry.path(),
            NodeKind::Entry,
            origin,
        )]);

        Ok(())
    }

    async fn ensure_folder(&self, folder: &SpoolPath) -> crate::Result<()> {
        let dir = self.folder_dir(folder);
        if !fs::try_exists(&dir).await? {
            internal!("{} does not exist, creating...", dir.display());
            fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    fn subscribe(&self, filter: ChangeFilter) -> ChangeFeed {
        self.shared.publisher.subscribe(filter)
    }
}

impl Shared {
    /// Translate a filesystem event into change events for entries this
    /// process did not touch itself
    fn external_change(&self, root: &Path, event: &notify::Event) {
        let mut changes = Vec::new();

        match event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    self.appeared(root, path, &mut changes);
                }
            }
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in &event.paths {
                    self.disappeared(root, path, &mut changes);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let [from, to] = event.paths.as_slice() {
                    self.disappeared(root, from, &mut changes);
                    self.appeared(root, to, &mut changes);
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in &event.paths {
                    if path.exists() {
                        self.appeared(root, path, &mut changes);
                    } else {
                        self.disappeared(root, path, &mut changes);
                    }
                }
            }
            EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
                for path in &event.paths {
                    self.rewritten(root, path, &mut changes);
                }
            }
            _ => {}
        }

        self.publisher.publish(changes);
    }

    fn appeared(&self, root: &Path, path: &Path, changes: &mut Vec<ChangeEvent>) {
        if !path.exists() {
            return;
        }
        let Some((entry, kind)) = locate(root, path) else {
            return;
        };

        match (self.known.entry(entry.clone()), kind) {
            (Entry::Vacant(vacant), StoredFile::Metadata) => {
                vacant.insert(false);
                changes.push(external(ChangeKind::Added, entry.path(), NodeKind::Entry));
            }
            (Entry::Vacant(vacant), StoredFile::Data) => {
                vacant.insert(true);
                changes.push(external(ChangeKind::Added, entry.path(), NodeKind::Entry));
                changes.push(external(
                    ChangeKind::Added,
                    entry.content_path(),
                    NodeKind::Content,
                ));
            }
            (Entry::Occupied(mut occupied), StoredFile::Data) if !*occupied.get() => {
                occupied.insert(true);
                changes.push(external(
                    ChangeKind::Added,
                    entry.content_path(),
                    NodeKind::Content,
                ));
            }
            (Entry::Occupied(_), _) => {}
        }
    }

    fn disappeared(&self, root: &Path, path: &Path, changes: &mut Vec<ChangeEvent>) {
        if path.exists() {
            return;
        }
        let Some((entry, _)) = locate(root, path) else {
            return;
        };

        if self.known.remove(&entry).is_some() {
            changes.push(external(ChangeKind::Removed, entry.path(), NodeKind::Entry));
        }
    }

    fn rewritten(&self, root: &Path, path: &Path, changes: &mut Vec<ChangeEvent>) {
        let Some((entry, StoredFile::Data)) = locate(root, path) else {
            return;
        };

        if self.known.get(&entry).is_some_and(|has_data| *has_data) {
            changes.push(external(
                ChangeKind::Modified,
                entry.content_path(),
                NodeKind::Content,
            ));
        } else {
            self.appeared(root, path, changes);
        }
    }
}

fn external(kind: ChangeKind, path: String, node: NodeKind) -> ChangeEvent {
    ChangeEvent::new(kind, path, node, Origin::External)
}

/// Split a spool file name into its entry id and file kind, ignoring
/// temporary and deleted files
fn parse_filename(name: &str) -> Option<(EntryId, StoredFile)> {
    if name.starts_with(TEMP_PREFIX) || name.ends_with(DELETED_SUFFIX) {
        return None;
    }

    let (stem, kind) = name
        .strip_suffix(METADATA_EXT)
        .map(|stem| (stem, StoredFile::Metadata))
        .or_else(|| name.strip_suffix(DATA_EXT).map(|stem| (stem, StoredFile::Data)))?;

    Some((EntryId::new(stem).ok()?, kind))
}

/// Map a file below `root` back to the entry it stores
fn locate(root: &Path, path: &Path) -> Option<(EntryRef, StoredFile)> {
    let relative = path.strip_prefix(root).ok()?;
    let (id, kind) = parse_filename(relative.file_name()?.to_str()?)?;

    let segments = relative
        .parent()?
        .components()
        .map(|component| match component {
            Component::Normal(segment) => segment.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    let folder = SpoolPath::new(format!("/{}", segments.join("/"))).ok()?;

    Some((folder.entry(id), kind))
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type()?.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }

    Ok(())
}

/// Builder for `FileBackingStore`
#[derive(Debug)]
pub struct FileBackingStoreBuilder {
    path: PathBuf,
    watch: bool,
}

impl Default for FileBackingStoreBuilder {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            watch: true,
        }
    }
}

impl FileBackingStoreBuilder {
    /// Set the spool directory path
    #[must_use]
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Whether `init` starts watching for external changes
    #[must_use]
    pub const fn watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    /// Build the final `FileBackingStore`
    ///
    /// # Errors
    /// Returns an error if the path is invalid or potentially dangerous
    pub fn build(self) -> crate::Result<FileBackingStore> {
        FileBackingStore::validate_path(&self.path)?;

        Ok(FileBackingStore {
            path: self.path,
            watch: self.watch,
            shared: Arc::default(),
        })
    }
}
