//! Filesystem watch listener
//!
//! Watches one directory and forwards notifications whose path and operation
//! match the configuration as `{"name": <path>, "op": <OP>}` payloads.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{Listener, parse_config};
use crate::eventsource::EventSource;
use crate::session::SessionHandle;
use crate::{Error, Result};

/// File event source configuration
///
/// ```yaml
/// directory: /var/data/
/// path: x.txt            # literal path relative to the directory, or absolute
/// pathRegexp: '.*\.csv$' # alternative to `path`
/// eventType: CREATE
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEventSourceConfig {
    /// Directory to watch (must exist when the source starts)
    #[serde(default)]
    pub directory: String,
    /// Literal path to match
    #[serde(default)]
    pub path: String,
    /// Regular expression matched against the relative path
    #[serde(default)]
    pub path_regexp: String,
    /// Operation to match
    #[serde(default)]
    pub event_type: String,
}

impl FileEventSourceConfig {
    fn validate(&self) -> Result<()> {
        if self.directory.is_empty() {
            return Err(Error::InvalidEventSource(
                "directory can't be empty".to_string(),
            ));
        }
        if self.path.is_empty() && self.path_regexp.is_empty() {
            return Err(Error::InvalidEventSource(
                "either path or pathRegexp must be specified".to_string(),
            ));
        }
        if self.event_type.is_empty() {
            return Err(Error::InvalidEventSource(
                "event type can't be empty".to_string(),
            ));
        }
        self.event_type.parse::<FileOp>()?;
        if !self.path_regexp.is_empty() {
            Regex::new(&self.path_regexp)
                .map_err(|e| Error::InvalidEventSource(format!("invalid pathRegexp: {e}")))?;
        }
        Ok(())
    }
}

/// Filesystem operation, named the way fsnotify names them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileOp {
    /// File or directory created (also the new name of a rename)
    Create,
    /// Content written
    Write,
    /// Removed
    Remove,
    /// Renamed away
    Rename,
    /// Metadata changed
    Chmod,
}

impl FileOp {
    /// Canonical name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Write => "WRITE",
            Self::Remove => "REMOVE",
            Self::Rename => "RENAME",
            Self::Chmod => "CHMOD",
        }
    }

    /// Operations carried by one notify event, paired with their paths
    #[must_use]
    pub fn from_event(event: &Event) -> Vec<(PathBuf, Self)> {
        let single = |op: Self| {
            event
                .paths
                .iter()
                .map(|p| (p.clone(), op))
                .collect::<Vec<_>>()
        };

        match event.kind {
            EventKind::Create(_) => single(Self::Create),
            EventKind::Remove(_) => single(Self::Remove),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => single(Self::Create),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let mut ops = Vec::with_capacity(2);
                if let Some(from) = event.paths.first() {
                    ops.push((from.clone(), Self::Rename));
                }
                if let Some(to) = event.paths.get(1) {
                    ops.push((to.clone(), Self::Create));
                }
                ops
            }
            EventKind::Modify(ModifyKind::Name(_)) => single(Self::Rename),
            EventKind::Modify(ModifyKind::Metadata(_)) => single(Self::Chmod),
            EventKind::Modify(_) => single(Self::Write),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
        }
    }
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATE" => Ok(Self::Create),
            "WRITE" => Ok(Self::Write),
            "REMOVE" => Ok(Self::Remove),
            "RENAME" => Ok(Self::Rename),
            "CHMOD" => Ok(Self::Chmod),
            other => Err(Error::InvalidEventSource(format!(
                "unknown event type {other}, expected one of CREATE, WRITE, REMOVE, RENAME, CHMOD"
            ))),
        }
    }
}

/// Payload of one file event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    /// Path reported by the watch
    pub name: String,
    /// Operation
    pub op: FileOp,
}

/// Path and operation filter, compiled once per start
#[derive(Debug)]
pub struct FileEventFilter {
    directory: PathBuf,
    canonical_directory: Option<PathBuf>,
    literal: Option<PathBuf>,
    pattern: Option<Regex>,
    op: FileOp,
}

impl FileEventFilter {
    /// Compile the filter for a validated configuration
    pub fn new(config: &FileEventSourceConfig) -> Result<Self> {
        config.validate()?;
        let directory = PathBuf::from(&config.directory);
        let canonical_directory = std::fs::canonicalize(&directory)
            .ok()
            .filter(|c| c != &directory);

        let literal = (!config.path.is_empty()).then(|| {
            let path = Path::new(&config.path);
            path.strip_prefix(&directory)
                .map_or_else(|_| path.to_path_buf(), Path::to_path_buf)
        });
        let pattern = if config.path_regexp.is_empty() {
            None
        } else {
            Some(
                Regex::new(&config.path_regexp)
                    .map_err(|e| Error::InvalidEventSource(format!("invalid pathRegexp: {e}")))?,
            )
        };

        Ok(Self {
            directory,
            canonical_directory,
            literal,
            pattern,
            op: config.event_type.parse()?,
        })
    }

    /// Directory the filter is relative to
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.directory).ok().or_else(|| {
            self.canonical_directory
                .as_ref()
                .and_then(|dir| path.strip_prefix(dir).ok())
        })
    }

    /// Whether a notification passes: path matches AND operation matches
    pub fn matches(&self, path: &Path, op: FileOp) -> bool {
        if op != self.op {
            return false;
        }
        let Some(relative) = self.relative(path) else {
            return false;
        };

        if self.literal.as_deref() == Some(relative) {
            return true;
        }
        self.pattern
            .as_ref()
            .is_some_and(|re| re.is_match(&relative.to_string_lossy()))
    }
}

/// Listener for `file` event sources
#[derive(Debug, Default)]
pub struct FileListener;

impl FileListener {
    /// Create the listener
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Listener for FileListener {
    fn source_type(&self) -> &'static str {
        "file"
    }

    fn check(&self, value: &[u8]) -> Result<()> {
        parse_config::<FileEventSourceConfig>(value)?.validate()
    }

    async fn start(&self, source: EventSource, session: SessionHandle) -> Result<()> {
        // Parse failures end the session before any watch is created.
        let config: FileEventSourceConfig = parse_config(&source.value)?;
        let filter = FileEventFilter::new(&config)?;

        let (tx, mut rx) = mpsc::channel(64);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.blocking_send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::Watch(format!("failed to create watcher: {e}")))?;
        watcher
            .watch(filter.directory(), RecursiveMode::NonRecursive)
            .map_err(|e| {
                Error::Watch(format!(
                    "failed to watch {}: {e}",
                    filter.directory().display()
                ))
            })?;

        info!(
            event_source = %source.name,
            directory = %config.directory,
            op = %filter.op,
            "Watching for file notifications"
        );

        let result = loop {
            let received = tokio::select! {
                () = session.done() => break Ok(()),
                received = rx.recv() => received,
            };

            let event = match received {
                Some(Ok(event)) => event,
                Some(Err(e)) => break Err(Error::Watch(e.to_string())),
                None => break Err(Error::SourceClosed("fs watcher stopped".to_string())),
            };

            let mut ended = false;
            for (path, op) in FileOp::from_event(&event) {
                if !filter.matches(&path, op) {
                    continue;
                }
                debug!(event_source = %source.name, path = %path.display(), op = %op, "File event");
                let payload = serde_json::to_vec(&FileEvent {
                    name: path.to_string_lossy().into_owned(),
                    op,
                })?;
                if session.send(Bytes::from(payload)).await.is_err() {
                    ended = true;
                    break;
                }
            }
            if ended || session.is_done() {
                break Ok(());
            }
        };

        // Drop the receiver first so a blocked notify thread is released.
        drop(rx);
        drop(watcher);
        info!(event_source = %source.name, "Stopped watching");
        result
    }
}
