//! Fetching remote RPKI data into the local cache.
//!
//! The collector maintains a local copy of the published RPKI data under
//! the cache directory. Data reachable via rsync is kept in a directory
//! tree under `rsync` using the URI components as the path. We assume data
//! is published in rsync modules identified by the first two components of
//! that path, which is how the rsync daemon works. Trust anchor
//! certificates fetched via HTTPS live under `https` in the same manner.
//!
//! During a validation run we keep track of the modules we have already
//! updated. When access to a module that has not yet been updated is
//! requested, we spawn rsync and block until it returns. If during that
//! time another thread requests access to the same module, that thread is
//! blocked, too. After a fully successful run, modules that were never
//! requested are removed from the cache.

use std::{fs, io};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use bytes::Bytes;
use log::{debug, error, warn};
use rpki::uri;
use crate::config::Config;
use crate::error::Failed;
use crate::tal::TalUri;


//------------ Configuration -------------------------------------------------

/// The default arguments we pass to rsync.
const RSYNC_ARGS: [&str; 3] = ["-rltz", "--delete", "--contimeout=10"];

/// The timeout for a single HTTPS request.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);


//------------ Collector -----------------------------------------------------

/// The local copy of remote RPKI data.
#[derive(Debug)]
pub struct Collector {
    /// The base directory of the collector.
    working_dir: PathBuf,

    /// The command for running rsync.
    command: RsyncCommand,

    /// The client for fetching single files via HTTPS.
    http_client: reqwest::blocking::Client,

    /// Fall back to cached data when a trust anchor download fails?
    local_ta_fallback: bool,
}

impl Collector {
    /// Initializes the collector without creating a value.
    ///
    /// Makes sure the working directory exists. This function is called
    /// implicitly by [`new`][Collector::new].
    pub fn init(config: &Config) -> Result<(), Failed> {
        let _ = Self::create_working_dir(config)?;
        Ok(())
    }

    /// Creates the working dir and returns its path.
    fn create_working_dir(config: &Config) -> Result<PathBuf, Failed> {
        let working_dir = config.cache_dir.clone();
        if let Err(err) = fs::create_dir_all(&working_dir) {
            error!(
                "Failed to create working directory {}: {}.",
                working_dir.display(), err
            );
            return Err(Failed)
        }
        Ok(working_dir)
    }

    /// Creates a new collector from the configuration.
    pub fn new(config: &Config) -> Result<Self, Failed> {
        Ok(Collector {
            working_dir: Self::create_working_dir(config)?,
            command: RsyncCommand::new(config),
            http_client: reqwest::blocking::Client::builder()
                .user_agent(concat!("talus/", env!("CARGO_PKG_VERSION")))
                .timeout(HTTP_TIMEOUT)
                .build()
                .map_err(|err| {
                    error!("Failed to create HTTP client: {}.", err);
                    Failed
                })?,
            local_ta_fallback: config.local_ta_fallback,
        })
    }

    /// Starts a validation run on the collector.
    pub fn start(&self) -> Run {
        Run::new(self)
    }

    /// Returns the local path for an rsync URI.
    pub fn rsync_path(&self, uri: &uri::Rsync) -> PathBuf {
        let mut res = self.working_dir.join("rsync");
        res.push(uri.canonical_authority().as_ref());
        res.push(uri.module_name());
        res.push(uri.path());
        res
    }

    /// Returns the local path for an HTTPS URI.
    fn https_path(&self, uri: &uri::Https) -> PathBuf {
        let mut res = self.working_dir.join("https");
        res.push(uri.canonical_authority().as_ref());
        for item in uri.path().split('/').filter(|item| !item.is_empty()) {
            res.push(item)
        }
        res
    }

    /// Runs rsync for the module of the given URI.
    fn rsync_module(&self, uri: &uri::Rsync) -> bool {
        let source = format!(
            "rsync://{}/{}/", uri.canonical_authority(), uri.module_name()
        );
        let mut destination = self.working_dir.join("rsync");
        destination.push(uri.canonical_authority().as_ref());
        destination.push(uri.module_name());
        if let Err(err) = fs::create_dir_all(&destination) {
            error!(
                "Failed to create directory {}: {}",
                destination.display(), err
            );
            return false
        }
        self.command.update(&source, &destination)
    }
}


//------------ Run -----------------------------------------------------------

/// Using the collector for a single validation run.
pub struct Run<'a> {
    /// A reference to the underlying collector.
    collector: &'a Collector,

    /// The rsync modules that have been updated already.
    ///
    /// The value for each module is whether the update has succeeded. If
    /// a module is present but its value still unset, an update is
    /// currently in progress and the requesting thread needs to wait for
    /// it by acquiring the inner mutex.
    updated: Mutex<HashMap<String, Arc<Mutex<Option<bool>>>>>,

    /// The modules that have been requested during this run.
    ///
    /// A module counts as visited the moment it is requested, whether the
    /// transfer succeeds or not, so that data of temporarily unreachable
    /// repositories survives in the cache.
    visited: Mutex<HashSet<String>>,
}

impl<'a> Run<'a> {
    /// Creates a new runner on a collector.
    fn new(collector: &'a Collector) -> Self {
        Run {
            collector,
            updated: Mutex::new(HashMap::new()),
            visited: Mutex::new(HashSet::new()),
        }
    }

    /// Loads the trust anchor certificate at the given URI.
    ///
    /// Any failure to produce the certificate’s content is a soft error:
    /// diagnostics are logged and `None` is returned so the caller can try
    /// the next URI of the TAL.
    pub fn load_ta(&self, uri: &TalUri) -> Option<Bytes> {
        match *uri {
            TalUri::Rsync(ref uri) => self.load_ta_rsync(uri),
            TalUri::Https(ref uri) => self.load_ta_https(uri),
        }
    }

    fn load_ta_rsync(&self, uri: &uri::Rsync) -> Option<Bytes> {
        let fetched = self.update_module(uri);
        if !fetched && !self.collector.local_ta_fallback {
            return None
        }
        let path = self.collector.rsync_path(uri);
        match fs::read(&path) {
            Ok(data) => Some(data.into()),
            Err(err) => {
                warn!("Failed to read {}: {}", path.display(), err);
                None
            }
        }
    }

    fn load_ta_https(&self, uri: &uri::Https) -> Option<Bytes> {
        let path = self.collector.https_path(uri);
        match self.download_https(uri, &path) {
            Ok(data) => Some(data),
            Err(err) => {
                warn!("Failed to download {}: {}", uri, err);
                if self.collector.local_ta_fallback {
                    fs::read(&path).map(Into::into).ok()
                }
                else {
                    None
                }
            }
        }
    }

    /// Downloads a single file via HTTPS into the cache.
    fn download_https(
        &self, uri: &uri::Https, path: &Path
    ) -> Result<Bytes, io::Error> {
        let data = self.collector.http_client
            .get(uri.as_str())
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.bytes())
            .map_err(io::Error::other)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(&data)?;
        Ok(data)
    }

    /// Makes sure the repository directory of a CA is up-to-date.
    ///
    /// Returns the local path of the directory the given caRepository URI
    /// maps to or `None` if the repository could not be updated. The
    /// failure is soft: it has been logged and only the subtree below the
    /// CA is affected.
    pub fn fetch_repository(
        &self, ca_repository: &uri::Rsync
    ) -> Option<PathBuf> {
        if self.update_module(ca_repository) {
            Some(self.collector.rsync_path(ca_repository))
        }
        else {
            None
        }
    }

    /// Updates the rsync module containing the given URI once per run.
    ///
    /// Returns whether the module is available. Concurrent requests for
    /// the same module block until the first has concluded and share its
    /// result.
    fn update_module(&self, uri: &uri::Rsync) -> bool {
        let key = module_key(uri);
        self.visited.lock().expect(
            "visited modules lock poisoned"
        ).insert(key.clone());
        let state = self.updated.lock().expect(
            "updated modules lock poisoned"
        ).entry(key).or_insert_with(Default::default).clone();
        let mut state = state.lock().expect("module state lock poisoned");
        if let Some(res) = *state {
            return res
        }
        let res = self.collector.rsync_module(uri);
        *state = Some(res);
        res
    }

    /// Removes all rsync modules that were not visited during this run.
    ///
    /// This must only be called after all validation threads have been
    /// joined, i.e., when the visited set is final.
    pub fn prune_unvisited(&self) {
        let visited = self.visited.lock().expect(
            "visited modules lock poisoned"
        );
        let base = self.collector.working_dir.join("rsync");
        let authorities = match fs::read_dir(&base) {
            Ok(iter) => iter,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        "Failed to read directory {}: {}", base.display(), err
                    );
                }
                return
            }
        };
        for authority in authorities.flatten() {
            let modules = match fs::read_dir(authority.path()) {
                Ok(iter) => iter,
                Err(_) => continue,
            };
            for module in modules.flatten() {
                let key = format!(
                    "{}/{}",
                    authority.file_name().to_string_lossy(),
                    module.file_name().to_string_lossy(),
                );
                if visited.contains(&key) {
                    continue
                }
                debug!("Removing unused repository {}", key);
                if let Err(err) = fs::remove_dir_all(module.path()) {
                    warn!(
                        "Failed to remove unused repository {}: {}", key, err
                    );
                }
            }
        }
    }
}


//------------ RsyncCommand --------------------------------------------------

/// The command to run rsync.
#[derive(Clone, Debug)]
struct RsyncCommand {
    /// The actual command.
    command: String,
}

impl RsyncCommand {
    /// Creates a new rsync command from the config.
    fn new(config: &Config) -> Self {
        RsyncCommand {
            command: config.rsync_command.clone(),
        }
    }

    /// Mirrors a remote rsync directory into a local one.
    ///
    /// Returns whether the transfer succeeded. All diagnostics are logged.
    fn update(&self, source: &str, destination: &Path) -> bool {
        debug!("rsyncing from {}.", source);
        let output = Command::new(&self.command)
            .args(RSYNC_ARGS)
            .arg(source)
            .arg(destination)
            .output();
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                error!(
                    "Failed to run command {}: {}", self.command, err
                );
                return false
            }
        };
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            warn!("rsync {}: {}", source, line);
        }
        if output.status.success() {
            true
        }
        else {
            warn!(
                "rsync {} failed with status {}.", source, output.status
            );
            false
        }
    }
}


//------------ Helper Functions ----------------------------------------------

/// Returns the key identifying an rsync module in the visited set.
fn module_key(uri: &uri::Rsync) -> String {
    format!("{}/{}", uri.canonical_authority(), uri.module_name())
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;
    use crate::config::Config;

    fn collector(dir: &Path, rsync_command: &str) -> Collector {
        let mut config = Config::test_config(dir);
        config.rsync_command = rsync_command.into();
        Collector::new(&config).unwrap()
    }

    #[test]
    fn rsync_uri_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path(), "true");
        let uri = uri::Rsync::from_str(
            "rsync://example.com/module/alpha/beta.cer"
        ).unwrap();
        assert_eq!(
            collector.rsync_path(&uri),
            dir.path().join("rsync/example.com/module/alpha/beta.cer")
        );
    }

    #[test]
    fn https_uri_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path(), "true");
        let uri = uri::Https::from_str(
            "https://example.com/ta/root.cer"
        ).unwrap();
        assert_eq!(
            collector.https_path(&uri),
            dir.path().join("https/example.com/ta/root.cer")
        );
    }

    #[test]
    fn modules_update_once() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path(), "true");
        let run = collector.start();
        let uri = uri::Rsync::from_str(
            "rsync://example.com/module/alpha/beta.cer"
        ).unwrap();
        let sibling = uri::Rsync::from_str(
            "rsync://example.com/module/gamma.roa"
        ).unwrap();
        assert!(run.update_module(&uri));
        assert!(run.update_module(&sibling));
        assert_eq!(run.updated.lock().unwrap().len(), 1);
        assert!(
            run.visited.lock().unwrap().contains("example.com/module")
        );
    }

    #[test]
    fn failed_module_is_still_visited() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path(), "false");
        let run = collector.start();
        let uri = uri::Rsync::from_str(
            "rsync://example.com/module/alpha/beta.cer"
        ).unwrap();
        assert!(!run.update_module(&uri));
        assert!(
            run.visited.lock().unwrap().contains("example.com/module")
        );
    }

    #[test]
    fn prune_removes_unvisited_modules() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path(), "true");
        fs::create_dir_all(
            dir.path().join("rsync/example.com/keep/sub")
        ).unwrap();
        fs::create_dir_all(
            dir.path().join("rsync/example.com/drop/sub")
        ).unwrap();
        let run = collector.start();
        let uri = uri::Rsync::from_str(
            "rsync://example.com/keep/sub/file.cer"
        ).unwrap();
        run.update_module(&uri);
        run.prune_unvisited();
        assert!(dir.path().join("rsync/example.com/keep").exists());
        assert!(!dir.path().join("rsync/example.com/drop").exists());
    }
}
