//! Plain-text working and crawled proxy lists

use super::PoolSink;
use crate::proxy::models::{CandidateAddress, ProbeResult, WorkingSet};
use crate::proxy::parser::ProxyParser;
use crate::Result;
use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Plain-text proxy lists, one `host:port` per line
#[derive(Debug, Clone)]
pub struct FileStore {
    working_path: PathBuf,
    all_path: Option<PathBuf>,
}

impl FileStore {
    pub fn new(working_path: impl Into<PathBuf>) -> Self {
        Self {
            working_path: working_path.into(),
            all_path: None,
        }
    }

    /// Also keep the full list of crawled candidates
    pub fn with_all_proxies(mut self, all_path: impl Into<PathBuf>) -> Self {
        self.all_path = Some(all_path.into());
        self
    }

    pub fn working_path(&self) -> &Path {
        &self.working_path
    }

    /// Working set saved by a previous run; empty when no file exists yet
    pub fn load_working(&self) -> Result<WorkingSet> {
        if !self.working_path.exists() {
            debug!("No working proxy file at {}", self.working_path.display());
            return Ok(WorkingSet::new());
        }
        let addresses = ProxyParser::parse_file(&self.working_path)?;
        Ok(WorkingSet::from_addresses(addresses))
    }

    /// Overwrite the working proxy file with the given set
    pub async fn save_working(&self, working_set: &WorkingSet) -> Result<()> {
        write_list(&self.working_path, &working_set.addresses()).await?;
        info!(
            "Saved {} working proxies to {}",
            working_set.len(),
            self.working_path.display()
        );
        Ok(())
    }
}

#[async_trait]
impl PoolSink for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn persist(&self, working_set: &WorkingSet, _results: &[ProbeResult]) -> Result<()> {
        self.save_working(working_set).await
    }

    async fn record_candidates(&self, candidates: &[CandidateAddress]) -> Result<()> {
        if let Some(path) = &self.all_path {
            write_list(path, candidates).await?;
            info!("Saved {} crawled proxies to {}", candidates.len(), path.display());
        }
        Ok(())
    }
}

async fn write_list(path: &Path, addresses: &[CandidateAddress]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("error creating directory {}", parent.display()))?;
    }

    let content: String = addresses.iter().map(|a| format!("{}\n", a)).collect();
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("error writing proxy file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::testing::addresses;
    use std::fs;

    #[tokio::test]
    async fn test_persist_overwrites_working_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("working_proxies.txt"));

        let first = WorkingSet::from_addresses(addresses(&["10.0.0.1:80", "10.0.0.2:80"]));
        store.persist(&first, &[]).await.unwrap();
        let second = WorkingSet::from_addresses(addresses(&["10.0.0.3:80"]));
        store.persist(&second, &[]).await.unwrap();

        assert_eq!(
            fs::read_to_string(store.working_path()).unwrap(),
            "10.0.0.3:80\n"
        );
        assert_eq!(store.load_working().unwrap(), second);
    }

    #[tokio::test]
    async fn test_persist_empty_set_truncates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("working_proxies.txt");
        fs::write(&path, "10.0.0.1:80\n").unwrap();

        FileStore::new(&path)
            .persist(&WorkingSet::new(), &[])
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[tokio::test]
    async fn test_record_candidates_writes_all_proxies_file() {
        let dir = tempfile::tempdir().unwrap();
        let all = dir.path().join("lists").join("proxies.txt");
        let store = FileStore::new(dir.path().join("working.txt")).with_all_proxies(&all);

        store
            .record_candidates(&addresses(&["10.0.0.1:80", "10.0.0.2:3128"]))
            .await
            .unwrap();

        assert_eq!(
            fs::read_to_string(&all).unwrap(),
            "10.0.0.1:80\n10.0.0.2:3128\n"
        );
    }

    #[tokio::test]
    async fn test_record_candidates_without_all_path_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("working.txt"));

        store
            .record_candidates(&addresses(&["10.0.0.1:80"]))
            .await
            .unwrap();

        assert!(!store.working_path().exists());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("missing.txt"));
        assert!(store.load_working().unwrap().is_empty());
    }

    #[test]
    fn test_load_skips_invalid_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("working.txt");
        fs::write(&path, "10.0.0.1:80\n# saved\nnot-a-proxy\n10.0.0.1:80\n").unwrap();

        let set = FileStore::new(&path).load_working().unwrap();
        assert_eq!(set.addresses(), addresses(&["10.0.0.1:80"]));
    }
}
