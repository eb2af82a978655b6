//! Service store reading definitions from a YAML / TOML / JSON file.
//!
//! The file is read once per store; every page is cut from that snapshot.
use std::path::PathBuf;

use async_trait::async_trait;
use eyre::Result;
use tokio::sync::OnceCell;

use crate::{
    config::{loader::load_service_file, service::ServiceDefinition},
    ports::service_store::{ServicePage, ServiceStore},
};

pub struct FileServiceStore {
    path: PathBuf,
    snapshot: OnceCell<Vec<ServiceDefinition>>,
}

impl FileServiceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: OnceCell::new(),
        }
    }

    async fn read_all(&self) -> Result<Vec<ServiceDefinition>> {
        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || load_service_file(&path)).await??;
        tracing::debug!(
            "Read {} service definition(s) from {}",
            file.services.len(),
            self.path.display()
        );
        Ok(file.services)
    }

    /// Definitions as first read; a failed read is retried on the next call.
    async fn snapshot(&self) -> Result<&[ServiceDefinition]> {
        let all = self.snapshot.get_or_try_init(|| self.read_all()).await?;
        Ok(all.as_slice())
    }
}

#[async_trait]
impl ServiceStore for FileServiceStore {
    async fn list_services(&self, page_no: usize, page_size: usize) -> Result<ServicePage> {
        let all = self.snapshot().await?;

        let total = all.len();
        let skip = page_no.saturating_sub(1).saturating_mul(page_size);
        let items = all.iter().skip(skip).take(page_size).cloned().collect();
        Ok(ServicePage { items, total })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn services_file(count: usize) -> NamedTempFile {
        let mut yaml = String::from("services:\n");
        for i in 0..count {
            yaml.push_str(&format!(
                "  - name: svc{i}\n    kind: http\n    http_rule: {{ rule_type: prefix_url, rule: /svc{i} }}\n    load_balance: {{ addrs: [\"127.0.0.1:900{i}\"] }}\n"
            ));
        }
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(file, "{yaml}").unwrap();
        file
    }

    #[tokio::test]
    async fn test_paging() {
        let file = services_file(5);
        let store = FileServiceStore::new(file.path());

        let first = store.list_services(1, 2).await.unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0].name, "svc0");

        let last = store.list_services(3, 2).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].name, "svc4");

        let beyond = store.list_services(4, 2).await.unwrap();
        assert!(beyond.items.is_empty());
    }

    #[tokio::test]
    async fn test_pages_come_from_one_read() {
        let file = services_file(4);
        let store = FileServiceStore::new(file.path());
        let first = store.list_services(1, 2).await.unwrap();

        // Edited between two pages: the load still sees the first version.
        std::fs::write(
            file.path(),
            "services:\n  - name: other\n    kind: http\n    http_rule: { rule_type: prefix_url, rule: /other }\n    load_balance: { addrs: [\"127.0.0.1:9100\"] }\n",
        )
        .unwrap();
        let second = store.list_services(2, 2).await.unwrap();
        assert_eq!(first.total, 4);
        assert_eq!(second.total, 4);
        assert_eq!(second.items[0].name, "svc2");

        let fresh = FileServiceStore::new(file.path());
        assert_eq!(fresh.list_services(1, 2).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let store = FileServiceStore::new("/no/such/services.yaml");
        assert!(store.list_services(1, 10).await.is_err());
    }
}
