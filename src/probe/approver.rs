// New-page approver
//
// Remembers URLs that failed doublefetch so future observations
// short-circuit before any network traffic. Bloom-backed: a false
// positive suppresses one page report, which is the safe direction.

use crate::error::Result;
use crate::probe::bloom::PersistedBloomFilter;
use crate::storage::KvStorage;
use std::sync::Arc;

const FILTER_NAME: &str = "private-pages";
const FILTER_VERSION: u32 = 1;

pub struct NewPageApprover {
    filter: PersistedBloomFilter,
}

impl NewPageApprover {
    pub fn new(storage: Arc<dyn KvStorage>) -> Result<Self> {
        Ok(Self {
            filter: PersistedBloomFilter::new(FILTER_NAME, FILTER_VERSION, storage)?,
        })
    }

    /// Probabilistic probe; `true` may be a false positive.
    pub async fn might_be_marked_as_private(&self, url: &str) -> Result<bool> {
        self.filter.test(url).await
    }

    /// Remember a rejected URL.
    pub async fn mark_as_private(&self, url: &str) -> Result<()> {
        self.filter.add(url).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.filter.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn marked_urls_are_remembered() {
        let approver = NewPageApprover::new(Arc::new(MemoryStorage::new())).unwrap();
        let url = "https://mail.example.com/inbox/42";

        assert!(!approver.might_be_marked_as_private(url).await.unwrap());
        approver.mark_as_private(url).await.unwrap();
        assert!(approver.might_be_marked_as_private(url).await.unwrap());
    }

    #[tokio::test]
    async fn survives_restart_after_flush() {
        let storage = Arc::new(MemoryStorage::new());
        let url = "https://bank.example.com/account";
        {
            let approver =
                NewPageApprover::new(storage.clone() as Arc<dyn KvStorage>).unwrap();
            approver.mark_as_private(url).await.unwrap();
            approver.flush().await.unwrap();
        }
        let approver = NewPageApprover::new(storage).unwrap();
        assert!(approver.might_be_marked_as_private(url).await.unwrap());
    }
}
