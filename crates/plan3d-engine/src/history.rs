use plan3d_contracts::errors::ServiceError;
use plan3d_contracts::history::HistoryEntry;

pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 12;

/// Vendor-side record of past mesh-generation jobs.
pub trait HistorySource: Send + Sync {
    /// Most recent jobs, newest first, at most `page_size`.
    fn list_recent(&self, page_size: usize) -> Result<Vec<HistoryEntry>, ServiceError>;

    fn job_detail(&self, task_id: &str) -> Result<HistoryEntry, ServiceError>;
}

/// Resolves `/open` targets: a 1-based index into `listing`, or a task id.
pub fn select_entry<'a>(listing: &'a [HistoryEntry], target: &str) -> Option<&'a HistoryEntry> {
    let target = target.trim();
    if target.is_empty() {
        return None;
    }
    if let Ok(index) = target.parse::<usize>() {
        if (1..=listing.len()).contains(&index) {
            return listing.get(index - 1);
        }
    }
    listing.iter().find(|entry| entry.task_id == target)
}

#[cfg(test)]
mod tests {
    use plan3d_contracts::jobs::JobStatus;

    use super::*;

    fn entry(task_id: &str) -> HistoryEntry {
        HistoryEntry {
            task_id: task_id.to_string(),
            status: JobStatus::Succeeded,
            progress: 100,
            mesh: None,
            thumbnail: None,
            source_image: None,
            prompt: None,
            created_at: None,
        }
    }

    #[test]
    fn select_by_index_or_task_id() {
        let listing = vec![entry("a"), entry("b"), entry("42")];
        assert_eq!(select_entry(&listing, "2").map(|e| e.task_id.as_str()), Some("b"));
        assert_eq!(select_entry(&listing, "a").map(|e| e.task_id.as_str()), Some("a"));
        assert_eq!(select_entry(&listing, "42").map(|e| e.task_id.as_str()), Some("42"));
        assert!(select_entry(&listing, "0").is_none());
        assert!(select_entry(&listing, " ").is_none());
    }
}
