//! Recently-played history: most-recent-first, deduplicated by stream URL.

use serde::{Deserialize, Serialize};

use crate::protocol::Station;

/// Maximum number of stations kept in the history.
pub const RECENT_CAPACITY: usize = 7;

/// One history row.  Wire shape is `{name, link, genre}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecentEntry {
    pub name: String,
    pub link: String,
    #[serde(default)]
    pub genre: String,
}

impl From<&Station> for RecentEntry {
    fn from(station: &Station) -> Self {
        Self {
            name: station.name.clone(),
            link: station.stream_url.clone(),
            genre: station.genre_line(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecentlyPlayed {
    entries: Vec<RecentEntry>,
}

impl RecentlyPlayed {
    /// Build from persisted entries, repairing anything a foreign writer may
    /// have left behind (duplicates, overflow).
    pub fn from_entries(entries: Vec<RecentEntry>) -> Self {
        let mut list = Self::default();
        for entry in entries.into_iter().rev() {
            list.push(entry);
        }
        list
    }

    /// Move `entry` to the front, dropping any older row with the same link
    /// and truncating to [`RECENT_CAPACITY`].
    pub fn push(&mut self, entry: RecentEntry) {
        self.entries.retain(|e| e.link != entry.link);
        self.entries.insert(0, entry);
        self.entries.truncate(RECENT_CAPACITY);
    }

    pub fn entries(&self) -> &[RecentEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize) -> RecentEntry {
        RecentEntry {
            name: format!("Station {n}"),
            link: format!("https://stream.example/{n}"),
            genre: "jazz".into(),
        }
    }

    #[test]
    fn test_push_is_most_recent_first() {
        let mut list = RecentlyPlayed::default();
        list.push(entry(1));
        list.push(entry(2));
        assert_eq!(list.entries()[0], entry(2));
        assert_eq!(list.entries()[1], entry(1));
    }

    #[test]
    fn test_repeat_push_moves_to_front_without_duplicates() {
        let mut list = RecentlyPlayed::default();
        for n in 1..=4 {
            list.push(entry(n));
        }
        list.push(entry(2));
        list.push(entry(2));

        assert_eq!(list.len(), 4);
        assert_eq!(list.entries()[0], entry(2));
        let links: Vec<&str> = list.entries().iter().map(|e| e.link.as_str()).collect();
        assert_eq!(links.iter().filter(|l| **l == entry(2).link).count(), 1);
    }

    #[test]
    fn test_dedup_is_by_link_not_name() {
        let mut list = RecentlyPlayed::default();
        list.push(entry(1));
        let mut renamed = entry(1);
        renamed.name = "Renamed".into();
        list.push(renamed.clone());
        assert_eq!(list.entries(), &[renamed]);
    }

    #[test]
    fn test_capacity_is_seven() {
        let mut list = RecentlyPlayed::default();
        for n in 0..20 {
            list.push(entry(n));
        }
        assert_eq!(list.len(), RECENT_CAPACITY);
        assert_eq!(list.entries()[0], entry(19));
        assert_eq!(list.entries()[6], entry(13));
    }

    #[test]
    fn test_from_entries_keeps_order_and_repairs() {
        let stored = vec![entry(3), entry(2), entry(3), entry(1)];
        let list = RecentlyPlayed::from_entries(stored);
        assert_eq!(list.entries(), &[entry(3), entry(2), entry(1)]);

        let overflow: Vec<RecentEntry> = (0..10).map(entry).collect();
        let list = RecentlyPlayed::from_entries(overflow);
        assert_eq!(list.len(), RECENT_CAPACITY);
        assert_eq!(list.entries()[0], entry(0));
    }
}
