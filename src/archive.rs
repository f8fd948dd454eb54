//! CIDS archives: manifests mapping entry paths to content ids
//!
//! A manifest is text with one `<path> <cid>` pair per line. Blank lines
//! and lines starting with `#` are ignored.

use crate::cid::CidResolver;
use crate::details::Payload;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub cid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CidsArchive {
    entries: Vec<ArchiveEntry>,
}

/// What the `/cids` endpoint answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveLookup {
    /// Entry paths, one per line
    Listing(String),
    Content(Vec<u8>),
    ArchiveNotFound,
    EntryNotFound,
}

impl CidsArchive {
    pub fn parse(manifest: &str) -> Self {
        let entries = manifest
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let (path, cid) = line.rsplit_once(char::is_whitespace)?;
                Some(ArchiveEntry {
                    path: path.trim().trim_start_matches('/').to_string(),
                    cid: cid.trim().to_string(),
                })
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn find(&self, path: &str) -> Option<&ArchiveEntry> {
        let path = path.trim_start_matches('/');
        self.entries.iter().find(|entry| entry.path == path)
    }

    pub fn listing(&self) -> String {
        self.entries
            .iter()
            .map(|entry| entry.path.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Answer a `/cids` query: list the archive, or return one entry's content
pub fn lookup(resolver: &CidResolver, archive_id: &str, path: Option<&str>) -> ArchiveLookup {
    let Some(manifest) = resolver.resolve_text(archive_id) else {
        return ArchiveLookup::ArchiveNotFound;
    };
    let archive = CidsArchive::parse(&manifest);

    match path.filter(|p| !p.trim_matches('/').is_empty()) {
        None => ArchiveLookup::Listing(archive.listing()),
        Some(path) => archive
            .find(path)
            .and_then(|entry| resolver.resolve(&entry.cid, true))
            .map(|payload| ArchiveLookup::Content(Payload::into_bytes(payload)))
            .unwrap_or(ArchiveLookup::EntryNotFound),
    }
}
