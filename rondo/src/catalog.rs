//! Series catalog: primary, by-metric, and by-tag hash maps.
//!
//! The catalog resolves a canonical series string to its B-tree index, and
//! resolves metric-name / tag predicates to the *set* of indexes whose
//! series match. Only the primary map is persisted (`main.db`); the
//! by-metric and by-tag maps are derived and rebuilt on every mount by
//! walking the primary, exactly as bolo's `db2_open` rebuilds its `refs`
//! hash — they exist purely to make planning fast, not as a second source
//! of truth.
//!
//! Grounded on the `primary`/`refs` hashes and `ref()`/`alsoref()` logic in
//! bolo's `db2.c`; the registry-struct-plus-persistence shape follows the
//! teacher's `series.rs`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::btree::BTree;
use crate::error::{Result, RondoError};
use crate::hmac;
use crate::tags;

/// Renders a 64-bit id as the hex dotted-quad path component bolo's
/// `id2path` uses: `AAAA.BBBB.CCCC.DDDD`.
#[must_use]
pub fn id_to_name(id: u64) -> String {
    format!("{:04X}.{:04X}.{:04X}.{:04X}", (id >> 48) & 0xffff, (id >> 32) & 0xffff, (id >> 16) & 0xffff, id & 0xffff)
}

/// Full path for an index file of the given id under `root/idx/`.
#[must_use]
pub fn index_path(root: &Path, id: u64) -> PathBuf {
    let name = id_to_name(id);
    let dir_prefix = format!("{:04X}.{:04X}", (id >> 48) & 0xffff, (id >> 32) & 0xffff);
    root.join("idx").join(dir_prefix).join(format!("{name}.idx"))
}

/// The series catalog.
pub struct Catalog {
    /// Canonical series string -> tree id.
    primary: HashMap<String, u64>,
    /// Bare metric name -> tree ids.
    by_metric: HashMap<String, HashSet<u64>>,
    /// `"key"` (existence) or `"key=value"` (equality) -> tree ids.
    by_tag: HashMap<String, HashSet<u64>>,
    /// Open B-tree indexes, keyed by tree id.
    trees: HashMap<u64, BTree>,
    next_id: u64,
}

impl Catalog {
    /// Creates an empty catalog for a freshly initialized database.
    #[must_use]
    pub fn empty() -> Self {
        Catalog {
            primary: HashMap::new(),
            by_metric: HashMap::new(),
            by_tag: HashMap::new(),
            trees: HashMap::new(),
            next_id: 1,
        }
    }

    /// Reads `main.db`'s primary map and opens every referenced index file,
    /// rebuilding the by-metric and by-tag maps from the recovered series
    /// strings.
    pub fn mount(root: &Path, key: &[u8]) -> Result<Self> {
        let main_db = root.join("main.db");
        let raw = std::fs::read(&main_db).map_err(|_| RondoError::NoMainDb)?;
        if raw.len() < hmac::TRAILER_LEN {
            return Err(RondoError::BadHash("main.db too short".to_string()));
        }
        hmac::check(key, &raw, "main.db")?;

        let body = &raw[..raw.len() - hmac::TRAILER_LEN];
        let mut primary = HashMap::new();
        let mut max_id = 0u64;
        let mut pos = 0usize;
        loop {
            if pos + 2 > body.len() {
                return Err(RondoError::BadHash("main.db: truncated record".to_string()));
            }
            let name_len = u16::from_le_bytes([body[pos], body[pos + 1]]) as usize;
            pos += 2;
            if name_len == 0 {
                break;
            }
            if pos + name_len + 8 > body.len() {
                return Err(RondoError::BadHash("main.db: truncated record".to_string()));
            }
            let name = std::str::from_utf8(&body[pos..pos + name_len])
                .map_err(|_| RondoError::BadHash("main.db: non-utf8 series name".to_string()))?
                .to_string();
            pos += name_len;
            let tree_id = u64::from_le_bytes(body[pos..pos + 8].try_into().unwrap());
            pos += 8;

            max_id = max_id.max(tree_id);
            primary.insert(name, tree_id);
        }

        let mut trees = HashMap::new();
        let mut by_metric: HashMap<String, HashSet<u64>> = HashMap::new();
        let mut by_tag: HashMap<String, HashSet<u64>> = HashMap::new();
        for (series, &tree_id) in &primary {
            let tree = BTree::open(&index_path(root, tree_id))?;
            trees.insert(tree_id, tree);
            index_series_refs(series, tree_id, &mut by_metric, &mut by_tag);
        }

        Ok(Catalog { primary, by_metric, by_tag, trees, next_id: max_id + 1 })
    }

    /// Resolves a canonical series string to its tree id, creating a new
    /// index (and its backing file under `root/idx/`) if this is the first
    /// time the series has been seen.
    pub fn upsert(&mut self, root: &Path, series: &str) -> Result<u64> {
        if let Some(&id) = self.primary.get(series) {
            return Ok(id);
        }
        let id = self.next_id;
        self.next_id += 1;

        let path = index_path(root, id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tree = BTree::create(&path)?;
        self.trees.insert(id, tree);
        self.primary.insert(series.to_string(), id);
        index_series_refs(series, id, &mut self.by_metric, &mut self.by_tag);
        Ok(id)
    }

    /// Looks up an already-registered series' tree id.
    #[must_use]
    pub fn resolve(&self, series: &str) -> Option<u64> {
        self.primary.get(series).copied()
    }

    /// All tree ids for series whose bare metric name matches.
    #[must_use]
    pub fn resolve_metric(&self, metric: &str) -> HashSet<u64> {
        self.by_metric.get(metric).cloned().unwrap_or_default()
    }

    /// All tree ids for series carrying tag key `key` (any value).
    #[must_use]
    pub fn resolve_tag_exists(&self, key: &str) -> HashSet<u64> {
        self.by_tag.get(key).cloned().unwrap_or_default()
    }

    /// All tree ids for series carrying the exact `key=value` tag pair.
    #[must_use]
    pub fn resolve_tag_eq(&self, key: &str, value: &str) -> HashSet<u64> {
        self.by_tag.get(&format!("{key}={value}")).cloned().unwrap_or_default()
    }

    /// Borrows an open index by tree id.
    #[must_use]
    pub fn tree(&self, id: u64) -> Option<&BTree> {
        self.trees.get(&id)
    }

    /// Mutably borrows an open index by tree id.
    pub fn tree_mut(&mut self, id: u64) -> Option<&mut BTree> {
        self.trees.get_mut(&id)
    }

    /// Serializes the primary map to `main.db`'s binary format (spec §6.2)
    /// and seals it with an HMAC trailer; syncs every open index.
    pub fn sync(&self, root: &Path, key: &[u8]) -> Result<()> {
        for tree in self.trees.values() {
            tree.sync()?;
        }

        let mut body = Vec::new();
        for (name, tree_id) in &self.primary {
            body.extend_from_slice(&(name.len() as u16).to_le_bytes());
            body.extend_from_slice(name.as_bytes());
            body.extend_from_slice(&tree_id.to_le_bytes());
        }
        body.extend_from_slice(&0u16.to_le_bytes()); // terminator

        let mut sealed = body;
        sealed.extend(std::iter::repeat(0u8).take(hmac::TRAILER_LEN));
        hmac::seal(key, &mut sealed);

        let tmp = root.join("main.db.tmp");
        std::fs::write(&tmp, &sealed)?;
        std::fs::rename(&tmp, root.join("main.db"))?;
        Ok(())
    }
}

/// Derives the bare metric name and tag set from a canonical series string
/// and records them in the by-metric / by-tag maps.
fn index_series_refs(
    series: &str,
    tree_id: u64,
    by_metric: &mut HashMap<String, HashSet<u64>>,
    by_tag: &mut HashMap<String, HashSet<u64>>,
) {
    let (metric, tag_str) = series.split_once('|').unwrap_or((series, ""));
    by_metric.entry(metric.to_string()).or_default().insert(tree_id);

    if tag_str.is_empty() {
        return;
    }
    let mut seen_keys = HashSet::new();
    for pair in tag_str.split(',') {
        let Some((k, v)) = pair.split_once('=') else { continue };
        if seen_keys.insert(k.to_string()) {
            by_tag.entry(k.to_string()).or_default().insert(tree_id);
        }
        by_tag.entry(format!("{k}={v}")).or_default().insert(tree_id);
    }
}

/// Builds the canonical series string for `metric` and raw `tags`.
pub fn canonical_series(metric: &str, raw_tags: &str) -> Result<String> {
    Ok(format!("{metric}|{}", tags::parse_and_canonicalize(raw_tags)?))
}
