//! Directory resolution helpers shared by plugins.
//!
//! # Flat tables
//! Many formats store only a start offset per entry.  [`derive_lengths`]
//! sorts the offsets and subtracts neighbours; the last entry runs to the
//! end of the data region.  Offset `0` is a placeholder in these tables and
//! never takes part in the sort.
//!
//! # Trees
//! [`DirectoryTree`] holds directory nodes linked by parent index and, when
//! the format uses them, positional file ranges (`first_file ..= last_file`,
//! with `-1` as "until the next directory starts").  Files are attached to
//! directories after the whole table is read, so entries that precede their
//! directory still resolve.
//!
//! [`walk_tables`] follows directory entries that point at sub-tables by
//! offset, depth-first, refusing to revisit a table.

use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::cursor::ByteCursor;
use crate::error::{ArcError, Result};
use crate::resource::{EntryCollector, ResourceBuilder};

/// `last_file` sentinel: the range ends where the next directory begins.
pub const UNTIL_NEXT: i64 = -1;

// ── Flat offset tables ───────────────────────────────────────────────────────

/// Lengths for entries that only store start offsets, in input order.
///
/// `None` marks a placeholder (offset 0) or an offset past `end`.  Equal
/// offsets yield zero-length entries.
pub fn derive_lengths(offsets: &[u64], end: u64) -> Vec<Option<u64>> {
    let mut order: Vec<usize> = (0..offsets.len())
        .filter(|&i| offsets[i] != 0 && offsets[i] <= end)
        .collect();
    order.sort_by_key(|&i| (offsets[i], i));

    let mut lengths = vec![None; offsets.len()];
    for (k, &i) in order.iter().enumerate() {
        let next = order.get(k + 1).map_or(end, |&j| offsets[j]);
        lengths[i] = Some(next - offsets[i]);
    }
    lengths
}

/// Apply [`derive_lengths`] to every builder in `entries`.
///
/// Builders without an offset, with a placeholder offset, or starting past
/// `end` are removed and counted as dropped.  Returns how many were removed.
pub fn derive_builder_lengths(entries: &mut EntryCollector, end: u64) -> usize {
    let offsets: Vec<u64> = entries.builders().iter().map(|b| b.offset.unwrap_or(0)).collect();
    let lengths = derive_lengths(&offsets, end);

    let mut kept    = Vec::with_capacity(offsets.len());
    let mut removed = Vec::new();
    for (index, (mut builder, len)) in entries.builders_mut().drain(..).zip(lengths).enumerate() {
        match len {
            Some(len) => {
                builder.stored_len = Some(len);
                if builder.exporter.is_none() {
                    builder.decompressed_len = Some(len);
                }
                kept.push(builder);
            }
            None => removed.push((index, offsets[index])),
        }
    }
    *entries.builders_mut() = kept;
    for (index, offset) in &removed {
        let reason = if *offset == 0 {
            ArcError::mismatch("placeholder offset")
        } else {
            ArcError::OutOfBounds { what: "entry offset", offset: *offset, len: 0, limit: end }
        };
        entries.drop_entry(*index, &reason);
    }
    removed.len()
}

// ── Directory trees ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct DirNode {
    pub name:       String,
    pub parent:     Option<usize>,
    /// On-disk identifier, for formats whose files name their parent by ID.
    pub key:        Option<u64>,
    pub first_file: Option<u64>,
    pub last_file:  Option<i64>,
}

#[derive(Debug, Clone)]
pub struct DirectoryTree {
    nodes:     Vec<DirNode>,
    by_key:    HashMap<u64, usize>,
    max_depth: usize,
}

impl DirectoryTree {
    pub fn new(max_depth: usize) -> Self {
        Self { nodes: Vec::new(), by_key: HashMap::new(), max_depth }
    }

    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }
    pub fn node(&self, index: usize) -> Option<&DirNode> { self.nodes.get(index) }

    pub fn add(&mut self, name: impl Into<String>, parent: Option<usize>) -> usize {
        self.nodes.push(DirNode { name: name.into(), parent, ..DirNode::default() });
        self.nodes.len() - 1
    }

    pub fn add_with_key(&mut self, name: impl Into<String>, parent: Option<usize>, key: u64) -> usize {
        let index = self.add(name, parent);
        self.nodes[index].key = Some(key);
        self.by_key.insert(key, index);
        index
    }

    /// Re-point a node at its parent once the parent is known.
    pub fn set_parent(&mut self, index: usize, parent: Option<usize>) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.parent = parent;
        }
    }

    pub fn index_of_key(&self, key: u64) -> Option<usize> {
        self.by_key.get(&key).copied()
    }

    pub fn set_file_range(&mut self, index: usize, first: u64, last: i64) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.first_file = Some(first);
            node.last_file  = Some(last);
        }
    }

    /// Depth-first walk from every root, folding names with `accumulate`.
    ///
    /// Nodes whose parent link is dangling or cyclic are never reached and
    /// are reported once.  Exceeding the depth limit is a `FormatMismatch`.
    pub fn walk<A, F, V>(&self, root: A, accumulate: F, mut visit: V) -> Result<()>
    where
        A: Clone,
        F: Fn(&A, &DirNode) -> A,
        V: FnMut(usize, &A),
    {
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        let mut stack: Vec<(usize, A, usize)> = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            match node.parent {
                Some(p) if p < self.nodes.len() && p != i => children[p].push(i),
                Some(_) => {}
                None    => stack.push((i, accumulate(&root, node), 0)),
            }
        }
        stack.reverse();

        let mut seen = 0usize;
        while let Some((i, acc, depth)) = stack.pop() {
            if depth > self.max_depth {
                return Err(ArcError::mismatch(format!(
                    "directory nesting deeper than {}",
                    self.max_depth
                )));
            }
            visit(i, &acc);
            seen += 1;
            for &c in children[i].iter().rev() {
                stack.push((c, accumulate(&acc, &self.nodes[c]), depth + 1));
            }
        }
        if seen < self.nodes.len() {
            warn!(unreachable = self.nodes.len() - seen, "directories with no path to a root");
        }
        Ok(())
    }

    /// Full `sep`-joined path of every node (`None` if unreachable).
    pub fn paths(&self, sep: &str) -> Result<Vec<Option<String>>> {
        let mut out = vec![None; self.nodes.len()];
        self.walk(
            String::new(),
            |prefix, node| join(prefix, &node.name, sep),
            |i, path| out[i] = Some(path.clone()),
        )?;
        Ok(out)
    }

    /// Owning directory of each of `file_count` files, from positional ranges.
    ///
    /// Ranges are applied in order of their first file, so a directory whose
    /// range starts inside a broader one claims those files.
    pub fn owners_by_range(&self, file_count: usize) -> Vec<Option<usize>> {
        let mut ranged: Vec<(u64, usize)> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.first_file.map(|f| (f, i)))
            .collect();
        ranged.sort();

        let mut owners = vec![None; file_count];
        for (k, &(first, i)) in ranged.iter().enumerate() {
            let last = match self.nodes[i].last_file {
                Some(l) if l >= 0 => l as u64,
                _ => match ranged[k + 1..].iter().find(|(f, _)| *f > first) {
                    Some(&(next, _)) => next - 1,
                    None => (file_count as u64).saturating_sub(1),
                },
            };
            if file_count == 0 || first > last {
                continue;
            }
            let hi = last.min(file_count as u64 - 1);
            for f in first..=hi {
                owners[f as usize] = Some(i);
            }
        }
        owners
    }

    /// Owning directory of each file, from the parent key each file carries.
    pub fn owners_by_key(&self, parent_keys: &[u64]) -> Vec<Option<usize>> {
        parent_keys.iter().map(|k| self.index_of_key(*k)).collect()
    }

    /// Second pass: prefix every builder with its owner's path.
    pub fn apply_prefixes(
        &self,
        builders: &mut [ResourceBuilder],
        owners: &[Option<usize>],
        sep: &str,
    ) -> Result<()> {
        let paths = self.paths(sep)?;
        for (builder, owner) in builders.iter_mut().zip(owners) {
            if let Some(path) = owner.and_then(|o| paths.get(o)).and_then(|p| p.as_deref()) {
                builder.prefix_name(path);
            }
        }
        Ok(())
    }
}

fn join(prefix: &str, name: &str, sep: &str) -> String {
    match (prefix.is_empty(), name.is_empty()) {
        (_, true)     => prefix.to_string(),
        (true, false) => name.to_string(),
        _             => format!("{prefix}{sep}{name}"),
    }
}

// ── Offset-linked sub-tables ─────────────────────────────────────────────────

/// One row of a directory table.
#[derive(Debug)]
pub enum TableItem {
    /// A sub-directory whose own table lives at `offset`.
    Directory { name: String, offset: u64 },
    File(ResourceBuilder),
}

/// Depth-first walk over tables linked by offset.
///
/// `read_table` parses the table at the given offset.  Files are pushed into
/// `entries` with their directory path prefixed.  A sub-table that fails to
/// parse (or was already visited) is skipped as an anomaly; the root table
/// failing is an error.
pub fn walk_tables<F>(
    cursor: &mut ByteCursor,
    root_offset: u64,
    max_depth: usize,
    entries: &mut EntryCollector,
    mut read_table: F,
) -> Result<()>
where
    F: FnMut(&mut ByteCursor, u64) -> Result<Vec<TableItem>>,
{
    let mut visited = HashSet::new();
    let mut stack   = vec![(root_offset, String::new(), 0usize)];

    while let Some((offset, prefix, depth)) = stack.pop() {
        if !visited.insert(offset) {
            entries.anomaly(&format!("directory table at {offset} referenced twice; skipping"));
            continue;
        }
        if depth > max_depth {
            entries.anomaly(&format!("directory table at {offset} nested too deep; skipping"));
            continue;
        }
        let items = match read_table(cursor, offset) {
            Ok(items) => items,
            Err(e) if depth == 0 => return Err(e),
            Err(ArcError::Io(e)) => return Err(ArcError::Io(e)),
            Err(e) => {
                entries.anomaly(&format!("directory table at {offset} unreadable: {e}"));
                continue;
            }
        };
        debug!(offset, depth, items = items.len(), "directory table");

        let mut subdirs = Vec::new();
        for item in items {
            match item {
                TableItem::File(mut builder) => {
                    builder.prefix_name(&prefix);
                    entries.push(builder);
                }
                TableItem::Directory { name, offset } => {
                    subdirs.push((offset, join(&prefix, &name, "/"), depth + 1));
                }
            }
        }
        stack.extend(subdirs.into_iter().rev());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::ArchiveSource;
    use proptest::prelude::*;

    #[test]
    fn derives_lengths_from_sorted_offsets() {
        assert_eq!(
            derive_lengths(&[16, 100, 250], 300),
            vec![Some(84), Some(150), Some(50)]
        );
        assert_eq!(
            derive_lengths(&[250, 16, 0, 100], 300),
            vec![Some(50), Some(84), None, Some(150)]
        );
        assert_eq!(derive_lengths(&[10, 10, 400], 300), vec![Some(0), Some(290), None]);
    }

    proptest! {
        #[test]
        fn derived_lengths_cover_the_archive(
            mut offsets in prop::collection::vec(1u64..10_000, 1..64),
            tail in 0u64..10_000,
        ) {
            let end = offsets.iter().copied().max().unwrap_or(0) + tail;
            let lengths = derive_lengths(&offsets, end);
            let total: u64 = lengths.iter().map(|l| l.unwrap()).sum();
            offsets.sort_unstable();
            prop_assert_eq!(total + offsets[0], end);
        }
    }

    #[test]
    fn builder_lengths_drop_placeholders() {
        let mut entries = EntryCollector::new(4);
        for off in [100u64, 0, 16, 900] {
            entries.push(ResourceBuilder::at(off));
        }
        let removed = derive_builder_lengths(&mut entries, 300);
        assert_eq!(removed, 2);
        assert_eq!(entries.dropped(), 2);
        let lens: Vec<_> = entries.builders().iter().map(|b| b.stored_len).collect();
        assert_eq!(lens, vec![Some(200), Some(84)]);
    }

    #[test]
    fn paths_accumulate_depth_first() {
        let mut t = DirectoryTree::new(8);
        let root = t.add("", None);
        let data = t.add("data", Some(root));
        let tex  = t.add("textures", Some(data));
        let snd  = t.add("sound", Some(root));
        let paths = t.paths("/").unwrap();
        assert_eq!(paths[tex].as_deref(), Some("data/textures"));
        assert_eq!(paths[snd].as_deref(), Some("sound"));
        assert_eq!(paths[root].as_deref(), Some(""));

        let mut order = Vec::new();
        t.walk(0usize, |d, _| d + 1, |i, d| order.push((i, *d))).unwrap();
        assert_eq!(order, vec![(root, 1), (data, 2), (tex, 3), (snd, 2)]);
    }

    #[test]
    fn cycles_are_unreachable_not_infinite() {
        let mut t = DirectoryTree::new(8);
        let a = t.add("a", None);
        let b = t.add("b", Some(2));
        let c = t.add("c", Some(b));
        let paths = t.paths("/").unwrap();
        assert_eq!(paths[a].as_deref(), Some("a"));
        assert_eq!(paths[b], None);
        assert_eq!(paths[c], None);
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut t = DirectoryTree::new(2);
        let mut parent = None;
        for i in 0..5 {
            parent = Some(t.add(format!("d{i}"), parent));
        }
        assert!(matches!(t.paths("/"), Err(ArcError::FormatMismatch(_))));
    }

    #[test]
    fn open_ended_ranges_stop_at_next_directory() {
        let mut t = DirectoryTree::new(8);
        let root = t.add("", None);
        let a = t.add("a", Some(root));
        let b = t.add("b", Some(root));
        t.set_file_range(a, 0, UNTIL_NEXT);
        t.set_file_range(b, 3, UNTIL_NEXT);
        assert_eq!(
            t.owners_by_range(5),
            vec![Some(a), Some(a), Some(a), Some(b), Some(b)]
        );

        t.set_file_range(a, 0, 1);
        assert_eq!(t.owners_by_range(5), vec![Some(a), Some(a), None, Some(b), Some(b)]);
    }

    #[test]
    fn files_before_their_directory_still_resolve() {
        let mut builders = vec![ResourceBuilder::new("x.txt"), ResourceBuilder::new("y.txt")];
        let parent_keys = [7u64, 9];
        let mut t = DirectoryTree::new(8);
        let root  = t.add_with_key("root", None, 1);
        let nine  = t.add_with_key("nine", None, 9);
        let seven = t.add_with_key("seven", None, 7);
        t.set_parent(nine, Some(root));
        t.set_parent(seven, Some(nine));
        let owners = t.owners_by_key(&parent_keys);
        t.apply_prefixes(&mut builders, &owners, "/").unwrap();
        assert_eq!(builders[0].name, "root/nine/seven/x.txt");
        assert_eq!(builders[1].name, "root/nine/y.txt");
    }

    /// Table layout: u8 count, then per item: u8 kind (0 file, 1 dir),
    /// u8 name byte, u8 offset (dir: table offset, file: data offset).
    fn read_tiny_table(c: &mut ByteCursor, at: u64) -> Result<Vec<TableItem>> {
        c.seek(at)?;
        let n = c.u8()?;
        let mut items = Vec::new();
        for _ in 0..n {
            let kind = c.u8()?;
            let name = (c.u8()? as char).to_string();
            let off  = c.u8()? as u64;
            items.push(match kind {
                0 => TableItem::File(ResourceBuilder::new(name).offset(off).stored_len(0)),
                1 => TableItem::Directory { name, offset: off },
                k => return Err(ArcError::mismatch(format!("kind {k}"))),
            });
        }
        Ok(items)
    }

    #[test]
    fn walks_offset_linked_tables() {
        #[rustfmt::skip]
        let bytes = vec![
            // @0: dir d -> 10, file a, dir l -> 0 (loop)
            3, 1, b'd', 10, 0, b'a', 0, 1, b'l', 0,
            // @10: file b, dir x -> 200 (past the end)
            2, 0, b'b', 0, 1, b'x', 200,
        ];
        let src = ArchiveSource::from_bytes("mem", bytes);
        let mut cursor = ByteCursor::new(src);
        let mut entries = EntryCollector::new(0);
        walk_tables(&mut cursor, 0, 8, &mut entries, read_tiny_table).unwrap();
        let names: Vec<_> = entries.builders().iter().map(|b| b.name.clone()).collect();
        assert_eq!(names, vec!["a", "d/b"]);
    }
}
