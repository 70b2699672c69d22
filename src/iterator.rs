//! Merge iteration over sorted runs, used by compaction.
//!
//! Each source run gets a pull-based cursor that walks its blocks in key
//! order and decodes entries lazily, one block at a time. A min-heap over
//! the cursor heads drives the k-way merge: the smallest key pops first,
//! and when the same key appears in several runs the youngest run (lowest
//! source index) pops first and shadows the rest.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use crate::codec::{self, Record};
use crate::error::Result;
use crate::sstable::SSTable;

/// Pull-based cursor over one sorted run, yielding `(key, record)` in
/// ascending key order.
pub struct TableCursor {
    table: Arc<SSTable>,
    next_block: usize,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
}

impl TableCursor {
    pub fn new(table: Arc<SSTable>) -> Self {
        Self {
            table,
            next_block: 0,
            buffer: VecDeque::new(),
        }
    }

    fn fill_buffer(&mut self) -> bool {
        while self.buffer.is_empty() {
            let block = match self.table.blocks().get(self.next_block) {
                Some(block) => block,
                None => return false,
            };
            self.next_block += 1;
            self.buffer = block
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }
        true
    }
}

impl Iterator for TableCursor {
    type Item = Result<(Vec<u8>, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.fill_buffer() {
            return None;
        }
        let (key, encoded) = self.buffer.pop_front()?;
        match codec::decode_record(&encoded) {
            Ok(record) => Some(Ok((key, record))),
            Err(e) => Some(Err(e)),
        }
    }
}

struct HeapEntry {
    key: Vec<u8>,
    record: Record,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap: reverse the key order so the smallest key
    // pops first, and on key ties make the lowest source index (the newest
    // run) pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal => other.source.cmp(&self.source),
            ord => ord.reverse(),
        }
    }
}

/// K-way merge of cursors, newest source first. Emits each distinct key
/// once, taking the entry from the youngest run that holds it.
pub struct MergeIterator {
    cursors: Vec<TableCursor>,
    heap: BinaryHeap<HeapEntry>,
    last_key: Option<Vec<u8>>,
    failed: bool,
}

impl MergeIterator {
    /// `cursors[0]` must be the newest run; age increases with index.
    pub fn new(mut cursors: Vec<TableCursor>) -> Result<Self> {
        let mut heap = BinaryHeap::new();
        for (source, cursor) in cursors.iter_mut().enumerate() {
            if let Some(head) = cursor.next() {
                let (key, record) = head?;
                heap.push(HeapEntry {
                    key,
                    record,
                    source,
                });
            }
        }
        Ok(Self {
            cursors,
            heap,
            last_key: None,
            failed: false,
        })
    }

    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(head) = self.cursors[source].next() {
            let (key, record) = head?;
            self.heap.push(HeapEntry {
                key,
                record,
                source,
            });
        }
        Ok(())
    }
}

impl Iterator for MergeIterator {
    type Item = Result<(Vec<u8>, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while let Some(entry) = self.heap.pop() {
            if let Err(e) = self.advance(entry.source) {
                self.failed = true;
                return Some(Err(e));
            }

            // Shadowed duplicate: a younger run already yielded this key.
            if self.last_key.as_ref() == Some(&entry.key) {
                continue;
            }

            self.last_key = Some(entry.key.clone());
            return Some(Ok((entry.key, entry.record)));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockBuilder;
    use crate::bloom::BloomFilter;
    use crate::tmpfs::TempDir;
    use std::path::PathBuf;

    fn make_table(path: PathBuf, entries: &[(&[u8], Option<&[u8]>)]) -> Arc<SSTable> {
        // Tiny block budget so multi-block cursors get exercised.
        let mut builder = BlockBuilder::new(64);
        let mut bloom = BloomFilter::new(entries.len(), 0.01);
        for (key, value) in entries {
            bloom.add(key);
            let encoded = codec::encode_record(&Record {
                key: key.to_vec(),
                value: value.map(|v| v.to_vec()),
            })
            .unwrap();
            builder.add(key, &encoded);
        }
        Arc::new(SSTable::create(path, builder.build(), bloom, 0).unwrap())
    }

    fn collect(merge: MergeIterator) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        merge
            .map(|r| r.map(|(k, rec)| (k, rec.value)))
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_cursor_walks_all_blocks_in_order() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let entries: Vec<(String, String)> = (0..20)
            .map(|i| (format!("key{i:02}"), format!("value{i}")))
            .collect();
        let refs: Vec<(&[u8], Option<&[u8]>)> = entries
            .iter()
            .map(|(k, v)| (k.as_bytes(), Some(v.as_bytes())))
            .collect();
        let table = make_table(temp_dir.path().join("t.dat"), &refs);
        assert!(table.blocks().len() > 1);

        let keys: Vec<Vec<u8>> = TableCursor::new(table)
            .map(|r| r.map(|(k, _)| k))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(keys.len(), 20);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_merge_disjoint_runs() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let a = make_table(
            temp_dir.path().join("a.dat"),
            &[(b"a", Some(b"1")), (b"c", Some(b"3"))],
        );
        let b = make_table(
            temp_dir.path().join("b.dat"),
            &[(b"b", Some(b"2")), (b"d", Some(b"4"))],
        );

        let merge =
            MergeIterator::new(vec![TableCursor::new(a), TableCursor::new(b)]).unwrap();
        let merged = collect(merge);
        let keys: Vec<&[u8]> = merged.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"a" as &[u8], b"b", b"c", b"d"]);
    }

    #[test]
    fn test_merge_newest_shadows_older() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let newest = make_table(
            temp_dir.path().join("newest.dat"),
            &[(b"k1", Some(b"new")), (b"k3", Some(b"only-new"))],
        );
        let oldest = make_table(
            temp_dir.path().join("oldest.dat"),
            &[(b"k1", Some(b"old")), (b"k2", Some(b"only-old"))],
        );

        let merge =
            MergeIterator::new(vec![TableCursor::new(newest), TableCursor::new(oldest)])
                .unwrap();
        let merged = collect(merge);
        assert_eq!(
            merged,
            vec![
                (b"k1".to_vec(), Some(b"new".to_vec())),
                (b"k2".to_vec(), Some(b"only-old".to_vec())),
                (b"k3".to_vec(), Some(b"only-new".to_vec())),
            ]
        );
    }

    #[test]
    fn test_merge_tombstone_shadows_value() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let newest = make_table(temp_dir.path().join("newest.dat"), &[(b"k1", None)]);
        let oldest = make_table(
            temp_dir.path().join("oldest.dat"),
            &[(b"k1", Some(b"alive"))],
        );

        let merge =
            MergeIterator::new(vec![TableCursor::new(newest), TableCursor::new(oldest)])
                .unwrap();
        let merged = collect(merge);
        assert_eq!(merged, vec![(b"k1".to_vec(), None)]);
    }

    #[test]
    fn test_merge_empty_input() {
        let merge = MergeIterator::new(Vec::new()).unwrap();
        assert_eq!(collect(merge).len(), 0);
    }
}
