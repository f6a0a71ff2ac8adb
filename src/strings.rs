//! Per-block string table for the PBF encoder.
//!
//! Interns arbitrary byte strings on first sight and hands out dense,
//! monotonically increasing indices. Index 0 is reserved for the empty
//! string, as required by the on-disk StringTable layout.

use ahash::AHashMap;

#[derive(Debug)]
pub struct StringTable {
    index: AHashMap<Vec<u8>, u32>,
    strings: Vec<Vec<u8>>,
    size_in_bytes: usize,
}

impl StringTable {
    pub fn new() -> StringTable {
        StringTable {
            index: AHashMap::new(),
            strings: vec![Vec::new()],
            size_in_bytes: 0,
        }
    }

    /// Interns a string and returns its index. The same bytes always map to
    /// the same index within one block.
    pub fn add(&mut self, s: &[u8]) -> u32 {
        if s.is_empty() {
            return 0;
        }
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.index.insert(s.to_vec(), idx);
        self.strings.push(s.to_vec());
        self.size_in_bytes += s.len() + 1;
        idx
    }

    /// Number of entries including the reserved empty string.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.len() == 1
    }

    /// Approximate serialized size, used for the block fill estimate.
    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    /// Hands out the strings in index order and resets the table.
    pub fn take(&mut self) -> Vec<Vec<u8>> {
        self.index.clear();
        self.size_in_bytes = 0;
        std::mem::replace(&mut self.strings, vec![Vec::new()])
    }
}

impl Default for StringTable {
    fn default() -> StringTable {
        StringTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn index_zero_is_reserved() {
        let mut st = StringTable::new();
        assert_eq!(st.add(b""), 0);
        assert_eq!(st.add(b"hello"), 1);
        assert_eq!(st.add(b"world"), 2);
        assert_eq!(st.add(b"hello"), 1);
        assert_eq!(st.len(), 3);
        let strings = st.take();
        assert_eq!(
            strings,
            vec![b"".to_vec(), b"hello".to_vec(), b"world".to_vec()]
        );
    }

    #[test]
    fn take_resets() {
        let mut st = StringTable::new();
        st.add(b"a");
        st.take();
        assert!(st.is_empty());
        assert_eq!(st.size_in_bytes(), 0);
        assert_eq!(st.add(b"b"), 1);
    }

    #[test]
    fn accepts_arbitrary_bytes() {
        let mut st = StringTable::new();
        let idx = st.add(&[0xff, 0x00, 0x7f]);
        assert_eq!(st.take()[idx as usize], vec![0xff, 0x00, 0x7f]);
    }

    proptest! {
        /// Indices match a reference interning model.
        #[test]
        fn matches_reference_model(words in prop::collection::vec("\\PC*", 1..100)) {
            let mut st = StringTable::new();
            let mut reference: HashMap<String, u32> = HashMap::new();
            let mut next = 1u32;
            for word in &words {
                let idx = st.add(word.as_bytes());
                if word.is_empty() {
                    prop_assert_eq!(idx, 0);
                    continue;
                }
                let expected = *reference.entry(word.clone()).or_insert_with(|| {
                    let idx = next;
                    next += 1;
                    idx
                });
                prop_assert_eq!(idx, expected);
            }
            let strings = st.take();
            prop_assert_eq!(strings.len() as u32, next);
        }
    }
}
