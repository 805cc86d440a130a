//! The field store: an insertion-ordered mapping from short string keys
//! to typed byte buffers.
//!
//! Every pipeline stage — parsing, digesting, signing, the format
//! walkers — communicates through one of these. Keys beginning with `@`
//! are ephemeral working values and are never emitted into a record.
//!
//! Values are raw byte buffers tagged with a [`FieldKind`]; the indexed
//! accessors reinterpret the buffer as a little array of `u32`, `u64`,
//! or `usize` elements, growing it zero-filled on demand. Out-of-range
//! reads return zero; writes always succeed.

/// Value type tag. Mirrors the wire reality: most fields are text, a few
/// are binary digests or offset arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Binary,
    U32Array,
    U64Array,
    SizeArray,
}

#[derive(Debug, Clone)]
pub struct FieldValue {
    pub kind: FieldKind,
    pub bytes: Vec<u8>,
}

/// Insertion-ordered `key -> FieldValue` container.
///
/// Lookup is linear; stores hold a few dozen fields at most and the
/// order of first insertion is part of the contract.
#[derive(Debug, Clone, Default)]
pub struct FieldStore {
    fields: Vec<(String, FieldValue)>,
}

impl FieldStore {
    pub fn new() -> Self {
        FieldStore { fields: Vec::new() }
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.fields.iter().position(|(k, _)| k == key)
    }

    /// Create or replace. Insertion order is preserved on first insert
    /// only; replacing keeps the original slot.
    pub fn set(&mut self, key: &str, bytes: impl Into<Vec<u8>>, kind: FieldKind) {
        let value = FieldValue { kind, bytes: bytes.into() };
        match self.position(key) {
            Some(i) => self.fields[i].1 = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    pub fn set_text(&mut self, key: &str, value: &str) {
        self.set(key, value.as_bytes().to_vec(), FieldKind::Text);
    }

    pub fn set_bin(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        self.set(key, value, FieldKind::Binary);
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.position(key).map(|i| &self.fields[i].1)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut FieldValue> {
        self.position(key).map(move |i| &mut self.fields[i].1)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    /// Bytes of a field, or an empty slice if absent.
    pub fn bytes(&self, key: &str) -> &[u8] {
        self.get(key).map(|v| v.bytes.as_slice()).unwrap_or(&[])
    }

    /// Text view of a field. Non-UTF8 bytes are replaced; absent fields
    /// read as empty.
    pub fn text(&self, key: &str) -> String {
        String::from_utf8_lossy(self.bytes(key)).into_owned()
    }

    /// True when the field exists and is non-empty.
    pub fn is_set(&self, key: &str) -> bool {
        !self.bytes(key).is_empty()
    }

    pub fn len_of(&self, key: &str) -> usize {
        self.bytes(key).len()
    }

    /// Grow an existing value (creating it as needed).
    pub fn append(&mut self, key: &str, more: &[u8]) {
        match self.get_mut(key) {
            Some(v) => v.bytes.extend_from_slice(more),
            None => self.set(key, more.to_vec(), FieldKind::Text),
        }
    }

    pub fn append_text(&mut self, key: &str, more: &str) {
        self.append(key, more.as_bytes());
    }

    pub fn append_byte(&mut self, key: &str, b: u8) {
        self.append(key, &[b]);
    }

    /// Append `n` bytes drawn cyclically from `filler`. Used to pad the
    /// signature placeholder to its reserved size.
    pub fn append_pad(&mut self, key: &str, n: usize, filler: &str) {
        let f = filler.as_bytes();
        if f.is_empty() {
            return;
        }
        let pad: Vec<u8> = (0..n).map(|i| f[i % f.len()]).collect();
        self.append(key, &pad);
    }

    /// Copy `src` to `dst`, replacing `dst`. Copying a missing field
    /// deletes the destination.
    pub fn copy(&mut self, dst: &str, src: &str) {
        if dst == src {
            return;
        }
        match self.get(src) {
            Some(v) => {
                let v = v.clone();
                self.set(dst, v.bytes, v.kind);
            }
            None => self.delete(dst),
        }
    }

    /// Copy a field out of another store.
    pub fn copy_from(&mut self, dst: &str, other: &FieldStore, src: &str) {
        match other.get(src) {
            Some(v) => {
                let v = v.clone();
                self.set(dst, v.bytes, v.kind);
            }
            None => self.delete(dst),
        }
    }

    /// Rename `src` to `dst`.
    pub fn rename(&mut self, dst: &str, src: &str) {
        self.copy(dst, src);
        if dst != src {
            self.delete(src);
        }
    }

    pub fn delete(&mut self, key: &str) {
        if let Some(i) = self.position(key) {
            self.fields.remove(i);
        }
    }

    /// Debugging aid: retag a value without touching the bytes.
    pub fn set_kind(&mut self, key: &str, kind: FieldKind) {
        if let Some(v) = self.get_mut(key) {
            v.kind = kind;
        }
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    // ----- indexed array accessors -----

    fn get_array(&mut self, key: &str, elem: usize, kind: FieldKind, index: usize) -> &mut [u8] {
        let need = (index + 1) * elem;
        if !self.contains(key) {
            self.set(key, vec![0u8; need], kind);
        }
        let v = self.get_mut(key).expect("just inserted");
        if v.bytes.len() < need {
            v.bytes.resize(need, 0);
        }
        v.kind = kind;
        &mut v.bytes[index * elem..(index + 1) * elem]
    }

    /// Read the i-th element of a `usize` array; absent or short arrays
    /// read as zero.
    pub fn get_index(&self, key: &str, index: usize) -> usize {
        const N: usize = std::mem::size_of::<usize>();
        let b = self.bytes(key);
        let start = index * N;
        if b.len() < start + N {
            return 0;
        }
        usize::from_ne_bytes(b[start..start + N].try_into().expect("sized slice"))
    }

    /// Write the i-th element of a `usize` array, growing zero-filled.
    pub fn set_index(&mut self, key: &str, index: usize, value: usize) {
        const N: usize = std::mem::size_of::<usize>();
        self.get_array(key, N, FieldKind::SizeArray, index)
            .copy_from_slice(&value.to_ne_bytes());
    }

    /// Add to the i-th element of a `usize` array.
    pub fn inc_index(&mut self, key: &str, index: usize, delta: usize) {
        let v = self.get_index(key, index);
        self.set_index(key, index, v + delta);
    }

    /// Append one `usize` element to an array; used to build
    /// `@digestrange` pairs.
    pub fn push_index(&mut self, key: &str, value: usize) {
        const N: usize = std::mem::size_of::<usize>();
        let next = self.bytes(key).len() / N;
        self.set_index(key, next, value);
    }

    /// All elements of a `usize` array.
    pub fn indexes(&self, key: &str) -> Vec<usize> {
        const N: usize = std::mem::size_of::<usize>();
        self.bytes(key)
            .chunks_exact(N)
            .map(|c| usize::from_ne_bytes(c.try_into().expect("sized chunk")))
            .collect()
    }

    pub fn get_u32_index(&self, key: &str, index: usize) -> u32 {
        let b = self.bytes(key);
        let start = index * 4;
        if b.len() < start + 4 {
            return 0;
        }
        u32::from_ne_bytes(b[start..start + 4].try_into().expect("sized slice"))
    }

    pub fn set_u32_index(&mut self, key: &str, index: usize, value: u32) {
        self.get_array(key, 4, FieldKind::U32Array, index)
            .copy_from_slice(&value.to_ne_bytes());
    }

    /// Read the i-th byte of a value; absent reads as zero.
    pub fn get_byte(&self, key: &str, index: usize) -> u8 {
        self.bytes(key).get(index).copied().unwrap_or(0)
    }

    /// Write the i-th byte of a value, growing zero-filled.
    pub fn set_byte(&mut self, key: &str, index: usize, b: u8) {
        self.get_array(key, 1, FieldKind::Binary, index)[0] = b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_order_survives_replace() {
        let mut s = FieldStore::new();
        s.set_text("seal", "1");
        s.set_text("b", "F~S,s~f");
        s.set_text("d", "example.com");
        s.set_text("b", "F~f"); // replace keeps slot
        let keys: Vec<&str> = s.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["seal", "b", "d"]);
        assert_eq!(s.text("b"), "F~f");
    }

    #[test]
    fn indexed_array_grows_zero_filled() {
        let mut s = FieldStore::new();
        s.set_index("@s", 2, 7);
        assert_eq!(s.get_index("@s", 0), 0);
        assert_eq!(s.get_index("@s", 1), 0);
        assert_eq!(s.get_index("@s", 2), 7);
        assert_eq!(s.get_index("@s", 9), 0); // out of range reads zero
        s.inc_index("@s", 2, 1);
        assert_eq!(s.get_index("@s", 2), 8);
    }

    #[test]
    fn append_pad_cycles_filler() {
        let mut s = FieldStore::new();
        s.set_text("@record", "x");
        s.append_pad("@record", 12, "abcdefghij");
        assert_eq!(s.text("@record"), "xabcdefghijab");
    }

    #[test]
    fn copy_of_missing_deletes_destination() {
        let mut s = FieldStore::new();
        s.set_text("@p", "stale");
        s.copy("@p", "@nothing");
        assert!(!s.contains("@p"));
    }

    #[test]
    fn rename_moves_value() {
        let mut s = FieldStore::new();
        s.set_bin("@enc", vec![1, 2, 3]);
        s.rename("@signatureenc", "@enc");
        assert!(!s.contains("@enc"));
        assert_eq!(s.bytes("@signatureenc"), &[1, 2, 3]);
    }

    #[test]
    fn push_index_builds_pairs() {
        let mut s = FieldStore::new();
        s.push_index("@digestrange", 0);
        s.push_index("@digestrange", 100);
        s.push_index("@digestrange", 203);
        s.push_index("@digestrange", 1000);
        assert_eq!(s.indexes("@digestrange"), vec![0, 100, 203, 1000]);
    }
}
