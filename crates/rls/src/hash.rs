//! Deterministic hashing shared by the decision engine's stable sort (spec
//! §4.4 "Determinism": "64-bit xxhash ... of the canonical
//! label-serialization") and by the sync controller's document-diff (spec
//! §4.8 "Resync": "stable hash of each tenant's document").

use xxhash_rust::xxh3::Xxh3;

/// Canonical serialization of a label set: pairs sorted by name, joined
/// with NUL separators so no label value can forge a collision by
/// embedding the delimiter.
pub fn label_set_hash<'a>(labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> u64 {
	let mut pairs: Vec<(&str, &str)> = labels.into_iter().collect();
	pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));

	let mut hasher = Xxh3::new();
	for (name, value) in pairs {
		hasher.update(name.as_bytes());
		hasher.update(b"\0");
		hasher.update(value.as_bytes());
		hasher.update(b"\0");
	}
	hasher.digest()
}

/// Stable hash of an arbitrary serializable document, used to detect
/// whether a tenant's override changed between resyncs without deep
/// structural comparison.
pub fn document_hash(bytes: &[u8]) -> u64 {
	let mut hasher = Xxh3::new();
	hasher.update(bytes);
	hasher.digest()
}
