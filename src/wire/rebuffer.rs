//! Binary-payload reconstruction.
//!
//! Structurally-typed message passing strips binary buffers of their
//! identity: a byte sequence arrives either as a tagged record
//! `{"type": "Buffer", "data": [104, 105]}` or as a raw indexed collection
//! `{"0": 104, "1": 105}`. [`rebuffer_value`] walks a result once, at the
//! trust boundary, and rewrites every field matching either shape into the
//! canonical tagged form that [`value_to_bytes`] reads back losslessly.
//!
//! An empty indexed object is indistinguishable from an empty map and is
//! left untouched; the tagged form carries empty buffers unambiguously.

use serde_json::{json, Map, Value};

/// Canonical JSON representation of a byte buffer.
pub fn bytes_to_value(bytes: &[u8]) -> Value {
    json!({
        "type": "Buffer",
        "data": bytes,
    })
}

/// Extract bytes from either wire shape. Returns `None` for values that are
/// not byte buffers.
pub fn value_to_bytes(value: &Value) -> Option<Vec<u8>> {
    let map = value.as_object()?;
    tagged_bytes(map).or_else(|| indexed_bytes(map))
}

/// Recursively restore buffer fields nested anywhere in `value`.
///
/// Matching objects are rebuilt whole; the walk never descends into a
/// buffer it has just reconstructed. Primitives pass through untouched.
pub fn rebuffer_value(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(rebuffer_value).collect()),
        Value::Object(map) => {
            if let Some(bytes) = tagged_bytes(&map).or_else(|| indexed_bytes(&map)) {
                return bytes_to_value(&bytes);
            }
            Value::Object(
                map.into_iter()
                    .map(|(key, child)| (key, rebuffer_value(child)))
                    .collect(),
            )
        }
        primitive => primitive,
    }
}

/// `{"type": "Buffer", "data": [..]}` with exactly those two keys and every
/// element a valid byte.
fn tagged_bytes(map: &Map<String, Value>) -> Option<Vec<u8>> {
    if map.len() != 2 || map.get("type")?.as_str()? != "Buffer" {
        return None;
    }
    map.get("data")?
        .as_array()?
        .iter()
        .map(byte_of)
        .collect::<Option<Vec<u8>>>()
}

/// `{"0": b0, "1": b1, ..}` with contiguous indices from zero and every
/// value a valid byte.
fn indexed_bytes(map: &Map<String, Value>) -> Option<Vec<u8>> {
    if map.is_empty() {
        return None;
    }
    let mut entries: Vec<(usize, u8)> = map
        .iter()
        .map(|(key, value)| Some((key.parse::<usize>().ok()?, byte_of(value)?)))
        .collect::<Option<Vec<_>>>()?;
    entries.sort_unstable_by_key(|(index, _)| *index);
    if entries
        .iter()
        .enumerate()
        .any(|(position, (index, _))| position != *index)
    {
        return None;
    }
    Some(entries.into_iter().map(|(_, byte)| byte).collect())
}

fn byte_of(value: &Value) -> Option<u8> {
    u8::try_from(value.as_u64()?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_records_rebuild_byte_for_byte() {
        let original = vec![0u8, 1, 127, 255];
        let wire = json!({"type": "Buffer", "data": [0, 1, 127, 255]});
        let rebuilt = rebuffer_value(wire);
        assert_eq!(value_to_bytes(&rebuilt), Some(original));
    }

    #[test]
    fn indexed_collections_rebuild_in_index_order() {
        // Eleven entries so lexicographic key order ("10" < "2") would
        // scramble the bytes if indices were not parsed numerically.
        let original: Vec<u8> = (100..111).collect();
        let mut map = Map::new();
        for (index, byte) in original.iter().enumerate() {
            map.insert(index.to_string(), json!(byte));
        }
        let rebuilt = rebuffer_value(Value::Object(map));
        assert_eq!(value_to_bytes(&rebuilt), Some(original));
    }

    #[test]
    fn buffers_nested_at_depth_are_restored() {
        let wire = json!({
            "file": {
                "name": "avatar.png",
                "content": {"type": "Buffer", "data": [137, 80, 78, 71]},
            },
            "chunks": [
                {"0": 1, "1": 2},
                {"meta": {"raw": {"type": "Buffer", "data": [9]}}},
            ],
        });
        let rebuilt = rebuffer_value(wire);

        assert_eq!(
            value_to_bytes(&rebuilt["file"]["content"]),
            Some(vec![137, 80, 78, 71])
        );
        assert_eq!(value_to_bytes(&rebuilt["chunks"][0]), Some(vec![1, 2]));
        assert_eq!(
            value_to_bytes(&rebuilt["chunks"][1]["meta"]["raw"]),
            Some(vec![9])
        );
        assert_eq!(rebuilt["file"]["name"], json!("avatar.png"));
    }

    #[test]
    fn near_miss_shapes_are_left_alone() {
        // Out-of-range element: not a buffer, children still walked.
        let wire = json!({"type": "Buffer", "data": [300]});
        assert_eq!(rebuffer_value(wire.clone()), wire);

        // Extra key breaks the tagged shape.
        let wire = json!({"type": "Buffer", "data": [1], "extra": true});
        assert_eq!(rebuffer_value(wire.clone()), wire);

        // Sparse indices are not a byte collection.
        let wire = json!({"0": 1, "2": 3});
        assert_eq!(rebuffer_value(wire.clone()), wire);

        // Floats are not bytes.
        let wire = json!({"0": 1.5});
        assert_eq!(rebuffer_value(wire.clone()), wire);
    }

    #[test]
    fn primitives_and_plain_objects_pass_through() {
        let wire = json!({
            "count": 3,
            "name": "untouched",
            "flags": [true, false],
            "nothing": null,
        });
        assert_eq!(rebuffer_value(wire.clone()), wire);
    }

    #[test]
    fn empty_indexed_objects_stay_maps() {
        let wire = json!({});
        assert_eq!(rebuffer_value(wire.clone()), wire);
    }

    #[test]
    fn empty_tagged_buffers_survive() {
        let wire = json!({"type": "Buffer", "data": []});
        let rebuilt = rebuffer_value(wire);
        assert_eq!(value_to_bytes(&rebuilt), Some(Vec::new()));
    }
}
