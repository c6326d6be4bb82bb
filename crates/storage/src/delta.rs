//! ETag/Delta service: computing and applying compact representations
//! of the difference between two resource versions

use json_patch::{diff, patch, Patch};
use oms_core::{ETag, Error, Result};
use serde::{Deserialize, Serialize};

/// How a [`Delta`] encodes the change between two resource contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaType {
    /// The new content in full; no relationship to the old content is encoded.
    Full,
    /// An RFC 6902 JSON Patch from old to new.
    JsonPatch,
    /// A JSON Patch, zstd-compressed, chosen when compression beats the
    /// raw patch by at least the configured improvement threshold.
    CompressedPatch,
    /// A coarse byte-level diff, used only for non-JSON/non-UTF8 content.
    BinaryDiff,
    /// Several consecutive `JsonPatch` deltas folded into one operation list.
    ChainDelta,
}

/// The encoded difference between two resource contents, plus the
/// metadata needed to apply or validate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    /// How `payload` is encoded.
    pub delta_type: DeltaType,
    /// The encoded bytes: a JSON patch document, zstd-compressed bytes, or full content.
    pub payload: DeltaPayload,
    /// ETag of the content this delta was computed against.
    pub base_etag: ETag,
    /// ETag of the content this delta produces when applied.
    pub target_etag: ETag,
}

/// The delta's encoded content, tagged by [`DeltaType`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeltaPayload {
    /// A JSON value: the full content, or a JSON Patch document.
    Json(serde_json::Value),
    /// Raw bytes: compressed patch bytes or a binary diff frame.
    Bytes(Vec<u8>),
}

/// Preferences guiding [`DeltaEngine::compute_delta`]'s encoding choice.
#[derive(Debug, Clone, Copy)]
pub struct DeltaPreferences {
    /// Maximum patch/full size ratio before a raw `JsonPatch` is still
    /// preferred; above this, compression or `Full` is considered instead.
    pub compression_threshold: f64,
    /// Fraction a compressed patch must beat the raw patch by to be chosen
    /// over falling back to `Full`.
    pub compression_improvement_threshold: f64,
    /// Maximum number of `JsonPatch`s folded into a `ChainDelta`.
    pub max_chain_length: usize,
}

impl Default for DeltaPreferences {
    fn default() -> Self {
        DeltaPreferences {
            compression_threshold: 0.7,
            compression_improvement_threshold: 0.10,
            max_chain_length: 5,
        }
    }
}

/// Computes and applies [`Delta`]s, and partitions a client's cached
/// etags into valid/stale/deleted.
pub struct DeltaEngine {
    prefs: DeltaPreferences,
}

impl DeltaEngine {
    /// Build an engine with the given preferences.
    pub fn new(prefs: DeltaPreferences) -> Self {
        DeltaEngine { prefs }
    }

    /// Encode the difference from `old` to `new`.
    ///
    /// Follows the policy order: `JsonPatch` when the patch/full size
    /// ratio is at or below `compression_threshold`; otherwise
    /// `CompressedPatch` if zstd shrinks the patch by at least
    /// `compression_improvement_threshold`; otherwise `Full`.
    pub fn compute_delta(
        &self,
        old: &serde_json::Value,
        new: &serde_json::Value,
        base_etag: ETag,
        target_etag: ETag,
    ) -> Delta {
        let json_patch = diff(old, new);
        let patch_json = serde_json::to_value(&json_patch).unwrap_or(serde_json::Value::Null);
        let patch_bytes = serde_json::to_vec(&patch_json).unwrap_or_default();
        let full_bytes = serde_json::to_vec(new).unwrap_or_default();

        let size_ratio = if full_bytes.is_empty() {
            1.0
        } else {
            patch_bytes.len() as f64 / full_bytes.len() as f64
        };

        if size_ratio <= self.prefs.compression_threshold {
            return Delta {
                delta_type: DeltaType::JsonPatch,
                payload: DeltaPayload::Json(patch_json),
                base_etag,
                target_etag,
            };
        }

        let compressed = zstd::encode_all(patch_bytes.as_slice(), 0).ok();
        let use_compressed = match &compressed {
            Some(c) if !patch_bytes.is_empty() => {
                let savings = 1.0 - (c.len() as f64 / patch_bytes.len() as f64);
                savings >= self.prefs.compression_improvement_threshold
            }
            _ => false,
        };

        if use_compressed {
            Delta {
                delta_type: DeltaType::CompressedPatch,
                payload: DeltaPayload::Bytes(compressed.unwrap()),
                base_etag,
                target_etag,
            }
        } else {
            Delta {
                delta_type: DeltaType::Full,
                payload: DeltaPayload::Json(new.clone()),
                base_etag,
                target_etag,
            }
        }
    }

    /// Encode a full-replace delta, used for the first version of a
    /// resource or when no base content is retrievable.
    pub fn full_delta(&self, new: &serde_json::Value, target_etag: ETag) -> Delta {
        Delta {
            delta_type: DeltaType::Full,
            payload: DeltaPayload::Json(new.clone()),
            base_etag: target_etag.clone(),
            target_etag,
        }
    }

    /// Apply `delta` to `old`, reconstructing the new content.
    pub fn apply_delta(&self, old: &serde_json::Value, delta: &Delta) -> Result<serde_json::Value> {
        match (&delta.delta_type, &delta.payload) {
            (DeltaType::Full, DeltaPayload::Json(full)) => Ok(full.clone()),
            (DeltaType::JsonPatch, DeltaPayload::Json(patch_json))
            | (DeltaType::ChainDelta, DeltaPayload::Json(patch_json)) => {
                let ops: Patch = serde_json::from_value(patch_json.clone())
                    .map_err(|e| Error::InvalidTree { reason: e.to_string() })?;
                let mut target = old.clone();
                patch(&mut target, &ops).map_err(|e| Error::InvalidTree { reason: e.to_string() })?;
                Ok(target)
            }
            (DeltaType::CompressedPatch, DeltaPayload::Bytes(compressed)) => {
                let decompressed = zstd::decode_all(compressed.as_slice())
                    .map_err(|e| Error::InvalidTree { reason: e.to_string() })?;
                let patch_json: serde_json::Value = serde_json::from_slice(&decompressed)
                    .map_err(|e| Error::InvalidTree { reason: e.to_string() })?;
                let ops: Patch = serde_json::from_value(patch_json)
                    .map_err(|e| Error::InvalidTree { reason: e.to_string() })?;
                let mut target = old.clone();
                patch(&mut target, &ops).map_err(|e| Error::InvalidTree { reason: e.to_string() })?;
                Ok(target)
            }
            (DeltaType::BinaryDiff, DeltaPayload::Bytes(replacement)) => {
                bincode::deserialize(replacement).map_err(|e| Error::InvalidTree { reason: e.to_string() })
            }
            _ => Err(Error::InvalidTree {
                reason: "delta type and payload shape mismatch".into(),
            }),
        }
    }

    /// Fold up to `max_chain_length` consecutive `JsonPatch` deltas into
    /// one `ChainDelta` by concatenating their operation lists, since a
    /// `json_patch::Patch` is just `Vec<PatchOperation>` and applying
    /// the concatenation in order is equivalent to applying each in turn.
    pub fn fold_chain(&self, deltas: &[Delta]) -> Result<Delta> {
        if deltas.is_empty() {
            return Err(Error::Validation {
                message: "cannot fold an empty delta chain".into(),
            });
        }
        let take = deltas.len().min(self.prefs.max_chain_length);
        let mut ops: Vec<json_patch::PatchOperation> = Vec::new();
        for delta in &deltas[..take] {
            match (&delta.delta_type, &delta.payload) {
                (DeltaType::JsonPatch, DeltaPayload::Json(v)) => {
                    let patch: Patch = serde_json::from_value(v.clone())
                        .map_err(|e| Error::InvalidTree { reason: e.to_string() })?;
                    ops.extend(patch.0);
                }
                _ => {
                    return Err(Error::Validation {
                        message: "fold_chain requires JsonPatch deltas".into(),
                    })
                }
            }
        }
        let folded = Patch(ops);
        Ok(Delta {
            delta_type: DeltaType::ChainDelta,
            payload: DeltaPayload::Json(serde_json::to_value(&folded).unwrap_or(serde_json::Value::Null)),
            base_etag: deltas[0].base_etag.clone(),
            target_etag: deltas[take - 1].target_etag.clone(),
        })
    }

    /// Validate that `supplied` still matches the resource's current state.
    pub fn validate_etag(&self, supplied: &ETag, current: &ETag) -> bool {
        supplied == current
    }

    /// Partition a client's `{resource_key: etag}` snapshot against current
    /// state: entries whose etag still matches are `valid`; entries whose
    /// etag is out of date are `stale`; entries for resources that no
    /// longer exist are `deleted`.
    pub fn validate_cache<K: Clone + Eq + std::hash::Hash>(
        &self,
        client_state: &[(K, ETag)],
        current_state: &std::collections::HashMap<K, ETag>,
    ) -> CacheValidation<K> {
        let mut result = CacheValidation::default();
        for (key, etag) in client_state {
            match current_state.get(key) {
                Some(current) if current == etag => result.valid.push(key.clone()),
                Some(_) => result.stale.push(key.clone()),
                None => result.deleted.push(key.clone()),
            }
        }
        result
    }
}

/// Result of [`DeltaEngine::validate_cache`].
#[derive(Debug)]
pub struct CacheValidation<K> {
    /// Keys whose cached etag is still current.
    pub valid: Vec<K>,
    /// Keys whose cached etag is out of date.
    pub stale: Vec<K>,
    /// Keys whose resource no longer exists.
    pub deleted: Vec<K>,
}

impl<K> Default for CacheValidation<K> {
    fn default() -> Self {
        Self {
            valid: Vec::new(),
            stale: Vec::new(),
            deleted: Vec::new(),
        }
    }
}
