use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};

use super::{BoundaryInput, BuildError};
use crate::backend::{BuilderConfig, Engine};
use crate::ir::{Attr, DType, Graph, OpKind, ShapeSpec, ValueId};
use crate::partition::Segment;

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    let mut hash = FNV1A_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

/// Identity of a built engine: what was compiled and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineKey {
    pub segment_hash: u64,
    pub config_hash: u64,
}

#[derive(Serialize)]
struct FingerprintNode<'g> {
    kind: OpKind,
    inputs: Vec<usize>,
    outputs: usize,
    attrs: &'g BTreeMap<String, Attr>,
}

#[derive(Serialize)]
struct SegmentFingerprint<'g> {
    inputs: Vec<(DType, &'g ShapeSpec)>,
    nodes: Vec<FingerprintNode<'g>>,
    outputs: Vec<usize>,
}

/// Hash of a segment's structure with values renumbered locally, so identical
/// segments at different places of a graph share a fingerprint.
pub fn segment_fingerprint(
    graph: &Graph,
    segment: &Segment,
    inputs: &[BoundaryInput],
) -> Result<u64, BuildError> {
    let mut local: HashMap<ValueId, usize> = HashMap::new();
    for input in inputs {
        let next = local.len();
        local.entry(input.value).or_insert(next);
    }
    let mut nodes = Vec::with_capacity(segment.nodes.len());
    for id in &segment.nodes {
        let node = graph
            .node(*id)
            .ok_or_else(|| BuildError::new(segment.id, None, format!("node {id} is not in the graph")))?;
        let operands = node
            .inputs
            .iter()
            .map(|value| {
                local.get(value).copied().ok_or_else(|| {
                    BuildError::new(segment.id, Some(node.id), format!("{value} is not bound"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        for value in &node.outputs {
            let next = local.len();
            local.insert(*value, next);
        }
        nodes.push(FingerprintNode {
            kind: node.kind,
            inputs: operands,
            outputs: node.outputs.len(),
            attrs: &node.attrs,
        });
    }
    let outputs = segment
        .outputs
        .iter()
        .filter_map(|value| local.get(value).copied())
        .collect();
    let fingerprint = SegmentFingerprint {
        inputs: inputs.iter().map(|input| (input.engine, &input.shape)).collect(),
        nodes,
        outputs,
    };
    let bytes = bincode::serialize(&fingerprint)
        .map_err(|err| BuildError::new(segment.id, None, format!("fingerprint: {err}")))?;
    Ok(fnv1a_hash(&bytes))
}

/// Digest of everything besides the segment that shapes the built engine.
pub fn config_digest(
    backend: &str,
    config: &BuilderConfig,
    truncate_64bit: bool,
) -> Result<u64, bincode::Error> {
    let bytes = bincode::serialize(&(backend, config, truncate_64bit))?;
    Ok(fnv1a_hash(&bytes))
}

type EngineCacheEntry = Arc<OnceLock<Result<Arc<dyn Engine>, BuildError>>>;

/// Dedups identical segments within one compilation.
#[derive(Default)]
pub struct EngineCache {
    entries: Mutex<HashMap<EngineKey, EngineCacheEntry>>,
}

impl EngineCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("engine cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the engine cached under `key`, building it on first use. A
    /// cached failure is reported against `segment`, not the segment that
    /// first hit it.
    pub fn get_or_build<F>(
        &self,
        key: EngineKey,
        segment: usize,
        build: F,
    ) -> Result<Arc<dyn Engine>, BuildError>
    where
        F: FnOnce() -> Result<Arc<dyn Engine>, BuildError>,
    {
        let cell = {
            let mut guard = self.entries.lock().expect("engine cache poisoned");
            guard
                .entry(key)
                .or_insert_with(|| Arc::new(OnceLock::new()))
                .clone()
        };

        let result = match cell.get() {
            Some(existing) => existing.clone(),
            None => {
                let built = build();
                let _ = cell.set(built.clone());
                cell.get().cloned().unwrap_or(built)
            }
        };
        result.map_err(|err| BuildError { segment, ..err })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_matches_reference_vectors() {
        assert_eq!(fnv1a_hash(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn cached_failure_names_the_requesting_segment() {
        let cache = EngineCache::new();
        let key = EngineKey {
            segment_hash: 7,
            config_hash: 11,
        };
        let first = cache
            .get_or_build(key, 0, || Err(BuildError::new(0, None, "workspace exceeded")))
            .err()
            .expect("first build fails");
        assert_eq!(first.segment, 0);

        let second = cache
            .get_or_build(key, 2, || panic!("failure is cached"))
            .err()
            .expect("cached failure");
        assert_eq!(second.segment, 2);
        assert_eq!(second.message, "workspace exceeded");
        assert_eq!(cache.len(), 1);
    }
}
