use std::collections::HashMap;
use std::sync::OnceLock;

use super::{converters, ConversionCtx, ConversionError, ConversionResult, Support};
use crate::backend::TensorRef;
use crate::ir::{Graph, Node, OpKind};

/// Decides whether a node converts, given its attributes and value types.
pub type SupportFn = fn(&Graph, &Node) -> Support;
/// Emits the layers for a node and returns one tensor per declared output.
pub type ConvertFn = fn(&mut ConversionCtx<'_>, &Node) -> ConversionResult<Vec<TensorRef>>;

#[derive(Clone, Copy)]
pub struct ConverterEntry {
    pub support: SupportFn,
    pub convert: ConvertFn,
}

/// Map from op kind to its converter.
#[derive(Clone, Default)]
pub struct ConverterRegistry {
    entries: HashMap<OpKind, ConverterEntry>,
}

impl ConverterRegistry {
    /// Registry without any converters.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding every converter shipped with the crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        converters::register_all(&mut registry);
        registry
    }

    /// Registers a converter, returning the entry it replaced.
    pub fn register(
        &mut self,
        kind: OpKind,
        support: SupportFn,
        convert: ConvertFn,
    ) -> Option<ConverterEntry> {
        self.entries.insert(kind, ConverterEntry { support, convert })
    }

    pub fn remove(&mut self, kind: OpKind) -> Option<ConverterEntry> {
        self.entries.remove(&kind)
    }

    pub fn contains(&self, kind: OpKind) -> bool {
        self.entries.contains_key(&kind)
    }

    /// Sorted list of kinds with a converter.
    pub fn kinds(&self) -> Vec<OpKind> {
        let mut kinds: Vec<OpKind> = self.entries.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn support(&self, graph: &Graph, node: &Node) -> Support {
        if node.kind.is_pure_fallback() {
            return Support::unsupported(format!("{} only runs under the interpreter", node.kind));
        }
        match self.entries.get(&node.kind) {
            Some(entry) => (entry.support)(graph, node),
            None => Support::unsupported(format!("no converter registered for {}", node.kind)),
        }
    }

    /// Converts `node` and binds its outputs in `ctx`.
    ///
    /// Calling this on a node whose predicate fails is a contract violation
    /// and yields [`ConversionError::Internal`].
    pub fn convert(&self, ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<()> {
        if let Support::Unsupported(reason) = self.support(ctx.graph(), node) {
            return Err(ConversionError::Internal {
                node: node.id,
                kind: node.kind,
                reason,
            });
        }
        let entry = self
            .entries
            .get(&node.kind)
            .ok_or_else(|| ConversionError::Internal {
                node: node.id,
                kind: node.kind,
                reason: "converter disappeared after its support check".to_string(),
            })?;
        ctx.begin_node(node);
        let outputs = (entry.convert)(ctx, node)?;
        ctx.bind_outputs(node, &outputs)
    }
}

static DEFAULT_REGISTRY: OnceLock<ConverterRegistry> = OnceLock::new();

/// Process-wide registry with the default converters. Clone it to extend.
pub fn default_registry() -> &'static ConverterRegistry {
    DEFAULT_REGISTRY.get_or_init(ConverterRegistry::with_defaults)
}
