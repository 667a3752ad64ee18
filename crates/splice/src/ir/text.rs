//! Compact text form of [`Graph`] used by tests and debug dumps.
//!
//! ```text
//! graph act(%x : Float(1, 3, 8, 8)):
//!   %lo : float = prim::Constant[value=-0.5]()
//!   %hi : float = prim::Constant[value=0.5]()
//!   %y : Tensor = aten::hardtanh(%x, %lo, %hi) # encoder.act
//!   return (%y)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use thiserror::Error;

use super::graph::{Graph, Node, ValueId};
use super::op::{Attr, OpKind};
use super::tensor::{element_count, HostTensor};
use super::types::{DType, Dimension, ScalarKind, TensorType, ValueType};

/// Errors raised while parsing the graph text format.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TextIrError {
    #[error("line {line}: {message}")]
    Message { line: usize, message: String },
}

impl TextIrError {
    fn at(line: usize, message: impl Into<String>) -> Self {
        TextIrError::Message {
            line,
            message: message.into(),
        }
    }
}

/// Graph paired with the mapping from textual value names to arena ids.
#[derive(Debug, Clone)]
pub struct ParsedGraph {
    pub graph: Graph,
    pub value_names: HashMap<String, ValueId>,
}

/// Parses a graph and verifies its structure.
///
/// # Example
/// ```
/// use splice::ir::text::parse_graph;
///
/// let graph = parse_graph(r#"
/// graph relu(%x : Float(2, 2)):
///   %y : Tensor = aten::relu(%x)
///   return (%y)
/// "#).expect("valid graph");
/// assert_eq!(graph.nodes.len(), 1);
/// ```
pub fn parse_graph(src: &str) -> Result<Graph, TextIrError> {
    parse_graph_with_symbols(src).map(|parsed| parsed.graph)
}

pub fn parse_graph_with_symbols(src: &str) -> Result<ParsedGraph, TextIrError> {
    let mut lines = src
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with("//"));

    let (header_line, header) = lines
        .next()
        .ok_or_else(|| TextIrError::at(0, "input is empty"))?;
    let mut parser = GraphParser {
        graph: Graph::new("graph"),
        names: HashMap::new(),
    };
    parser.parse_header(header_line, header)?;

    let mut returned = None;
    for (line_no, line) in lines {
        if returned.is_some() {
            return Err(TextIrError::at(line_no, "statements after `return`"));
        }
        if let Some(rest) = line.strip_prefix("return") {
            returned = Some(parser.parse_return(line_no, rest)?);
            continue;
        }
        parser.parse_statement(line_no, line)?;
    }
    let outputs = returned.ok_or_else(|| TextIrError::at(0, "graph has no `return`"))?;
    parser.graph.outputs = outputs;
    parser
        .graph
        .verify()
        .map_err(|err| TextIrError::at(0, err.to_string()))?;

    Ok(ParsedGraph {
        graph: parser.graph,
        value_names: parser.names,
    })
}

struct GraphParser {
    graph: Graph,
    names: HashMap<String, ValueId>,
}

impl GraphParser {
    fn parse_header(&mut self, line: usize, header: &str) -> Result<(), TextIrError> {
        let rest = header
            .strip_prefix("graph")
            .ok_or_else(|| TextIrError::at(line, "expected `graph(...)` header"))?;
        let open = rest
            .find('(')
            .ok_or_else(|| TextIrError::at(line, "missing `(` in graph header"))?;
        let name = rest[..open].trim();
        if !name.is_empty() {
            self.graph.name = name.to_string();
        }
        let close = find_matching(rest, open, '(', ')')
            .ok_or_else(|| TextIrError::at(line, "unbalanced parameter list"))?;
        if rest[close + 1..].trim() != ":" {
            return Err(TextIrError::at(line, "graph header must end with `):`"));
        }
        for param in split_top_level(&rest[open + 1..close], ',') {
            let (name, ty) = parse_binding(line, param)?;
            let ty = parse_type(line, ty)?;
            let id = self.graph.add_input(ty, name.clone());
            self.define(line, name, id)?;
        }
        Ok(())
    }

    fn define(&mut self, line: usize, name: String, id: ValueId) -> Result<(), TextIrError> {
        if self.names.insert(name.clone(), id).is_some() {
            return Err(TextIrError::at(line, format!("value `%{name}` redefined")));
        }
        Ok(())
    }

    fn lookup(&self, line: usize, token: &str) -> Result<ValueId, TextIrError> {
        let name = token
            .trim()
            .strip_prefix('%')
            .ok_or_else(|| TextIrError::at(line, format!("expected value, found `{token}`")))?;
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| TextIrError::at(line, format!("unknown value `%{name}`")))
    }

    fn parse_return(&self, line: usize, rest: &str) -> Result<Vec<ValueId>, TextIrError> {
        let rest = rest.trim();
        let inner = rest
            .strip_prefix('(')
            .and_then(|body| body.strip_suffix(')'))
            .unwrap_or(rest);
        split_top_level(inner, ',')
            .into_iter()
            .map(|token| self.lookup(line, token))
            .collect()
    }

    fn parse_statement(&mut self, line: usize, text: &str) -> Result<(), TextIrError> {
        let (text, scope) = match text.split_once('#') {
            Some((body, scope)) => (body.trim(), Some(scope.trim().to_string())),
            None => (text, None),
        };
        let (bindings, call) = if text.starts_with('%') {
            let (lhs, rhs) = text
                .split_once('=')
                .ok_or_else(|| TextIrError::at(line, "expected `=` after result bindings"))?;
            let bindings = split_top_level(lhs, ',')
                .into_iter()
                .map(|binding| {
                    let (name, ty) = parse_binding(line, binding)?;
                    Ok((name, parse_type(line, ty)?))
                })
                .collect::<Result<Vec<_>, TextIrError>>()?;
            (bindings, rhs.trim())
        } else {
            (Vec::new(), text)
        };

        let kind_end = call
            .find(|c: char| c == '[' || c == '(')
            .ok_or_else(|| TextIrError::at(line, "missing operand list"))?;
        let kind: OpKind = call[..kind_end]
            .trim()
            .parse()
            .map_err(|err: super::op::UnknownOpKind| TextIrError::at(line, err.to_string()))?;

        let mut rest = &call[kind_end..];
        let mut attrs = BTreeMap::new();
        if rest.starts_with('[') {
            let close = find_matching(rest, 0, '[', ']')
                .ok_or_else(|| TextIrError::at(line, "unbalanced attribute list"))?;
            for entry in split_top_level(&rest[1..close], ',') {
                let (key, value) = entry
                    .split_once('=')
                    .ok_or_else(|| TextIrError::at(line, format!("malformed attribute `{entry}`")))?;
                attrs.insert(key.trim().to_string(), parse_attr(line, value)?);
            }
            rest = rest[close + 1..].trim_start();
        }
        if !rest.starts_with('(') {
            return Err(TextIrError::at(line, "missing operand list"));
        }
        let close = find_matching(rest, 0, '(', ')')
            .ok_or_else(|| TextIrError::at(line, "unbalanced operand list"))?;
        if !rest[close + 1..].trim().is_empty() {
            return Err(TextIrError::at(line, "trailing text after operand list"));
        }
        let inputs = split_top_level(&rest[1..close], ',')
            .into_iter()
            .map(|token| self.lookup(line, token))
            .collect::<Result<Vec<_>, _>>()?;

        let mut outputs = Vec::with_capacity(bindings.len());
        for (name, mut ty) in bindings {
            if kind == OpKind::Constant {
                if let ValueType::Tensor(tensor_ty) = &ty {
                    let tensor = tensor_constant(line, tensor_ty, attrs.get("value"))?;
                    ty = ValueType::tensor(tensor.dtype(), tensor.dims());
                    attrs.insert("value".to_string(), Attr::Tensor(tensor));
                }
            }
            let id = self.graph.new_value(ty, Some(name.clone()));
            self.define(line, name, id)?;
            outputs.push(id);
        }

        self.graph.push_node(Node {
            id: super::graph::NodeId(0),
            kind,
            inputs,
            outputs,
            attrs,
            scope,
        });
        Ok(())
    }
}

fn parse_binding(line: usize, text: &str) -> Result<(String, &str), TextIrError> {
    let (name, ty) = text
        .split_once(':')
        .ok_or_else(|| TextIrError::at(line, format!("expected `%name : Type`, found `{text}`")))?;
    let name = name
        .trim()
        .strip_prefix('%')
        .ok_or_else(|| TextIrError::at(line, format!("value names start with `%`: `{name}`")))?;
    Ok((name.to_string(), ty.trim()))
}

fn tensor_constant(
    line: usize,
    ty: &TensorType,
    value: Option<&Attr>,
) -> Result<HostTensor, TextIrError> {
    let (values, default_dtype): (Vec<f64>, DType) = match value {
        Some(Attr::Tensor(tensor)) => return Ok(tensor.clone()),
        Some(Attr::Float(v)) => (vec![*v], DType::F32),
        Some(Attr::Int(v)) => (vec![*v as f64], DType::I64),
        Some(Attr::Bool(v)) => (vec![f64::from(u8::from(*v))], DType::Bool),
        Some(Attr::Floats(vs)) => (vs.clone(), DType::F32),
        Some(Attr::Ints(vs)) => (vs.iter().map(|v| *v as f64).collect(), DType::I64),
        _ => return Err(TextIrError::at(line, "tensor constants need a numeric `value`")),
    };
    let dtype = ty.dtype.unwrap_or(default_dtype);
    let dims = match ty.static_dims() {
        Some(dims) => dims,
        None if matches!(value, Some(Attr::Floats(_) | Attr::Ints(_))) => vec![values.len()],
        None => Vec::new(),
    };
    if element_count(&dims) != values.len() {
        return Err(TextIrError::at(
            line,
            format!(
                "constant of shape {dims:?} needs {} values, found {}",
                element_count(&dims),
                values.len()
            ),
        ));
    }
    HostTensor::from_f64_values(dtype, dims, &values).map_err(|err| TextIrError::at(line, err.to_string()))
}

fn parse_attr(line: usize, text: &str) -> Result<Attr, TextIrError> {
    let text = text.trim();
    match text {
        "None" => return Ok(Attr::None),
        "true" => return Ok(Attr::Bool(true)),
        "false" => return Ok(Attr::Bool(false)),
        _ => {}
    }
    if let Some(inner) = text.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Ok(Attr::Str(inner.to_string()));
    }
    if let Some(inner) = text.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        let items = split_top_level(inner, ',');
        if let Ok(ints) = items.iter().map(|item| item.parse::<i64>()).collect::<Result<Vec<_>, _>>() {
            return Ok(Attr::Ints(ints));
        }
        return items
            .iter()
            .map(|item| item.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map(Attr::Floats)
            .map_err(|_| TextIrError::at(line, format!("invalid list attribute `{text}`")));
    }
    if let Ok(value) = text.parse::<i64>() {
        return Ok(Attr::Int(value));
    }
    if let Ok(value) = text.parse::<f64>() {
        return Ok(Attr::Float(value));
    }
    text.parse::<DType>()
        .map(Attr::DType)
        .map_err(|_| TextIrError::at(line, format!("invalid attribute value `{text}`")))
}

fn parse_type(line: usize, text: &str) -> Result<ValueType, TextIrError> {
    let text = text.trim();
    let scalar = |name: &str| match name {
        "int" => Some(ScalarKind::Int),
        "float" => Some(ScalarKind::Float),
        "bool" => Some(ScalarKind::Bool),
        "str" => Some(ScalarKind::Str),
        _ => None,
    };
    if let Some(kind) = text.strip_suffix("[]").and_then(scalar) {
        return Ok(ValueType::List(kind));
    }
    if let Some(kind) = scalar(text) {
        return Ok(ValueType::Scalar(kind));
    }

    let (head, dims) = match text.find('(') {
        Some(open) => {
            let inner = text[open..]
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(|| TextIrError::at(line, format!("malformed type `{text}`")))?;
            (&text[..open], Some(parse_dims(line, inner)?))
        }
        None => (text, None),
    };
    let dtype = match head.trim() {
        "Tensor" => None,
        other => Some(
            tensor_dtype_from_name(other)
                .ok_or_else(|| TextIrError::at(line, format!("unknown type `{text}`")))?,
        ),
    };
    Ok(ValueType::Tensor(TensorType { dtype, shape: dims }))
}

fn parse_dims(line: usize, text: &str) -> Result<Vec<Dimension>, TextIrError> {
    split_top_level(text, ',')
        .into_iter()
        .map(|dim| match dim {
            "?" | "*" => Ok(Dimension::Dynamic),
            other => other
                .parse::<usize>()
                .map(Dimension::Static)
                .map_err(|_| TextIrError::at(line, format!("invalid dimension `{other}`"))),
        })
        .collect()
}

fn tensor_dtype_from_name(name: &str) -> Option<DType> {
    let dtype = match name {
        "Float" => DType::F32,
        "Half" => DType::F16,
        "Double" => DType::F64,
        "Char" => DType::I8,
        "Int" => DType::I32,
        "Long" => DType::I64,
        "Bool" => DType::Bool,
        _ => return None,
    };
    Some(dtype)
}

fn tensor_dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "Float",
        DType::F16 => "Half",
        DType::F64 => "Double",
        DType::I8 => "Char",
        DType::I32 => "Int",
        DType::I64 => "Long",
        DType::Bool => "Bool",
    }
}

fn find_matching(src: &str, open_index: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, ch) in src[open_index..].char_indices() {
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(open_index + offset);
            }
        }
    }
    None
}

fn split_top_level(input: &str, delimiter: char) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut start = 0usize;
    for (idx, ch) in input.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '(' | '[' if !in_string => depth += 1,
            ')' | ']' if !in_string => depth = depth.saturating_sub(1),
            c if c == delimiter && depth == 0 && !in_string => {
                pieces.push(input[start..idx].trim());
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    let tail = input[start..].trim();
    if !tail.is_empty() || !pieces.is_empty() {
        pieces.push(tail);
    }
    pieces
}

struct TypeText<'a>(&'a ValueType);

impl fmt::Display for TypeText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scalar = |kind: &ScalarKind| match kind {
            ScalarKind::Int => "int",
            ScalarKind::Float => "float",
            ScalarKind::Bool => "bool",
            ScalarKind::Str => "str",
        };
        match self.0 {
            ValueType::Scalar(kind) => f.write_str(scalar(kind)),
            ValueType::List(kind) => write!(f, "{}[]", scalar(kind)),
            ValueType::Tensor(tensor) => {
                f.write_str(tensor.dtype.map(tensor_dtype_name).unwrap_or("Tensor"))?;
                if let Some(dims) = &tensor.shape {
                    let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
                    write!(f, "({})", dims.join(", "))?;
                }
                Ok(())
            }
        }
    }
}

impl Graph {
    fn value_label(&self, id: ValueId) -> String {
        match self.value(id).and_then(|value| value.name.as_deref()) {
            Some(name) => format!("%{name}"),
            None => format!("%_{}", id.0),
        }
    }

    fn binding_text(&self, id: ValueId) -> String {
        let ty = self
            .value_type(id)
            .cloned()
            .unwrap_or(ValueType::Tensor(TensorType::unknown()));
        format!("{} : {}", self.value_label(id), TypeText(&ty))
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.inputs.iter().map(|id| self.binding_text(*id)).collect();
        writeln!(f, "graph {}({}):", self.name, params.join(", "))?;
        for node in &self.nodes {
            f.write_str("  ")?;
            if !node.outputs.is_empty() {
                let outputs: Vec<String> =
                    node.outputs.iter().map(|id| self.binding_text(*id)).collect();
                write!(f, "{} = ", outputs.join(", "))?;
            }
            f.write_str(node.kind.as_str())?;
            if !node.attrs.is_empty() {
                let attrs: Vec<String> = node
                    .attrs
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect();
                write!(f, "[{}]", attrs.join(", "))?;
            }
            let inputs: Vec<String> = node.inputs.iter().map(|id| self.value_label(*id)).collect();
            write!(f, "({})", inputs.join(", "))?;
            if let Some(scope) = &node.scope {
                write!(f, " # {scope}")?;
            }
            writeln!(f)?;
        }
        let outputs: Vec<String> = self.outputs.iter().map(|id| self.value_label(*id)).collect();
        writeln!(f, "  return ({})", outputs.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_top_level_respects_nesting() {
        assert_eq!(
            split_top_level("%a : Float(1, 2), %b : int[]", ','),
            vec!["%a : Float(1, 2)", "%b : int[]"]
        );
        assert!(split_top_level("  ", ',').is_empty());
    }

    #[test]
    fn attribute_literals_parse() {
        assert_eq!(parse_attr(1, "[1, -2]"), Ok(Attr::Ints(vec![1, -2])));
        assert_eq!(parse_attr(1, "[0.5, 2]"), Ok(Attr::Floats(vec![0.5, 2.0])));
        assert_eq!(parse_attr(1, "\"tanh\""), Ok(Attr::Str("tanh".into())));
        assert_eq!(parse_attr(1, "f16"), Ok(Attr::DType(DType::F16)));
        assert_eq!(parse_attr(1, "None"), Ok(Attr::None));
    }
}
