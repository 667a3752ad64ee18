use std::fs;
use std::path::PathBuf;

use splice::ir::parse_graph;
use splice::{lower_graph, LoweringOptions};

pub struct Case {
    pub name: String,
    pub input: String,
    pub expected: String,
}

/// Fixture format:
/// CASE: <name>
/// INPUT:
/// <graph text>
/// EXPECTED:
/// <graph text>
/// run_test
/// (repeat)
pub fn load_cases(fixture_rel: &str) -> Vec<Case> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(fixture_rel);
    let contents =
        fs::read_to_string(&path).unwrap_or_else(|e| panic!("cannot read {:?}: {}", path, e));
    let mut cases = Vec::new();
    let mut name = String::new();
    let mut input = String::new();
    let mut expected = String::new();
    let mut in_input = false;
    let mut in_expected = false;
    for line in contents.lines() {
        let trimmed = line.trim_end();
        if let Some(rest) = trimmed.strip_prefix("CASE:") {
            name = rest.trim().to_string();
            continue;
        }
        match trimmed {
            "INPUT:" => {
                in_input = true;
                in_expected = false;
                input.clear();
            }
            "EXPECTED:" => {
                in_expected = true;
                in_input = false;
                expected.clear();
            }
            "run_test" => {
                cases.push(Case {
                    name: std::mem::take(&mut name),
                    input: input.clone(),
                    expected: expected.clone(),
                });
                in_input = false;
                in_expected = false;
            }
            _ if in_input => {
                input.push_str(line);
                input.push('\n');
            }
            _ if in_expected => {
                expected.push_str(line);
                expected.push('\n');
            }
            _ => {}
        }
    }
    assert!(!cases.is_empty(), "no cases in {fixture_rel}");
    cases
}

/// Lowers the input graph with `options` and compares the printed result with
/// the printed expected graph.
pub fn run_lowering_case(case: &Case, options: &LoweringOptions) {
    let mut graph = parse_graph(&case.input)
        .unwrap_or_else(|e| panic!("case `{}`: input does not parse: {}", case.name, e));
    let expected = parse_graph(&case.expected)
        .unwrap_or_else(|e| panic!("case `{}`: expectation does not parse: {}", case.name, e));
    lower_graph(&mut graph, options)
        .unwrap_or_else(|e| panic!("case `{}`: lowering failed: {}", case.name, e));
    assert_eq!(
        graph.to_string(),
        expected.to_string(),
        "case `{}` lowered to unexpected graph",
        case.name
    );
}
