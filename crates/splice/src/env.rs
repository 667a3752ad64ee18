use std::env;
use std::sync::OnceLock;

const DEFAULT_LOWERING_MAX_ITERS: usize = 4;

static SPLICE_LOWERING_MAX_ITERS: OnceLock<usize> = OnceLock::new();
static SPLICE_DUMP_GRAPHS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_iters(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok().filter(|iters| *iters > 0)
}

/// Iteration cap for fixed-point groups in the lowering pipeline.
pub(crate) fn lowering_max_iters() -> usize {
    *SPLICE_LOWERING_MAX_ITERS.get_or_init(|| {
        env::var("SPLICE_LOWERING_MAX_ITERS")
            .ok()
            .and_then(|value| parse_iters(&value))
            .unwrap_or(DEFAULT_LOWERING_MAX_ITERS)
    })
}

/// Dumps the graph text after every lowering pass at `trace` level.
pub(crate) fn dump_graphs() -> bool {
    *SPLICE_DUMP_GRAPHS.get_or_init(|| match env::var("SPLICE_DUMP_GRAPHS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_override_rejects_zero_and_garbage() {
        assert_eq!(parse_iters("8"), Some(8));
        assert_eq!(parse_iters(" 2 "), Some(2));
        assert_eq!(parse_iters("0"), None);
        assert_eq!(parse_iters("many"), None);
    }

    #[test]
    fn bool_flags_accept_common_spellings() {
        assert!(parse_bool("ON"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("off"));
    }
}
