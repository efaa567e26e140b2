//! `${VAR}` expansion for subprocess launch config: a missing variable
//! expands to the empty string and is logged, never surfaced in an error
//! string that could leak which variables were probed.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

static VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

/// Expand `${VAR}` occurrences in `input` using `env`. Missing variables
/// expand to the empty string; each miss is logged at `warn` with the
/// variable name only (never the surrounding text, which may be sensitive).
pub fn expand(input: &str, env: &HashMap<String, String>) -> String {
    VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match env.get(name) {
                Some(value) => value.clone(),
                None => {
                    tracing::warn!(variable = name, "environment variable not set; expanding to empty string");
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Expand every value in a string map in place (used for a subprocess's own
/// `env` block as well as its `command`/`args`).
pub fn expand_map(
    input: &HashMap<String, String>,
    env: &HashMap<String, String>,
) -> HashMap<String, String> {
    input
        .iter()
        .map(|(k, v)| (k.clone(), expand(v, env)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn substitutes_known_variables() {
        let mut env = HashMap::new();
        env.insert("HOME".to_string(), "/root".to_string());
        assert_eq!(expand("${HOME}/bin", &env), "/root/bin");
    }

    #[test]
    fn missing_variable_expands_to_empty_string() {
        let env = HashMap::new();
        assert_eq!(expand("${MISSING}/bin", &env), "/bin");
    }

    #[test]
    fn leaves_non_variable_text_untouched() {
        let env = HashMap::new();
        assert_eq!(expand("plain text $NOTVAR {braces}", &env), "plain text $NOTVAR {braces}");
    }
}
