//! Coarse textual check that rejects fragments asking to load extra modules.
//!
//! This is not an analyzer. It catches the obvious ways of pulling in code
//! beyond the bound capability table; everything else is left to the engine.

use regex::Regex;
use std::sync::LazyLock;

// Compile the rules once; each pairs a pattern with the label shown to the caller.
static RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?m)^\s*import\b", "import statement"),
        (r"\bimport\s*\(", "dynamic import()"),
        (r"\brequire\s*\(", "require()"),
        (r"\bimportScripts\s*\(", "importScripts()"),
        (r"(?m)^\s*from\s+[\w.]+\s+import\b", "from ... import"),
    ]
    .into_iter()
    .map(|(pattern, label)| (Regex::new(pattern).unwrap(), label))
    .collect()
});

/// `Err` carries the message returned to the caller in place of a result.
pub fn check_fragment(code: &str, available: &[&str]) -> Result<(), String> {
    for (pattern, label) in RULES.iter() {
        if pattern.is_match(code) {
            return Err(format!(
                "Error: loading additional modules is not permitted ({} found). \
                 These capabilities are already bound and can be called directly: {}",
                label,
                available.join(", ")
            ));
        }
    }
    Ok(())
}
