use std::path::Path;

use anyhow::{Context, Result, bail};

/// Parse a `.env`-style file: `KEY=VALUE` lines, `#` comments, blank
/// lines ignored. Values may be single- or double-quoted.
pub fn parse(content: &str) -> Result<Vec<(String, String)>> {
    let mut vars = Vec::new();

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            bail!("Line {}: expected KEY=VALUE, got {:?}", lineno + 1, raw);
        };

        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("Line {}: invalid variable name {:?}", lineno + 1, key);
        }

        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);

        vars.push((key.to_string(), value.to_string()));
    }

    Ok(vars)
}

/// Load and parse an env file from disk.
pub fn load(path: &Path) -> Result<Vec<(String, String)>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read env file {}", path.display()))?;
    parse(&content).with_context(|| format!("Malformed env file {}", path.display()))
}

/// Render variables back into file form for shipping to hosts.
pub fn render(vars: &[(String, String)]) -> String {
    let mut out = String::new();
    for (key, value) in vars {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}
