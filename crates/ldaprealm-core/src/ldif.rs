use std::collections::BTreeMap;
use std::path::Path;

use base64::Engine;

use crate::entry::LdapEntry;
use crate::error::RealmError;

/// Read directory content from an LDIF file.
pub fn load(path: &Path) -> Result<Vec<LdapEntry>, RealmError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        RealmError::Configuration(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse_ldif(&content)
}

/// Parse LDIF content (RFC 2849 content records) into entries.
pub fn parse_ldif(content: &str) -> Result<Vec<LdapEntry>, RealmError> {
    let mut entries = Vec::new();
    let mut dn: Option<String> = None;
    let mut attrs: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (number, line) in unfold_lines(content).lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            if let Some(dn) = dn.take() {
                entries.push(LdapEntry::new(dn, std::mem::take(&mut attrs)));
            }
            continue;
        }
        if line.starts_with('#') || line.starts_with("version:") {
            continue;
        }

        let (attr, value) = parse_line(line).ok_or_else(|| {
            RealmError::Configuration(format!("malformed LDIF line {}: {}", number + 1, line))
        })?;

        if attr.eq_ignore_ascii_case("dn") {
            if let Some(previous) = dn.replace(value) {
                entries.push(LdapEntry::new(previous, std::mem::take(&mut attrs)));
            }
        } else if dn.is_none() {
            return Err(RealmError::Configuration(format!(
                "LDIF line {} appears before any dn",
                number + 1
            )));
        } else {
            attrs.entry(attr).or_default().push(value);
        }
    }

    if let Some(dn) = dn {
        entries.push(LdapEntry::new(dn, attrs));
    }
    Ok(entries)
}

/// Parse a single line into (attribute, value). Handles `attr:: base64`.
fn parse_line(line: &str) -> Option<(String, String)> {
    let (attr, rest) = line.split_once(':')?;
    if attr.is_empty() || attr.contains(' ') {
        return None;
    }
    let value = match rest.strip_prefix(':') {
        Some(encoded) => {
            let encoded = encoded.trim();
            base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .unwrap_or_else(|| encoded.to_string())
        }
        None => rest.strip_prefix(' ').unwrap_or(rest).to_string(),
    };
    Some((attr.to_string(), value))
}

/// Unfold continuation lines (lines starting with a single space).
fn unfold_lines(content: &str) -> String {
    let mut result = String::with_capacity(content.len());
    for line in content.lines() {
        match line.strip_prefix(' ') {
            Some(continued) if !result.is_empty() && !result.ends_with('\n') => {
                result.push_str(continued)
            }
            _ => {
                if !result.is_empty() {
                    result.push('\n');
                }
                result.push_str(line);
            }
        }
    }
    result
}
