/// Split a DN into its RDN components, honouring backslash-escaped commas.
pub fn components(dn: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, ch) in dn.char_indices() {
        match ch {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => {
                parts.push(dn[start..i].trim());
                start = i + 1;
            }
            _ => escaped = false,
        }
    }
    let last = dn[start..].trim();
    if !last.is_empty() || !parts.is_empty() {
        parts.push(last);
    }
    parts
}

/// Canonical form used for DN comparisons: lowercase, no spaces around separators.
pub fn normalize(dn: &str) -> String {
    components(dn)
        .iter()
        .map(|rdn| match rdn.split_once('=') {
            Some((attr, value)) => format!("{}={}", attr.trim(), value.trim()),
            None => rdn.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
        .to_lowercase()
}

/// Get the parent DN (everything after the first unescaped comma).
pub fn parent_dn(dn: &str) -> Option<String> {
    let parts = components(dn);
    if parts.len() < 2 {
        return None;
    }
    Some(parts[1..].join(","))
}

/// Check if `dn` equals `base` or lies somewhere below it.
pub fn is_at_or_below(dn: &str, base: &str) -> bool {
    let dn = normalize(dn);
    let base = normalize(base);
    base.is_empty() || dn == base || dn.ends_with(&format!(",{base}"))
}

/// Check if `dn` is an immediate child of `parent`.
pub fn is_child_of(dn: &str, parent: &str) -> bool {
    parent_dn(dn)
        .map(|p| normalize(&p) == normalize(parent))
        .unwrap_or(false)
}

/// Find the value of the first RDN whose attribute type is `attr`
/// (case-insensitive), scanning from the leaf towards the root.
pub fn rdn_value(dn: &str, attr: &str) -> Option<String> {
    components(dn).into_iter().find_map(|rdn| {
        let (ty, value) = rdn.split_once('=')?;
        ty.trim()
            .eq_ignore_ascii_case(attr)
            .then(|| unescape_value(value.trim()))
    })
}

fn unescape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}
