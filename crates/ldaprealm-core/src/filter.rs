use crate::dn;
use crate::entry::LdapEntry;

/// A parsed LDAP search filter.
///
/// ```text
/// filter     = "(" filtercomp ")"
/// filtercomp = and / or / not / item
/// and        = "&" filterlist
/// or         = "|" filterlist
/// not        = "!" filter
/// filterlist = 1*filter
/// item       = attr filtertype value
/// filtertype = "=" / "~=" / ">=" / "<="
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equal(String, String),
    Approx(String, String),
    GreaterOrEqual(String, String),
    LessOrEqual(String, String),
    Present(String),
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
}

/// Placeholder replaced by the (escaped) user name in filter templates.
pub const USERNAME_PLACEHOLDER: &str = "{0}";

/// Substitute the escaped `value` for every `{0}` in `template`.
pub fn substitute(template: &str, value: &str) -> String {
    template.replace(USERNAME_PLACEHOLDER, &ldap3::ldap_escape(value))
}

/// Build `(attr=value)` with the value escaped.
pub fn equality(attr: &str, value: &str) -> String {
    format!("({}={})", attr, ldap3::ldap_escape(value))
}

/// Validate that a string is a valid LDAP search filter per RFC 4515.
pub fn validate_filter(filter: &str) -> Result<(), String> {
    parse(filter).map(|_| ())
}

/// Parse a filter string.
pub fn parse(filter: &str) -> Result<Filter, String> {
    let filter = filter.trim();
    if filter.is_empty() {
        return Err("Filter cannot be empty".to_string());
    }
    let bytes = filter.as_bytes();
    let (parsed, end) = parse_filter(bytes, 0)?;
    if end != bytes.len() {
        return Err(format!(
            "Unexpected characters after filter at position {}",
            end + 1
        ));
    }
    Ok(parsed)
}

impl Filter {
    /// Evaluate against an entry. Attribute names and values compare
    /// case-insensitively; values that look like DNs compare in normal form.
    pub fn matches(&self, entry: &LdapEntry) -> bool {
        match self {
            Filter::And(items) => items.iter().all(|f| f.matches(entry)),
            Filter::Or(items) => items.iter().any(|f| f.matches(entry)),
            Filter::Not(inner) => !inner.matches(entry),
            Filter::Present(attr) => {
                attr.eq_ignore_ascii_case("objectClass") || !entry.values(attr).is_empty()
            }
            Filter::Equal(attr, value) | Filter::Approx(attr, value) => {
                let wanted = fold(value);
                entry.values(attr).iter().any(|v| fold(v) == wanted)
            }
            Filter::GreaterOrEqual(attr, value) => entry
                .values(attr)
                .iter()
                .any(|v| v.to_lowercase() >= value.to_lowercase()),
            Filter::LessOrEqual(attr, value) => entry
                .values(attr)
                .iter()
                .any(|v| v.to_lowercase() <= value.to_lowercase()),
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => entry
                .values(attr)
                .iter()
                .any(|v| substring_match(&v.to_lowercase(), initial, any, last)),
        }
    }
}

fn fold(value: &str) -> String {
    if value.contains('=') {
        dn::normalize(value)
    } else {
        value.to_lowercase()
    }
}

fn substring_match(
    value: &str,
    initial: &Option<String>,
    any: &[String],
    last: &Option<String>,
) -> bool {
    let mut rest = value;
    if let Some(initial) = initial {
        match rest.strip_prefix(initial.to_lowercase().as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in any {
        let part = part.to_lowercase();
        match rest.find(&part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    match last {
        Some(last) => rest.ends_with(&last.to_lowercase()),
        None => true,
    }
}

/// Parse a single filter: "(" filtercomp ")"
/// Returns the filter and the position after the closing ')'.
fn parse_filter(input: &[u8], pos: usize) -> Result<(Filter, usize), String> {
    if pos >= input.len() || input[pos] != b'(' {
        return Err(format!("Expected '(' at position {}", pos + 1));
    }

    let inner = pos + 1;
    if inner >= input.len() {
        return Err(format!(
            "Unexpected end of filter after '(' at position {}",
            pos + 1
        ));
    }

    let (filter, end) = match input[inner] {
        b'&' => {
            let (items, end) = parse_filter_list(input, inner + 1, '&')?;
            (Filter::And(items), end)
        }
        b'|' => {
            let (items, end) = parse_filter_list(input, inner + 1, '|')?;
            (Filter::Or(items), end)
        }
        b'!' => {
            let (negated, end) = parse_filter(input, inner + 1)?;
            (Filter::Not(Box::new(negated)), end)
        }
        _ => parse_item(input, inner)?,
    };

    if end >= input.len() || input[end] != b')' {
        return Err(format!("Expected ')' at position {}", end + 1));
    }
    Ok((filter, end + 1))
}

/// Parse a filterlist: 1*filter
fn parse_filter_list(input: &[u8], pos: usize, op: char) -> Result<(Vec<Filter>, usize), String> {
    let mut items = Vec::new();
    let mut cur = pos;
    while cur < input.len() && input[cur] == b'(' {
        let (item, next) = parse_filter(input, cur)?;
        items.push(item);
        cur = next;
    }
    if items.is_empty() {
        return Err(format!(
            "Empty filter list in '{}' operator at position {}",
            op,
            pos + 1
        ));
    }
    Ok((items, cur))
}

/// Parse an item: attr filtertype value
fn parse_item(input: &[u8], pos: usize) -> Result<(Filter, usize), String> {
    let mut cur = pos;
    while cur < input.len() && is_attr_char(input[cur]) {
        cur += 1;
    }
    if cur == pos {
        return Err(format!("Expected attribute name at position {}", pos + 1));
    }
    let attr = String::from_utf8_lossy(&input[pos..cur]).into_owned();

    if cur >= input.len() {
        return Err(format!("Expected operator at position {}", cur + 1));
    }
    let (op, value_start) = match input[cur] {
        b'=' => ("=", cur + 1),
        b'~' | b'>' | b'<' if input.get(cur + 1) == Some(&b'=') => {
            let op = match input[cur] {
                b'~' => "~=",
                b'>' => ">=",
                _ => "<=",
            };
            (op, cur + 2)
        }
        _ => return Err(format!("Expected operator at position {}", cur + 1)),
    };

    let mut end = value_start;
    while end < input.len() && input[end] != b')' {
        if input[end] == b'(' {
            return Err(format!("Unescaped '(' in value at position {}", end + 1));
        }
        end += 1;
    }
    let raw = std::str::from_utf8(&input[value_start..end])
        .map_err(|_| format!("Invalid UTF-8 in value at position {}", value_start + 1))?;

    let filter = match op {
        "=" if raw == "*" => Filter::Present(attr),
        "=" if raw.contains('*') => {
            let pieces: Vec<&str> = raw.split('*').collect();
            let initial = Some(pieces[0]).filter(|p| !p.is_empty()).map(unescape).transpose()?;
            let last = pieces
                .last()
                .copied()
                .filter(|p| !p.is_empty())
                .map(unescape)
                .transpose()?;
            let any = pieces[1..pieces.len() - 1]
                .iter()
                .filter(|p| !p.is_empty())
                .map(|p| unescape(p))
                .collect::<Result<Vec<_>, _>>()?;
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            }
        }
        "=" => Filter::Equal(attr, unescape(raw)?),
        "~=" => Filter::Approx(attr, unescape(raw)?),
        ">=" => Filter::GreaterOrEqual(attr, unescape(raw)?),
        _ => Filter::LessOrEqual(attr, unescape(raw)?),
    };
    Ok((filter, end))
}

fn is_attr_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b';' || b == b'_'
}

/// Decode `\XX` hex escapes in an assertion value.
fn unescape(raw: &str) -> Result<String, String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = raw
                .get(i + 1..i + 3)
                .ok_or_else(|| format!("Truncated escape in value '{raw}'"))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| format!("Invalid escape '\\{hex}' in value '{raw}'"))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| format!("Invalid UTF-8 in value '{raw}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn alice() -> LdapEntry {
        LdapEntry::new(
            "uid=alice,ou=People,dc=example".to_string(),
            BTreeMap::from([
                ("uid".to_string(), vec!["alice".to_string()]),
                ("cn".to_string(), vec!["Alice Smith".to_string()]),
                (
                    "objectClass".to_string(),
                    vec!["top".to_string(), "person".to_string()],
                ),
                (
                    "memberOf".to_string(),
                    vec!["cn=Admins,ou=Groups,dc=example".to_string()],
                ),
            ]),
        )
    }

    #[test]
    fn test_validate_filter() {
        assert!(validate_filter("(cn=John)").is_ok());
        assert!(validate_filter("(&(objectClass=person)(|(cn=a*)(!(sn=b))))").is_ok());
        assert!(validate_filter("").is_err());
        assert!(validate_filter("cn=John").is_err());
        assert!(validate_filter("(&)").is_err());
        assert!(validate_filter("(cn=John))").is_err());
        assert!(validate_filter("(cn=John").is_err());
        assert!(validate_filter("(=John)").is_err());
    }

    #[test]
    fn test_parse_shapes() {
        assert_eq!(parse("(cn=*)").unwrap(), Filter::Present("cn".to_string()));
        assert_eq!(
            parse("(cn=Al*ce*)").unwrap(),
            Filter::Substring {
                attr: "cn".to_string(),
                initial: Some("Al".to_string()),
                any: vec!["ce".to_string()],
                last: None,
            }
        );
        assert_eq!(
            parse("(uid>=m)").unwrap(),
            Filter::GreaterOrEqual("uid".to_string(), "m".to_string())
        );
    }

    #[test]
    fn test_matches() {
        let entry = alice();
        assert!(parse("(uid=ALICE)").unwrap().matches(&entry));
        assert!(parse("(&(objectClass=person)(cn=*smith))").unwrap().matches(&entry));
        assert!(parse("(|(uid=bob)(cn=alice*))").unwrap().matches(&entry));
        assert!(!parse("(!(uid=alice))").unwrap().matches(&entry));
        assert!(parse("(memberOf=CN=admins, ou=groups,dc=example)")
            .unwrap()
            .matches(&entry));
        assert!(!parse("(mail=*)").unwrap().matches(&entry));
        assert!(parse("(cn=A*e S*h)").unwrap().matches(&entry));
    }

    #[test]
    fn test_substitute_escapes() {
        assert_eq!(
            substitute("(&(uid={0})(objectClass=person))", "alice"),
            "(&(uid=alice)(objectClass=person))"
        );
        let injected = substitute("(uid={0})", "*)(uid=*");
        assert!(!parse(&injected).unwrap().matches(&alice()));
        assert_eq!(
            parse(&equality("uid", "a*b")).unwrap(),
            Filter::Equal("uid".to_string(), "a*b".to_string())
        );
    }

    #[test]
    fn test_escaped_values_round_trip() {
        let filter = parse(&equality("cn", "Alice (admin)")).unwrap();
        assert_eq!(
            filter,
            Filter::Equal("cn".to_string(), "Alice (admin)".to_string())
        );
    }
}
