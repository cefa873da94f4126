//! Namespace path helpers

/// Namespace used when a request names none
pub const ROOT: &str = "root/";

const TOKEN_PREFIXES: [&str; 4] = ["hvb.", "hvs.", "b.", "s."];

/// Canonicalizes a namespace path
///
/// A canonical namespace has no leading slash and exactly one trailing
/// slash. The empty namespace stays empty.
pub fn canonicalize(ns: &str) -> String {
    let trimmed = ns.trim_start_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }

    let mut out = trimmed.trim_end_matches('/').to_owned();
    out.push('/');
    out
}

/// Canonicalizes the namespace a request names
///
/// A namespace that is empty or only slashes is the root namespace.
pub fn canonicalize_or_root(ns: &str) -> String {
    let ns = canonicalize(ns);
    if ns.is_empty() {
        ROOT.to_owned()
    } else {
        ns
    }
}

/// Joins a configured namespace with a request namespace
///
/// The configured namespace acts as a parent of the request's namespace.
pub fn join(parent: &str, child: &str) -> String {
    canonicalize(&format!(
        "{}/{}",
        parent.trim_end_matches('/'),
        child.trim_start_matches('/')
    ))
}

/// Splits the namespace identifier from a token or lease identifier
///
/// Identifiers issued inside a namespace carry a `.<nsid>` suffix. Returns
/// the identifier without the suffix and the namespace identifier, which is
/// empty for identifiers issued in the root namespace.
pub fn split_id_from_string(input: &str) -> (String, String) {
    let mut prefix = "";
    let mut rest = input;

    if let Some(p) = TOKEN_PREFIXES.iter().find(|p| input.starts_with(**p)) {
        prefix = p;
        rest = &input[p.len()..];
    } else if let Some(slash) = input.rfind('/').filter(|&i| i > 0) {
        if slash == input.len() - 1 {
            return (input.to_owned(), String::new());
        }
        prefix = &input[..=slash];
        rest = &input[slash + 1..];
    }

    match rest.rfind('.') {
        Some(dot) if dot != rest.len() - 1 => (
            format!("{prefix}{}", &rest[..dot]),
            rest[dot + 1..].to_owned(),
        ),
        _ => (format!("{prefix}{rest}"), String::new()),
    }
}
