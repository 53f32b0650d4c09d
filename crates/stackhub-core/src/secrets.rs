const SECRET_MARKERS: &[&str] = &["password", "secret", "key", "token"];
const MASK: &str = "****";

/// Whether a parameter or output name looks like it holds a secret.
pub fn looks_secret(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SECRET_MARKERS.iter().any(|m| lower.contains(m))
}

/// The loggable form of `value`. Never use the result for substitution.
pub fn mask<'a>(name: &str, value: &'a str) -> &'a str {
    if looks_secret(name) && !value.is_empty() {
        MASK
    } else {
        value
    }
}

/// `text` with every occurrence of the given secret values masked.
pub fn redact(text: &str, secrets: &[String]) -> String {
    let mut out = text.to_owned();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        out = out.replace(secret.as_str(), MASK);
    }
    out
}
