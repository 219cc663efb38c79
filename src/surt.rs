//! SURT-style canonical keys for URLs.
//!
//! The keys reverse the host labels (`www.example.com` becomes `com,example)`)
//! so that everything under one site sorts together. They are only used for
//! grouping and de-duplication, never as primary data.
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

static WWW_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^www\d*\.(.+)$").expect("static regex is valid"));
static MOBILE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^m\.(.+)$").expect("static regex is valid"));

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SurtError {
    #[error("malformed URL {0:?}: no host component")]
    MalformedUrl(String),
}

/// Strips `www`, `www<digits>` and `m` subdomain prefixes.
///
/// Prefixes are removed until none is left, so the result is a fixed point:
/// `simplify_host(simplify_host(h)) == simplify_host(h)`.
pub fn simplify_host(host: &str) -> &str {
    let mut current = host;
    loop {
        let stripped = WWW_PREFIX
            .captures(current)
            .or_else(|| MOBILE_PREFIX.captures(current))
            .and_then(|caps| caps.get(1));
        match stripped {
            Some(rest) => current = &current[rest.start()..],
            None => return current,
        }
    }
}

fn parse_host(url: &str) -> Result<(Url, String), SurtError> {
    let parsed = Url::parse(url).map_err(|_| SurtError::MalformedUrl(url.to_string()))?;
    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| SurtError::MalformedUrl(url.to_string()))?
        .to_lowercase();
    Ok((parsed, host))
}

fn host_key(host: &str) -> String {
    let mut labels: Vec<&str> = simplify_host(host).split('.').collect();
    labels.reverse();
    format!("{})", labels.join(","))
}

/// Reversed, simplified host key, e.g. `https://www.Example.com/x` -> `com,example)`.
pub fn canonical_host_key(url: &str) -> Result<String, SurtError> {
    let (_, host) = parse_host(url)?;
    Ok(host_key(&host))
}

/// Host key followed by the lowercased path without query, fragment or a trailing `/`.
pub fn canonical_hostpath_key(url: &str) -> Result<String, SurtError> {
    let (parsed, host) = parse_host(url)?;
    let path = parsed.path().to_lowercase();
    let path = path.strip_suffix('/').unwrap_or(&path);
    Ok(format!("{}{}", host_key(&host), path))
}
