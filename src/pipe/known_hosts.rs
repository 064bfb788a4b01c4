//! Host key verification against the known_hosts data supplied with an
//! approved upstream.
//!
//! Supports plain host patterns (`host`, `[host]:port`), `*`/`?` wildcards,
//! `!` negation, hashed entries (`|1|salt|hmac`, as written by
//! `ssh-keygen -H`) and the `@revoked` marker. `@cert-authority` lines are
//! never considered a match.

use crate::error::{BrokerError, BrokerResult};
use crate::session::upstream::{split_host_port, DEFAULT_SSH_PORT};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

const HASHED_PREFIX: &str = "|1|";

#[derive(Debug, PartialEq, Eq)]
enum Marker {
    None,
    Revoked,
    CertAuthority,
}

#[derive(Debug)]
struct KnownHostLine<'a> {
    marker: Marker,
    patterns: &'a str,
    key: Vec<u8>,
}

fn parse_line(line: &str) -> Option<KnownHostLine<'_>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut fields = line.split_whitespace();
    let mut first = fields.next()?;
    let marker = match first {
        "@revoked" => Marker::Revoked,
        "@cert-authority" => Marker::CertAuthority,
        _ => Marker::None,
    };
    if marker != Marker::None {
        first = fields.next()?;
    }

    let _key_type = fields.next()?;
    let key = BASE64.decode(fields.next()?).ok()?;

    Some(KnownHostLine {
        marker,
        patterns: first,
        key,
    })
}

/// Glob match supporting `*` and `?`, ASCII case-insensitive.
///
/// Backtracks only to the most recent `*`, so the cost stays bounded by
/// `pattern.len() * text.len()` whatever the pattern looks like.
fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    // (position of the last `*` in pattern, text position it is matched up to)
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                star = Some((p, t));
                p += 1;
            }
            Some(&c) if c == b'?' || c.eq_ignore_ascii_case(&text[t]) => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((star_p, star_t)) => {
                    star = Some((star_p, star_t + 1));
                    p = star_p + 1;
                    t = star_t + 1;
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// `|1|base64(salt)|base64(HMAC-SHA1(salt, host))`
fn hashed_match(entry: &str, candidate: &str) -> bool {
    let Some((salt, hash)) = entry
        .strip_prefix(HASHED_PREFIX)
        .and_then(|rest| rest.split_once('|'))
    else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (BASE64.decode(salt), BASE64.decode(hash)) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(&salt) else {
        return false;
    };
    mac.update(candidate.to_ascii_lowercase().as_bytes());
    mac.verify_slice(&hash).is_ok()
}

fn patterns_match(patterns: &str, candidate: &str) -> bool {
    if patterns.starts_with('|') {
        return hashed_match(patterns, candidate);
    }

    let mut matched = false;
    for pattern in patterns.split(',') {
        match pattern.strip_prefix('!') {
            Some(negated) => {
                if wildcard_match(negated.as_bytes(), candidate.as_bytes()) {
                    return false;
                }
            }
            None => {
                if wildcard_match(pattern.as_bytes(), candidate.as_bytes()) {
                    matched = true;
                }
            }
        }
    }
    matched
}

/// known_hosts spelling of an address: `host` on port 22, `[host]:port` otherwise.
fn candidate(addr: &str) -> Option<String> {
    let (host, port) = split_host_port(addr).ok()?;
    if port == DEFAULT_SSH_PORT {
        Some(host)
    } else {
        Some(format!("[{}]:{}", host, port))
    }
}

/// Verify `key` (SSH wire-format public key blob) presented by `hostname`
/// at `netaddr` against base64-encoded known_hosts text.
pub fn verify_host_key(
    known_hosts_b64: &str,
    hostname: &str,
    netaddr: &str,
    key: &[u8],
) -> BrokerResult<()> {
    let data = BASE64
        .decode(known_hosts_b64.trim())
        .map_err(|_| BrokerError::invalid_upstream("known hosts data is not valid base64"))?;
    let text = String::from_utf8_lossy(&data);

    let candidates: Vec<String> = [hostname, netaddr]
        .iter()
        .filter_map(|addr| candidate(addr))
        .collect();

    let mut accepted = false;
    for line in text.lines().filter_map(parse_line) {
        if !candidates.iter().any(|c| patterns_match(line.patterns, c)) {
            continue;
        }
        match line.marker {
            Marker::Revoked if line.key == key => {
                debug!(hostname, "Presented host key is revoked");
                return Err(BrokerError::HostKeyMismatch(hostname.to_string()));
            }
            Marker::None if line.key == key => accepted = true,
            _ => {}
        }
    }

    if accepted {
        Ok(())
    } else {
        Err(BrokerError::HostKeyMismatch(hostname.to_string()))
    }
}
