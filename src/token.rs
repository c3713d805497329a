//! Capability tokens.
//!
//! A token couples a catalog decision to disk-side admission: it binds a
//! client id (DN or IP), a physical file name, an access mode and an expiry
//! under a shared password, so a disk node can admit the request without
//! consulting the catalog again. The token text is
//! `<expiry>:<mode>:<hex hmac-sha256>`.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Outcome of [`validate_token`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenResult {
    /// The token is valid for this request.
    Ok,
    /// The token text does not parse.
    Malformed,
    /// The MAC does not match the request fields.
    Invalid,
    /// The token was valid but its lifetime has passed.
    Expired,
    /// A read token was presented for a write (or vice versa).
    WrongMode,
    /// The verifier itself failed.
    InternalError,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn compute_mac(id: &str, pfn: &str, password: &str, expires: u64, write: bool) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(password.as_bytes()).ok()?;
    mac.update(id.as_bytes());
    mac.update(b"\0");
    mac.update(pfn.as_bytes());
    mac.update(b"\0");
    mac.update(expires.to_string().as_bytes());
    mac.update(b"\0");
    mac.update(if write { b"w" } else { b"r" });
    let bytes = mac.finalize().into_bytes();
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    Some(out)
}

/// Mint a token for `id` to access `pfn` for `lifetime` seconds.
///
/// `id` is whatever the verifier will use as the client identity, a DN or an
/// IP address depending on the `TokenId` configuration.
pub fn generate_token(id: &str, pfn: &str, password: &str, lifetime: u64, write: bool) -> String {
    let expires = unix_now().saturating_add(lifetime);
    let mode = if write { 'w' } else { 'r' };
    match compute_mac(id, pfn, password, expires, write) {
        Some(mac) => format!("{expires}:{mode}:{mac}"),
        None => String::new(),
    }
}

/// Verify a token previously produced by [`generate_token`] with the same
/// id, pfn and password. `write` is the access being requested.
pub fn validate_token(
    token: &str,
    id: &str,
    pfn: &str,
    password: &str,
    write: bool,
) -> TokenResult {
    let mut parts = token.splitn(3, ':');
    let (expires, mode, mac) = match (parts.next(), parts.next(), parts.next()) {
        (Some(e), Some(m), Some(mac)) => (e, m, mac),
        _ => return TokenResult::Malformed,
    };
    let expires: u64 = match expires.parse() {
        Ok(e) => e,
        Err(_) => return TokenResult::Malformed,
    };
    let token_write = match mode {
        "w" => true,
        "r" => false,
        _ => return TokenResult::Malformed,
    };
    let expected = match compute_mac(id, pfn, password, expires, token_write) {
        Some(m) => m,
        None => return TokenResult::InternalError,
    };
    if expected != mac {
        return TokenResult::Invalid;
    }
    if write && !token_write {
        return TokenResult::WrongMode;
    }
    if unix_now() > expires {
        return TokenResult::Expired;
    }
    TokenResult::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "a sufficiently long shared secret";

    #[test]
    fn test_round_trip() {
        let token = generate_token("/CN=alice", "/pool01/f", PASSWD, 600, false);
        assert_eq!(
            validate_token(&token, "/CN=alice", "/pool01/f", PASSWD, false),
            TokenResult::Ok
        );
    }

    #[test]
    fn test_wrong_fields_invalid() {
        let token = generate_token("/CN=alice", "/pool01/f", PASSWD, 600, false);
        assert_eq!(
            validate_token(&token, "/CN=bob", "/pool01/f", PASSWD, false),
            TokenResult::Invalid
        );
        assert_eq!(
            validate_token(&token, "/CN=alice", "/pool01/other", PASSWD, false),
            TokenResult::Invalid
        );
        assert_eq!(
            validate_token(&token, "/CN=alice", "/pool01/f", "other password", false),
            TokenResult::Invalid
        );
    }

    #[test]
    fn test_read_token_denied_for_write() {
        let token = generate_token("/CN=alice", "/pool01/f", PASSWD, 600, false);
        assert_eq!(
            validate_token(&token, "/CN=alice", "/pool01/f", PASSWD, true),
            TokenResult::WrongMode
        );
        // A write token serves reads as well.
        let wtoken = generate_token("/CN=alice", "/pool01/f", PASSWD, 600, true);
        assert_eq!(
            validate_token(&wtoken, "/CN=alice", "/pool01/f", PASSWD, false),
            TokenResult::Ok
        );
    }

    #[test]
    fn test_expired() {
        let token = generate_token("/CN=alice", "/pool01/f", PASSWD, 0, false);
        // lifetime 0 expires immediately after the current second ticks over;
        // build one already in the past instead to avoid sleeping.
        let past = {
            let mac = compute_mac("/CN=alice", "/pool01/f", PASSWD, 1, false).unwrap();
            format!("1:r:{mac}")
        };
        assert_eq!(
            validate_token(&past, "/CN=alice", "/pool01/f", PASSWD, false),
            TokenResult::Expired
        );
        // The zero-lifetime one is still structurally valid right now or
        // expired; never anything else.
        let r = validate_token(&token, "/CN=alice", "/pool01/f", PASSWD, false);
        assert!(r == TokenResult::Ok || r == TokenResult::Expired);
    }

    #[test]
    fn test_malformed() {
        for bad in ["", "garbage", "123:x:ab", "xx:r:ab"] {
            assert_eq!(
                validate_token(bad, "id", "pfn", PASSWD, false),
                TokenResult::Malformed,
                "{bad}"
            );
        }
        // Tampered expiry keeps the shape but breaks the MAC.
        let token = generate_token("id", "pfn", PASSWD, 600, false);
        let tampered = format!("9{token}");
        assert_eq!(
            validate_token(&tampered, "id", "pfn", PASSWD, false),
            TokenResult::Invalid
        );
    }
}
