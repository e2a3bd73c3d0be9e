use std::net::Ipv4Addr;

use crate::error::{Error, Result};

pub const PAYLINK_SCHEME: &str = "ergopay:";
const PAYLINK_DYNAMIC_PREFIX: &str = "ergopay://";
pub const ADDRESS_PLACEHOLDER: &str = "#P2PK_ADDRESS#";
// some QR generators escape the trailing '#'
const ADDRESS_PLACEHOLDER_ESCAPED: &str = "#P2PK_ADDRESS%23";

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.get(..prefix.len())
        .map(|p| p.eq_ignore_ascii_case(prefix))
        .unwrap_or(false)
}

pub fn is_paylink(uri: &str) -> bool {
    starts_with_ignore_case(uri, PAYLINK_SCHEME)
}

/// A static request embeds the reduced transaction right after the scheme
pub fn is_static_paylink(uri: &str) -> bool {
    is_paylink(uri) && !starts_with_ignore_case(uri, PAYLINK_DYNAMIC_PREFIX)
}

pub fn is_dynamic_paylink(uri: &str) -> bool {
    starts_with_ignore_case(uri, PAYLINK_DYNAMIC_PREFIX)
}

pub fn needs_address(uri: &str) -> bool {
    uri.contains(ADDRESS_PLACEHOLDER) || uri.contains(ADDRESS_PLACEHOLDER_ESCAPED)
}

/// Everything after `ergopay:`
pub fn paylink_payload(uri: &str) -> Result<&str> {
    if !is_paylink(uri) {
        return Err(Error::NotPayLink);
    }
    Ok(&uri[PAYLINK_SCHEME.len()..])
}

/// Turns a dynamic request into the URL to fetch from, substituting the
/// address placeholder. Local hosts keep plain http for development.
pub fn resolve_fetch_url(uri: &str, address: Option<&str>) -> Result<String> {
    if !is_dynamic_paylink(uri) {
        return Err(Error::NotPayLink);
    }
    let mut rest = paylink_payload(uri)?.to_string();
    if needs_address(&rest) {
        let address = address.ok_or(Error::MissingAddress)?;
        rest = rest
            .replace(ADDRESS_PLACEHOLDER, address)
            .replace(ADDRESS_PLACEHOLDER_ESCAPED, address);
    }
    let scheme = if is_local_host(hostname(&rest)) {
        "http:"
    } else {
        "https:"
    };
    Ok(format!("{scheme}{rest}"))
}

pub fn hostname(url: &str) -> &str {
    let after_scheme = url.split_once("//").map(|(_, r)| r).unwrap_or(url);
    let host_port = after_scheme.split('/').next().unwrap_or_default();
    host_port.split(':').next().unwrap_or_default()
}

pub fn is_local_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost") || host.parse::<Ipv4Addr>().is_ok()
}
