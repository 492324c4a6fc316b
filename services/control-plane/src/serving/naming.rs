//! Deterministic names for an endpoint's backing resources.
//!
//! Every name is derived from the immutable endpoint id, never from the route
//! text, so renaming a route or redeploying never changes which objects an
//! endpoint owns. The id's ULID is lowercased to satisfy DNS-1123.

use mserve_id::EndpointId;
use thiserror::Error;

/// Label key carried by every resource an endpoint owns, pods included.
pub const ENDPOINT_LABEL: &str = "mserve.io/endpoint";

/// Annotation carrying the hash of the desired state a resource was rendered from.
pub const SPEC_HASH_ANNOTATION: &str = "mserve.io/spec-hash";

/// Annotation carrying the normalized route on managed inference services.
pub const ROUTE_ANNOTATION: &str = "mserve.io/route";

/// Label identifying the control plane as the resource owner.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

pub const MANAGED_BY_VALUE: &str = "mserve";

/// Longest name Kubernetes accepts for a DNS-1123 label.
pub const MAX_NAME_LEN: usize = 63;

/// Names of every resource owned by one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    /// Managed inference service or raw Deployment.
    pub primary: String,
    pub service: String,
    pub autoscaler: String,
    pub route: String,
    /// `key=value` selector matching every owned resource and pod.
    pub selector: String,
    /// Value of [`ENDPOINT_LABEL`] on owned resources.
    pub label_value: String,
}

impl ResourceNames {
    pub fn for_endpoint(id: &EndpointId) -> Self {
        let base = id.dns_label();
        Self {
            primary: base.clone(),
            service: format!("{base}-svc"),
            autoscaler: format!("{base}-hpa"),
            route: format!("{base}-route"),
            selector: format!("{ENDPOINT_LABEL}={base}"),
            label_value: base,
        }
    }
}

/// Returns true if `name` is a valid DNS-1123 label.
pub fn is_dns1123_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LEN {
        return false;
    }
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    edge_ok(bytes[0])
        && edge_ok(bytes[bytes.len() - 1])
        && bytes
            .iter()
            .all(|&b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("route must not be empty")]
    Empty,

    #[error("route contains invalid character {0:?}")]
    InvalidCharacter(char),

    #[error("route segment {0:?} is not allowed")]
    InvalidSegment(String),
}

/// Normalize a route: absolute, duplicate slashes collapsed, no trailing slash
/// except for the root route.
pub fn normalize_route(raw: &str) -> Result<String, RouteError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RouteError::Empty);
    }

    if let Some(c) = trimmed
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '?' | '#' | '\\' | '%') || c.is_control())
    {
        return Err(RouteError::InvalidCharacter(c));
    }

    let mut normalized = String::with_capacity(trimmed.len() + 1);
    for segment in trimmed.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(RouteError::InvalidSegment(segment.to_string()));
        }
        normalized.push('/');
        normalized.push_str(segment);
    }

    if normalized.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mserve_id::Ulid;
    use proptest::prelude::*;

    #[test]
    fn test_names_derive_from_id() {
        let id: EndpointId = "ep_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse().unwrap();
        let names = ResourceNames::for_endpoint(&id);

        assert_eq!(names.primary, "ep-01hv4z2wqxkjnm8gpqy6vbkc3d");
        assert_eq!(names.service, "ep-01hv4z2wqxkjnm8gpqy6vbkc3d-svc");
        assert_eq!(names.autoscaler, "ep-01hv4z2wqxkjnm8gpqy6vbkc3d-hpa");
        assert_eq!(names.route, "ep-01hv4z2wqxkjnm8gpqy6vbkc3d-route");
        assert_eq!(
            names.selector,
            "mserve.io/endpoint=ep-01hv4z2wqxkjnm8gpqy6vbkc3d"
        );
    }

    #[test]
    fn test_names_stable_across_calls() {
        let id = EndpointId::new();
        assert_eq!(
            ResourceNames::for_endpoint(&id),
            ResourceNames::for_endpoint(&id)
        );
    }

    #[test]
    fn test_dns1123_label() {
        assert!(is_dns1123_label("ep-abc"));
        assert!(!is_dns1123_label("Ep-abc"));
        assert!(!is_dns1123_label("-abc"));
        assert!(!is_dns1123_label("abc-"));
        assert!(!is_dns1123_label(""));
        assert!(!is_dns1123_label(&"a".repeat(64)));
    }

    #[test]
    fn test_normalize_route() {
        assert_eq!(normalize_route("/").unwrap(), "/");
        assert_eq!(normalize_route("").unwrap_err(), RouteError::Empty);
        assert_eq!(normalize_route("chat").unwrap(), "/chat");
        assert_eq!(normalize_route("/chat/").unwrap(), "/chat");
        assert_eq!(normalize_route("//v1//chat///").unwrap(), "/v1/chat");
        assert_eq!(normalize_route("  /chat  ").unwrap(), "/chat");
        assert_eq!(normalize_route("///").unwrap(), "/");
        assert!(matches!(
            normalize_route("/chat bot"),
            Err(RouteError::InvalidCharacter(' '))
        ));
        assert!(matches!(
            normalize_route("/chat?x=1"),
            Err(RouteError::InvalidCharacter('?'))
        ));
        assert!(matches!(
            normalize_route("/a/../b"),
            Err(RouteError::InvalidSegment(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_all_names_are_dns_labels(raw in any::<u128>()) {
            let id = EndpointId::from_ulid(Ulid(raw));
            let names = ResourceNames::for_endpoint(&id);
            for name in [&names.primary, &names.service, &names.autoscaler, &names.route] {
                prop_assert!(is_dns1123_label(name), "invalid name {}", name);
            }
        }

        #[test]
        fn prop_names_injective(a in any::<u128>(), b in any::<u128>()) {
            prop_assume!(a != b);
            let na = ResourceNames::for_endpoint(&EndpointId::from_ulid(Ulid(a)));
            let nb = ResourceNames::for_endpoint(&EndpointId::from_ulid(Ulid(b)));
            prop_assert_ne!(na.primary, nb.primary);
            prop_assert_ne!(na.selector, nb.selector);
        }

        #[test]
        fn prop_normalized_route_is_fixed_point(segments in proptest::collection::vec("[a-z0-9_-]{1,8}", 0..5)) {
            let raw = format!("/{}/", segments.join("//"));
            let once = normalize_route(&raw).unwrap();
            prop_assert_eq!(normalize_route(&once).unwrap(), once.clone());
            prop_assert!(once.starts_with('/'));
            prop_assert!(once == "/" || !once.ends_with('/'));
        }
    }
}
