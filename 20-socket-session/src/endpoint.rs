//! Turns user supplied server addresses into socket URLs.

use url::Url;

use crate::error::EndpointError;

/// Normalizes `raw` into a `ws://` or `wss://` URL.
///
/// `http://` becomes `ws://`, `https://` becomes `wss://`, a value starting
/// with `/` is resolved against `origin`, and anything without a scheme is
/// treated as a plain `ws://` host.
pub fn normalize(raw: &str, origin: Option<&str>) -> Result<String, EndpointError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(EndpointError::Empty);
    }

    if raw.starts_with('/') {
        let Some(origin) = origin else {
            return Err(EndpointError::MissingOrigin {
                path: raw.to_string(),
            });
        };
        let base = parse(&with_socket_scheme(origin.trim()))?;
        let joined = base.join(raw).map_err(|source| EndpointError::Invalid {
            endpoint: raw.to_string(),
            source,
        })?;
        return Ok(joined.into());
    }

    Ok(parse(&with_socket_scheme(raw))?.into())
}

fn with_socket_scheme(raw: &str) -> String {
    if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if raw.starts_with("ws://") || raw.starts_with("wss://") {
        raw.to_string()
    } else {
        format!("ws://{raw}")
    }
}

fn parse(endpoint: &str) -> Result<Url, EndpointError> {
    Url::parse(endpoint).map_err(|source| EndpointError::Invalid {
        endpoint: endpoint.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_schemes_map_to_socket_schemes() {
        assert_eq!(normalize("http://h:8080", None).unwrap(), "ws://h:8080/");
        assert_eq!(
            normalize("https://example.com/socket", None).unwrap(),
            "wss://example.com/socket"
        );
    }

    #[test]
    fn socket_schemes_pass_through() {
        assert_eq!(normalize("ws://h/live", None).unwrap(), "ws://h/live");
        assert_eq!(normalize("wss://h:9000/", None).unwrap(), "wss://h:9000/");
    }

    #[test]
    fn bare_hosts_default_to_ws() {
        assert_eq!(normalize("localhost:3000", None).unwrap(), "ws://localhost:3000/");
        assert_eq!(normalize("  example.org/ws ", None).unwrap(), "ws://example.org/ws");
    }

    #[test]
    fn absolute_paths_resolve_against_origin() {
        assert_eq!(
            normalize("/socket", Some("https://app.example.com")).unwrap(),
            "wss://app.example.com/socket"
        );
        assert_eq!(
            normalize("/socket", Some("127.0.0.1:8080")).unwrap(),
            "ws://127.0.0.1:8080/socket"
        );
    }

    #[test]
    fn unusable_inputs_are_rejected() {
        assert!(matches!(normalize("   ", None), Err(EndpointError::Empty)));
        assert!(matches!(
            normalize("/socket", None),
            Err(EndpointError::MissingOrigin { .. })
        ));
        assert!(matches!(
            normalize("http://", None),
            Err(EndpointError::Invalid { .. })
        ));
    }
}
