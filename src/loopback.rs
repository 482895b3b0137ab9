use std::sync::OnceLock;

use reqwest::Url;

/// When this service runs inside a container, URLs that point at `localhost` actually
/// mean "the container's loopback interface", not the host machine the request was
/// meant to reach (e.g. a presigned URL pointed at a host-local test double, or a
/// background image fetch against a dev server on the operator's machine). This
/// rewrites such hostnames to the platform's host-reachable alias and preserves the
/// original authority in a `Host` header, so the request still looks unchanged to
/// whatever receives it.
const HOST_ALIAS_ENV: &str = "CAP_HOST_ALIAS";
const DEFAULT_HOST_ALIAS: &str = "host.docker.internal";
const CONTAINER_MARKER: &str = "/.dockerenv";
const CONTAINER_ENV_HINT: &str = "CAP_CONTAINERIZED";

static IN_CONTAINER: OnceLock<bool> = OnceLock::new();

fn in_container() -> bool {
    *IN_CONTAINER.get_or_init(detect_container)
}

fn detect_container() -> bool {
    std::path::Path::new(CONTAINER_MARKER).exists()
        || std::env::var(CONTAINER_ENV_HINT)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
}

fn host_alias() -> String {
    std::env::var(HOST_ALIAS_ENV).unwrap_or_else(|_| DEFAULT_HOST_ALIAS.to_string())
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Pure rewrite used by both the real bridge and tests: no global state, no env reads.
fn bridge_with(containerized: bool, alias: &str, url: &Url) -> (Url, Option<String>) {
    if !containerized {
        return (url.clone(), None);
    }
    let Some(host) = url.host_str() else {
        return (url.clone(), None);
    };
    if !is_loopback_host(host) {
        return (url.clone(), None);
    }

    let original_authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut rewritten = url.clone();
    let _ = rewritten.set_host(Some(alias));
    (rewritten, Some(original_authority))
}

/// Rewrites `url` if it targets a loopback host and this process is running in a
/// container. Returns the original `Host: authority` to send alongside the rewritten
/// request, if a rewrite happened.
pub fn bridge(url: &Url) -> (Url, Option<String>) {
    bridge_with(in_container(), &host_alias(), url)
}

/// Applies the loopback bridge to an outbound GET, setting the `Host` header when a
/// rewrite occurred. Presigned uploads and background-image fetches build their own
/// request from the bridged URL instead, since they need methods other than GET.
pub fn get(client: &reqwest::Client, url: &Url) -> reqwest::RequestBuilder {
    let (bridged, original_host) = bridge(url);
    let mut builder = client.get(bridged);
    if let Some(host) = original_host {
        builder = builder.header(reqwest::header::HOST, host);
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_through_when_not_containerized() {
        let url = Url::parse("http://127.0.0.1:8080/upload").unwrap();
        let (bridged, host) = bridge_with(false, DEFAULT_HOST_ALIAS, &url);
        assert_eq!(bridged, url);
        assert!(host.is_none());
    }

    #[test]
    fn passes_through_non_loopback_hosts() {
        let url = Url::parse("https://example.com/video.mp4").unwrap();
        let (bridged, host) = bridge_with(true, DEFAULT_HOST_ALIAS, &url);
        assert_eq!(bridged, url);
        assert!(host.is_none());
    }

    #[test]
    fn rewrites_loopback_host_and_preserves_port_in_host_header() {
        let url = Url::parse("http://127.0.0.1:8080/upload").unwrap();
        let (bridged, host) = bridge_with(true, DEFAULT_HOST_ALIAS, &url);
        assert_eq!(bridged.host_str(), Some(DEFAULT_HOST_ALIAS));
        assert_eq!(host.as_deref(), Some("127.0.0.1:8080"));
    }

    #[test]
    fn rewrites_localhost_without_port() {
        let url = Url::parse("http://localhost/thumb.jpg").unwrap();
        let (bridged, host) = bridge_with(true, DEFAULT_HOST_ALIAS, &url);
        assert_eq!(bridged.host_str(), Some(DEFAULT_HOST_ALIAS));
        assert_eq!(host.as_deref(), Some("localhost"));
    }
}
