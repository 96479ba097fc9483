use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::{info, warn};

enum ProxyResolution {
    UseProxy(String),
    ForceDirectConnect,
    /// Leave reqwest to read `HTTPS_PROXY` / `HTTP_PROXY`.
    FromEnv,
}

/// Match `host` against `no_proxy` rules: exact host, `*.domain` (subdomains
/// only) and `.domain` (domain and subdomains).
fn is_no_proxy(host: &str, no_proxy_list: &[String]) -> bool {
    let host = host.to_lowercase();
    no_proxy_list.iter().any(|rule| {
        let r = rule.trim().to_lowercase();
        if r.is_empty() {
            false
        } else if let Some(suffix) = r.strip_prefix("*.") {
            host.ends_with(&format!(".{}", suffix))
        } else if let Some(suffix) = r.strip_prefix('.') {
            host == suffix || host.ends_with(&format!(".{}", suffix))
        } else {
            host == r
        }
    })
}

fn extract_host(url: &str) -> Option<String> {
    let without_scheme = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => url,
    };
    let authority = without_scheme.split('/').next()?.rsplit('@').next()?;
    let host = if let Some(rest) = authority.strip_prefix('[') {
        rest.split(']').next()?
    } else {
        authority.split(':').next()?
    };
    Some(host.to_string())
}

fn resolve_proxy(proxy: Option<&str>, no_proxy: &[String], api_base: &str) -> ProxyResolution {
    match proxy {
        Some("") => ProxyResolution::ForceDirectConnect,
        Some(p) => {
            let bypass = extract_host(api_base)
                .map(|host| is_no_proxy(&host, no_proxy))
                .unwrap_or(false);
            if bypass {
                ProxyResolution::ForceDirectConnect
            } else {
                ProxyResolution::UseProxy(p.to_string())
            }
        }
        None => ProxyResolution::FromEnv,
    }
}

/// Build the HTTP client used for LLM calls.
pub fn build_http_client(
    proxy: Option<&str>,
    no_proxy: &[String],
    api_base: &str,
    timeout: Duration,
) -> Client {
    let mut builder = Client::builder().timeout(timeout);

    match resolve_proxy(proxy, no_proxy, api_base) {
        ProxyResolution::UseProxy(proxy_url) => match Proxy::all(&proxy_url) {
            Ok(p) => {
                info!(proxy = %proxy_url, api_base = %api_base, "LLM provider using proxy");
                builder = builder.proxy(p);
            }
            Err(e) => {
                warn!(error = %e, proxy = %proxy_url, "Invalid proxy URL, falling back to direct connect");
            }
        },
        ProxyResolution::ForceDirectConnect => {
            info!(api_base = %api_base, "LLM provider forced to direct connect");
            builder = builder.no_proxy();
        }
        ProxyResolution::FromEnv => {}
    }

    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client, using default");
        Client::new()
    })
}
