use actix_web::dev::ServiceRequest;
use actix_web::http::header::HeaderName;
use std::net::{IpAddr, Ipv6Addr};

/// Key shared by all callers for whom no key component could be resolved.
///
/// Such callers draw from a single common quota rather than being refused;
/// an unidentifiable client is throttled, not errored.
pub const SHARED_FALLBACK_KEY: &str = "unidentified";

type CustomFn = Box<dyn Fn(&ServiceRequest) -> Option<String>>;

/// Builds the throttle-key extraction function for a limiter.
///
/// A key is assembled from one or more components of the incoming request,
/// joined with `-`. Components that cannot be resolved for a given request
/// are skipped; if nothing resolves the request falls back to
/// [SHARED_FALLBACK_KEY]. Make sure distinct limiters sharing one registry
/// produce non-overlapping keys.
pub struct ClientKeyBuilder {
    real_ip: bool,
    peer_ip: bool,
    path: bool,
    headers: Vec<HeaderName>,
    custom_fn: Option<CustomFn>,
}

impl ClientKeyBuilder {
    pub fn new() -> Self {
        Self {
            real_ip: false,
            peer_ip: false,
            path: false,
            headers: Vec::new(),
            custom_fn: None,
        }
    }

    /// Key on the client's proxy-reported IP.
    ///
    /// # Security
    ///
    /// This reads
    /// [ConnectionInfo::realip_remote_addr()](actix_web::dev::ConnectionInfo::realip_remote_addr),
    /// which trusts the `Forwarded`/`X-Forwarded-For` headers and is only
    /// suitable behind a proxy that you control.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses are grouped into a single key per /64 subnet.
    pub fn real_ip(mut self) -> Self {
        self.real_ip = true;
        self
    }

    /// Key on the connection peer IP.
    ///
    /// This is the default strategy, suitable when clients connect to the
    /// application directly.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses are grouped into a single key per /64 subnet.
    pub fn peer_ip(mut self) -> Self {
        self.peer_ip = true;
        self
    }

    /// Add the request path to the key.
    pub fn path(mut self) -> Self {
        self.path = true;
        self
    }

    /// Add the value of a request header to the key.
    ///
    /// Combined with an IP component this produces the composite key used
    /// for authentication endpoints, where the header carries the submitted
    /// credential identifier. An absent or empty header is skipped.
    pub fn header(mut self, name: HeaderName) -> Self {
        self.headers.push(name);
        self
    }

    /// Derive a custom key component from the request.
    ///
    /// Returning `None` skips the component for that request.
    pub fn custom_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Option<String> + 'static,
    {
        self.custom_fn = Some(Box::new(f));
        self
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> String + 'static {
        move |req| {
            let mut components = Vec::new();
            {
                let info = req.connection_info();
                if self.real_ip {
                    if let Some(addr) = info.realip_remote_addr() {
                        components.push(ip_key(addr));
                    }
                }
                if self.peer_ip {
                    if let Some(addr) = info.peer_addr() {
                        components.push(ip_key(addr));
                    }
                }
            }
            if self.path {
                components.push(req.path().to_owned());
            }
            for name in &self.headers {
                if let Some(value) = req.headers().get(name).and_then(|v| v.to_str().ok()) {
                    if !value.is_empty() {
                        components.push(value.to_owned());
                    }
                }
            }
            if let Some(f) = &self.custom_fn {
                if let Some(component) = f(req) {
                    components.push(component);
                }
            }
            if components.is_empty() {
                SHARED_FALLBACK_KEY.to_owned()
            } else {
                components.join("-")
            }
        }
    }
}

impl Default for ClientKeyBuilder {
    fn default() -> Self {
        Self::new().peer_ip()
    }
}

// Groups IPv6 addresses per /64, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
fn ip_key(addr: &str) -> String {
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.to_string(),
        Ok(IpAddr::V6(v6)) => {
            if let Some(v4) = v6.to_ipv4() {
                return v4.to_string();
            }
            let s = v6.segments();
            let subnet = Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0);
            format!("{subnet}/64")
        }
        // Not an IP at all (e.g. a unix socket peer); use it verbatim.
        Err(_) => addr.to_owned(),
    }
}
