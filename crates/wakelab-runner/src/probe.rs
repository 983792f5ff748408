use serde::Serialize;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use wakelab_core::{RunContext, ServiceEndpoint};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// TCP reachability of a single endpoint. Refusal, timeout, and resolution
/// failure all read as unreachable; nothing here is an error.
pub fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(_) => return false,
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            return true;
        }
    }
    false
}

/// Lightweight DNS sanity check before any clone/fetch is attempted.
pub fn dns_resolves(host: &str) -> bool {
    (host, 443u16).to_socket_addrs().is_ok()
}

/// One collaborator service, probed against its advertised address and
/// against loopback. The two answers are kept apart: a service may listen
/// only locally or only on the advertised interface.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReachability {
    pub endpoint: ServiceEndpoint,
    pub advertised: bool,
    pub loopback: bool,
}

impl ServiceReachability {
    pub fn any(&self) -> bool {
        self.advertised || self.loopback
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub piper: ServiceReachability,
    pub oww: ServiceReachability,
}

fn probe_endpoint(endpoint: &ServiceEndpoint, timeout: Duration) -> ServiceReachability {
    let advertised = probe(&endpoint.host, endpoint.port, timeout);
    let loopback = if endpoint.host == "127.0.0.1" {
        advertised
    } else {
        probe("127.0.0.1", endpoint.port, timeout)
    };
    ServiceReachability {
        endpoint: endpoint.clone(),
        advertised,
        loopback,
    }
}

pub fn probe_services(ctx: &RunContext) -> ProbeReport {
    ProbeReport {
        piper: probe_endpoint(&ctx.piper, DEFAULT_PROBE_TIMEOUT),
        oww: probe_endpoint(&ctx.oww, DEFAULT_PROBE_TIMEOUT),
    }
}
