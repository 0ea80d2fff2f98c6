use thiserror::Error;

/// Version advertised to the tunnel server in every registration request.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompatError {
    #[error("invalid server version {0:?}")]
    Invalid(String),
    #[error("incompatible server version {server} (client {client})")]
    Incompatible { server: String, client: String },
}

/// Checks whether a server advertising `server` can talk to this client.
///
/// Majors must match. While the major is 0 the minor is treated as the
/// breaking component, so it must match as well. Patch, pre-release and build
/// metadata never matter.
pub fn compat_server(server: &str) -> Result<(), CompatError> {
    compat(VERSION, server)
}

fn compat(client: &str, server: &str) -> Result<(), CompatError> {
    let s = parse(server).ok_or_else(|| CompatError::Invalid(server.to_string()))?;
    let c = parse(client).ok_or_else(|| CompatError::Invalid(client.to_string()))?;

    let ok = if c.0 == 0 {
        s.0 == 0 && s.1 == c.1
    } else {
        s.0 == c.0
    };
    if !ok {
        return Err(CompatError::Incompatible {
            server: server.trim().to_string(),
            client: client.to_string(),
        });
    }
    Ok(())
}

fn parse(v: &str) -> Option<(u64, u64, u64)> {
    let v = v.trim();
    let v = v.strip_prefix('v').unwrap_or(v);
    let core = v.split(['-', '+']).next()?;

    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}
