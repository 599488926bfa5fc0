use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;

use crate::NetworkError;

/// Finds peers through DNS.
///
/// Looks up SRV records at `_weft._tcp.<zone>` first; when the zone has
/// none, reads TXT records of `<zone>` holding `host:port` entries.
#[derive(Clone)]
pub struct DnsResolver {
    zone: String,
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    /// Resolve through the system DNS configuration, or public defaults
    /// when none can be read.
    pub fn new(zone: impl Into<String>) -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            tracing::warn!("System DNS config unavailable ({e}), using defaults");
            TokioAsyncResolver::tokio(Default::default(), Default::default())
        });
        Self::with_resolver(zone, resolver)
    }

    pub fn with_resolver(zone: impl Into<String>, resolver: TokioAsyncResolver) -> Self {
        Self {
            zone: zone.into().trim_end_matches('.').to_string(),
            resolver,
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub(crate) fn srv_name(&self) -> String {
        format!("_weft._tcp.{}.", self.zone)
    }

    pub(crate) async fn resolve(&self) -> Result<Vec<String>, NetworkError> {
        match self.resolver.srv_lookup(self.srv_name()).await {
            Ok(lookup) => {
                let mut records: Vec<(u16, u16, String)> = lookup
                    .iter()
                    .map(|srv| {
                        let host = srv.target().to_utf8();
                        let host = host.trim_end_matches('.');
                        (srv.priority(), srv.weight(), format!("{host}:{}", srv.port()))
                    })
                    .collect();
                // Lowest priority first, heavier weight first within one.
                records.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
                if !records.is_empty() {
                    return Ok(records.into_iter().map(|(_, _, addr)| addr).collect());
                }
            }
            Err(e) if is_no_records(&e) => {}
            Err(e) => return Err(NetworkError::Resolve(format!("SRV {}: {e}", self.srv_name()))),
        }

        let name = format!("{}.", self.zone);
        match self.resolver.txt_lookup(name.as_str()).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .flat_map(|txt| {
                    txt.txt_data()
                        .iter()
                        .flat_map(|chunk| parse_txt(&String::from_utf8_lossy(chunk)))
                        .collect::<Vec<_>>()
                })
                .collect()),
            Err(e) if is_no_records(&e) => Ok(Vec::new()),
            Err(e) => Err(NetworkError::Resolve(format!("TXT {name}: {e}"))),
        }
    }
}

fn is_no_records(error: &ResolveError) -> bool {
    matches!(error.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

/// Split a TXT string into `host:port` entries (comma or space separated).
fn parse_txt(text: &str) -> Vec<String> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|entry| {
            entry
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
        })
        .map(str::to_string)
        .collect()
}
