//! Connection-string enrichment
//!
//! Guarantees that every connection string carries the encryption, trust,
//! failover and application-identity parameters the collector relies on.
//! Keys that are already present are never overwritten.

use std::collections::HashSet;

use crate::error::ConnectError;

/// Parameters appended when absent, keyed by their normalized name
const REQUIRED: &[(&str, &str)] = &[
    ("encrypt", "encrypt=false;"),
    ("trustservercertificate", "TrustServerCertificate=true;"),
    ("multisubnetfailover", "MultiSubnetFailover=true;"),
];

/// Application name reported to SQL Server (`<crate>_<version>`)
pub fn default_application_name() -> String {
    format!("{}_{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Add missing connection parameters to `raw`
///
/// Idempotent: `enrich(&enrich(x)?)? == enrich(x)?`.
pub fn enrich(raw: &str) -> Result<String, ConnectError> {
    let base = raw.trim();
    if base.is_empty() {
        return Err(ConnectError::Address(
            "connection string must not be empty".to_string(),
        ));
    }

    let present = present_keys(base);
    let mut out = String::with_capacity(base.len() + 128);
    out.push_str(base);
    if !out.ends_with(';') {
        out.push(';');
    }

    for (key, fragment) in REQUIRED {
        if !present.contains(*key) {
            out.push_str(fragment);
        }
    }

    if !present.contains("applicationname") {
        out.push_str("Application Name=");
        out.push_str(&default_application_name());
        out.push(';');
    }

    Ok(out)
}

/// Normalized key set: lowercase with inner whitespace removed, so
/// `Application Name` and `applicationName` collide
fn present_keys(conn: &str) -> HashSet<String> {
    conn.split(';')
        .filter_map(|part| part.split_once('='))
        .map(|(key, _)| {
            key.chars()
                .filter(|c| !c.is_whitespace())
                .flat_map(char::to_lowercase)
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enrich_adds_missing_parameters() {
        let out = enrich("server=tcp:db01,1433").unwrap();
        assert_eq!(
            out,
            format!(
                "server=tcp:db01,1433;encrypt=false;TrustServerCertificate=true;MultiSubnetFailover=true;Application Name={};",
                default_application_name()
            )
        );
    }

    #[test]
    fn test_enrich_keeps_explicit_values() {
        let out = enrich("server=db;Encrypt=true;applicationName=dashboards;").unwrap();
        assert!(out.contains("Encrypt=true;"));
        assert!(!out.contains("encrypt=false"));
        assert!(out.contains("applicationName=dashboards;"));
        assert!(!out.contains("Application Name="));
        assert!(out.contains("TrustServerCertificate=true;"));
    }

    #[test]
    fn test_enrich_is_idempotent() {
        let once = enrich("  server=db02\\SQLEXPRESS  ").unwrap();
        let twice = enrich(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_key_match_is_on_boundaries() {
        // A value containing "encrypt=" must not count as the key being present
        let out = enrich("server=db;Application Name=encrypt=maybe").unwrap();
        assert!(out.contains("encrypt=false;"));
    }

    #[test]
    fn test_enrich_rejects_blank() {
        assert!(matches!(enrich("   "), Err(ConnectError::Address(_))));
    }
}
