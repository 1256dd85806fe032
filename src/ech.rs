//! ECH config acquisition and caching.
//!
//! The ECHConfigList for the gateway's public name is published in DNS as an
//! HTTPS (type 65) resource record, SvcParam key 5. We fetch it over DoH with
//! a wire-format query in the `dns` query parameter, and cache the raw bytes
//! for the lifetime of the process. Only the refresher writes the cache;
//! channel dials read it concurrently.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use log::{info, warn};
use parking_lot::RwLock;

/// DNS HTTPS resource record type.
const TYPE_HTTPS: u16 = 65;

/// SvcParamKey carrying the ECHConfigList.
const SVC_PARAM_ECH: u16 = 5;

const REFRESH_BACKOFF: Duration = Duration::from_secs(2);
const DOH_TIMEOUT: Duration = Duration::from_secs(3);

/// Where ECH config lists come from. The production implementation queries
/// DoH; tests substitute fixed bytes.
#[async_trait]
pub trait EchConfigSource: Send + Sync {
    async fn fetch_config(&self) -> std::io::Result<Vec<u8>>;
}

pub struct DohEchConfigSource {
    doh_url: String,
    domain: String,
    client: reqwest::Client,
}

impl DohEchConfigSource {
    pub fn new(doh_server: &str, domain: &str) -> std::io::Result<Self> {
        let doh_url = if doh_server.starts_with("https://") || doh_server.starts_with("http://") {
            doh_server.to_string()
        } else {
            format!("https://{}", doh_server)
        };
        let client = reqwest::Client::builder()
            .timeout(DOH_TIMEOUT)
            .build()
            .map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("Failed to build DoH client: {}", e),
                )
            })?;
        Ok(Self {
            doh_url,
            domain: domain.to_string(),
            client,
        })
    }
}

#[async_trait]
impl EchConfigSource for DohEchConfigSource {
    async fn fetch_config(&self) -> std::io::Result<Vec<u8>> {
        let query = build_dns_query(&self.domain, TYPE_HTTPS);
        let response = self
            .client
            .get(&self.doh_url)
            .query(&[("dns", URL_SAFE_NO_PAD.encode(&query))])
            .header("Accept", "application/dns-message")
            .header("Content-Type", "application/dns-message")
            .send()
            .await
            .map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("DoH request failed: {}", e),
                )
            })?;

        if !response.status().is_success() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("DoH server returned status {}", response.status()),
            ));
        }

        let body = response.bytes().await.map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to read DoH response: {}", e),
            )
        })?;

        match parse_dns_response(&body)? {
            Some(ech) => Ok(ech),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No ECH config in HTTPS record for {}", self.domain),
            )),
        }
    }
}

/// Process-lifetime cache of the most recently fetched ECHConfigList.
pub struct EchConfigCache {
    source: Box<dyn EchConfigSource>,
    cached: RwLock<Option<Vec<u8>>>,
}

impl EchConfigCache {
    pub fn new(source: Box<dyn EchConfigSource>) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
        }
    }

    /// Block until an ECH config has been fetched, retrying every 2 seconds.
    /// Called once at startup before any channel dials.
    pub async fn prepare(&self) {
        loop {
            match self.refresh().await {
                Ok(len) => {
                    info!("[ech] config list cached ({} bytes)", len);
                    return;
                }
                Err(e) => {
                    warn!("[ech] fetch failed: {}, retrying in 2s", e);
                    tokio::time::sleep(REFRESH_BACKOFF).await;
                }
            }
        }
    }

    /// Single fetch attempt; on success the cache is replaced.
    pub async fn refresh(&self) -> std::io::Result<usize> {
        let config = self.source.fetch_config().await?;
        if config.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Fetched an empty ECH config list",
            ));
        }
        let len = config.len();
        *self.cached.write() = Some(config);
        Ok(len)
    }

    pub fn get(&self) -> std::io::Result<Vec<u8>> {
        match self.cached.read().as_ref() {
            Some(config) => Ok(config.clone()),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "ECH config not loaded yet",
            )),
        }
    }
}

fn build_dns_query(domain: &str, qtype: u16) -> Vec<u8> {
    let mut query = Vec::with_capacity(17 + domain.len() + 2);
    // Header: id, flags (standard query, RD), QDCOUNT=1, AN/NS/AR=0.
    query.extend_from_slice(&[0x00, 0x01, 0x01, 0x00, 0x00, 0x01]);
    query.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in domain.split('.') {
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0x00);
    query.extend_from_slice(&qtype.to_be_bytes());
    query.extend_from_slice(&[0x00, 0x01]); // class IN
    query
}

/// Walk the answer section of a DNS response and return the first ECH config
/// found in an HTTPS record. `Ok(None)` means a well-formed response without
/// one.
fn parse_dns_response(response: &[u8]) -> std::io::Result<Option<Vec<u8>>> {
    if response.len() < 12 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "DNS response too short",
        ));
    }
    let ancount = u16::from_be_bytes([response[6], response[7]]);
    if ancount == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "DNS response has no answer records",
        ));
    }

    // Skip the question section.
    let mut offset = 12;
    while offset < response.len() && response[offset] != 0 {
        offset += response[offset] as usize + 1;
    }
    offset += 5; // null label + qtype + qclass

    for _ in 0..ancount {
        if offset >= response.len() {
            break;
        }
        // NAME, possibly a compression pointer.
        if response[offset] & 0xc0 == 0xc0 {
            offset += 2;
        } else {
            while offset < response.len() && response[offset] != 0 {
                offset += response[offset] as usize + 1;
            }
            offset += 1;
        }
        if offset + 10 > response.len() {
            break;
        }
        let rr_type = u16::from_be_bytes([response[offset], response[offset + 1]]);
        offset += 8; // type(2) + class(2) + ttl(4)
        let data_len = u16::from_be_bytes([response[offset], response[offset + 1]]) as usize;
        offset += 2;
        if offset + data_len > response.len() {
            break;
        }
        let data = &response[offset..offset + data_len];
        offset += data_len;

        if rr_type == TYPE_HTTPS {
            if let Some(ech) = parse_https_record(data) {
                return Ok(Some(ech));
            }
        }
    }
    Ok(None)
}

/// Extract SvcParamKey 5 (echconfig) from HTTPS record RDATA. All other
/// SvcParams are skipped uninterpreted.
fn parse_https_record(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < 2 {
        return None;
    }
    // Skip SvcPriority.
    let mut offset = 2;
    // Skip TargetName (uncompressed labels, empty for "." in service mode).
    while offset < data.len() && data[offset] != 0 {
        offset += data[offset] as usize + 1;
    }
    offset += 1;

    while offset + 4 <= data.len() {
        let key = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        if offset + length > data.len() {
            break;
        }
        if key == SVC_PARAM_ECH {
            return Some(data[offset..offset + length].to_vec());
        }
        offset += length;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn https_rdata(params: &[(u16, &[u8])]) -> Vec<u8> {
        let mut rdata = vec![0x00, 0x01, 0x00]; // priority 1, root target
        for (key, value) in params {
            rdata.extend_from_slice(&key.to_be_bytes());
            rdata.extend_from_slice(&(value.len() as u16).to_be_bytes());
            rdata.extend_from_slice(value);
        }
        rdata
    }

    fn dns_response(rr_type: u16, rdata: &[u8]) -> Vec<u8> {
        let mut response = Vec::new();
        // Header: id, flags (response), QDCOUNT=1, ANCOUNT=1.
        response.extend_from_slice(&[0x00, 0x01, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01]);
        response.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        // Question: example.com HTTPS IN
        response.extend_from_slice(b"\x07example\x03com\x00");
        response.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
        response.extend_from_slice(&[0x00, 0x01]);
        // Answer with a compression pointer to the question name.
        response.extend_from_slice(&[0xc0, 0x0c]);
        response.extend_from_slice(&rr_type.to_be_bytes());
        response.extend_from_slice(&[0x00, 0x01]); // class IN
        response.extend_from_slice(&[0x00, 0x00, 0x0e, 0x10]); // ttl
        response.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        response.extend_from_slice(rdata);
        response
    }

    #[test]
    fn test_build_dns_query() {
        let query = build_dns_query("example.com", TYPE_HTTPS);
        // QDCOUNT
        assert_eq!(&query[4..6], &[0x00, 0x01]);
        // QNAME
        let name_start = 12;
        assert_eq!(&query[name_start..name_start + 13], b"\x07example\x03com\x00");
        // QTYPE 65, QCLASS IN
        assert_eq!(&query[query.len() - 4..], &[0x00, 0x41, 0x00, 0x01]);
    }

    #[test]
    fn test_parse_ech_from_https_record() {
        let ech = b"\x00\x08ech-data";
        let rdata = https_rdata(&[(1, b"\x02h2"), (SVC_PARAM_ECH, ech)]);
        let response = dns_response(TYPE_HTTPS, &rdata);
        let parsed = parse_dns_response(&response).unwrap().unwrap();
        assert_eq!(parsed, ech);
    }

    #[test]
    fn test_parse_skips_other_svc_params() {
        let rdata = https_rdata(&[(1, b"\x02h2"), (4, &[1, 2, 3, 4])]);
        let response = dns_response(TYPE_HTTPS, &rdata);
        assert!(parse_dns_response(&response).unwrap().is_none());
    }

    #[test]
    fn test_parse_ignores_non_https_records() {
        let response = dns_response(1, &[127, 0, 0, 1]);
        assert!(parse_dns_response(&response).unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_truncated_responses() {
        assert!(parse_dns_response(&[0x00; 4]).is_err());

        let rdata = https_rdata(&[(SVC_PARAM_ECH, b"ech")]);
        let mut response = dns_response(TYPE_HTTPS, &rdata);
        response.truncate(response.len() - 2);
        // Truncated mid-record: no config found, but not a panic.
        assert!(parse_dns_response(&response).unwrap().is_none());
    }

    #[test]
    fn test_parse_empty_answer_section() {
        let mut response = dns_response(TYPE_HTTPS, &[]);
        response[7] = 0; // ANCOUNT = 0
        assert!(parse_dns_response(&response).is_err());
    }

    struct FixedSource(Vec<u8>);

    #[async_trait]
    impl EchConfigSource for FixedSource {
        async fn fetch_config(&self) -> std::io::Result<Vec<u8>> {
            if self.0.is_empty() {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "no data"))
            } else {
                Ok(self.0.clone())
            }
        }
    }

    #[tokio::test]
    async fn test_cache_refresh_and_get() {
        let cache = EchConfigCache::new(Box::new(FixedSource(b"configlist".to_vec())));
        assert!(cache.get().is_err());
        assert_eq!(cache.refresh().await.unwrap(), 10);
        assert_eq!(cache.get().unwrap(), b"configlist");
    }

    #[tokio::test]
    async fn test_cache_keeps_old_value_on_failed_refresh() {
        let cache = EchConfigCache::new(Box::new(FixedSource(b"old".to_vec())));
        cache.refresh().await.unwrap();

        let failing = EchConfigCache {
            source: Box::new(FixedSource(Vec::new())),
            cached: RwLock::new(Some(b"old".to_vec())),
        };
        assert!(failing.refresh().await.is_err());
        assert_eq!(failing.get().unwrap(), b"old");
    }
}
