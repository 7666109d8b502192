//! Client geolocation

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::debug;

/// Maps a client address to a country code, best effort
pub trait Geolocator: Send + Sync {
    /// Country code for `ip`, or `None` when unknown
    fn lookup(&self, ip: IpAddr) -> Option<String>;
}

/// Knows nothing; every lookup is empty
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeolocation;

impl Geolocator for NoGeolocation {
    fn lookup(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// Fixed address table, loaded from configuration
#[derive(Debug, Default, Clone)]
pub struct StaticGeolocator {
    countries: HashMap<IpAddr, String>,
}

impl StaticGeolocator {
    pub fn new(countries: HashMap<IpAddr, String>) -> Self {
        Self { countries }
    }
}

impl Geolocator for StaticGeolocator {
    fn lookup(&self, ip: IpAddr) -> Option<String> {
        let country = self.countries.get(&ip).cloned();
        debug!(%ip, ?country, "StaticGeolocator::lookup");
        country
    }
}

/// Country for `ip`, or the empty string
pub fn country_or_empty(geolocator: &dyn Geolocator, ip: Option<IpAddr>) -> String {
    ip.and_then(|ip| geolocator.lookup(ip)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_lookup() {
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        let geo = StaticGeolocator::new(HashMap::from([(ip, "NZ".to_string())]));
        assert_eq!(geo.lookup(ip), Some("NZ".to_string()));
        assert_eq!(geo.lookup("192.0.2.8".parse().unwrap()), None);
    }

    #[test]
    fn test_failure_yields_empty_country() {
        assert_eq!(country_or_empty(&NoGeolocation, "192.0.2.7".parse().ok()), "");
        assert_eq!(country_or_empty(&StaticGeolocator::default(), None), "");
    }
}
